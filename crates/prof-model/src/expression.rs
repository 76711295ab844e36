//! Arithmetic expression trees for metric formulas.
//!
//! Nodes live in a flat pool addressed by index so an Expression is a single
//! allocation regardless of depth. Variables carry an opaque `u64` uservalue
//! whose meaning depends on the owner: a Partial slot index inside a
//! Statistic, or an index into an ExtraStatistic's metric list.

/// Index of a node within its owning Expression pool.
pub type NodeId = usize;

/// Operator kinds. Wire tags are shared with the packed transport: 0 is
/// constant, 1 variable, 2 subexpression, operators start at 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    Sum = 3,
    Sub = 4,
    Neg = 5,
    Prod = 6,
    Div = 7,
    Pow = 8,
    Sqrt = 9,
    Log = 10,
    Ln = 11,
    Min = 12,
    Max = 13,
    Floor = 14,
    Ceil = 15,
}

impl OpKind {
    pub fn from_tag(tag: u8) -> Option<OpKind> {
        Some(match tag {
            3 => OpKind::Sum,
            4 => OpKind::Sub,
            5 => OpKind::Neg,
            6 => OpKind::Prod,
            7 => OpKind::Div,
            8 => OpKind::Pow,
            9 => OpKind::Sqrt,
            10 => OpKind::Log,
            11 => OpKind::Ln,
            12 => OpKind::Min,
            13 => OpKind::Max,
            14 => OpKind::Floor,
            15 => OpKind::Ceil,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(f64),
    Variable(u64),
    /// Marks a shared/nameable subtree; evaluation passes through.
    SubExpression(NodeId),
    Op { kind: OpKind, args: Vec<NodeId> },
}

/// An arithmetic expression over constants and opaque variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Expression {
    pub fn constant(v: f64) -> Self {
        Expression { nodes: vec![Node::Constant(v)], root: 0 }
    }

    pub fn variable(uservalue: u64) -> Self {
        Expression { nodes: vec![Node::Variable(uservalue)], root: 0 }
    }

    /// Combine child expressions under an operator, merging their pools.
    pub fn op(kind: OpKind, children: Vec<Expression>) -> Self {
        let mut nodes = Vec::new();
        let mut args = Vec::with_capacity(children.len());
        for child in children {
            let base = nodes.len();
            nodes.extend(child.nodes.into_iter().map(|n| match n {
                Node::SubExpression(id) => Node::SubExpression(id + base),
                Node::Op { kind, args } => Node::Op {
                    kind,
                    args: args.into_iter().map(|a| a + base).collect(),
                },
                other => other,
            }));
            args.push(base + child.root);
        }
        let root = nodes.len();
        nodes.push(Node::Op { kind, args });
        Expression { nodes, root }
    }

    /// Mark this whole expression as a shareable subexpression.
    pub fn into_subexpression(mut self) -> Self {
        let inner = self.root;
        self.nodes.push(Node::SubExpression(inner));
        self.root = self.nodes.len() - 1;
        self
    }

    pub fn root(&self) -> NodeId {
        self.root
    }
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Evaluate under the given variable environment.
    pub fn evaluate(&self, var: &dyn Fn(u64) -> f64) -> f64 {
        self.eval_node(self.root, var)
    }

    fn eval_node(&self, id: NodeId, var: &dyn Fn(u64) -> f64) -> f64 {
        match &self.nodes[id] {
            Node::Constant(c) => *c,
            Node::Variable(u) => var(*u),
            Node::SubExpression(inner) => self.eval_node(*inner, var),
            Node::Op { kind, args } => {
                let mut vals = args.iter().map(|&a| self.eval_node(a, var));
                match kind {
                    OpKind::Sum => vals.sum(),
                    OpKind::Sub => {
                        let first = vals.next().unwrap_or(0.0);
                        vals.fold(first, |acc, v| acc - v)
                    }
                    OpKind::Neg => -vals.next().unwrap_or(0.0),
                    OpKind::Prod => vals.product(),
                    OpKind::Div => {
                        let first = vals.next().unwrap_or(0.0);
                        vals.fold(first, |acc, v| acc / v)
                    }
                    OpKind::Pow => {
                        let base = vals.next().unwrap_or(0.0);
                        let exp = vals.next().unwrap_or(1.0);
                        base.powf(exp)
                    }
                    OpKind::Sqrt => vals.next().unwrap_or(0.0).sqrt(),
                    OpKind::Log => vals.next().unwrap_or(0.0).log10(),
                    OpKind::Ln => vals.next().unwrap_or(0.0).ln(),
                    OpKind::Min => vals.fold(f64::INFINITY, f64::min),
                    OpKind::Max => vals.fold(f64::NEG_INFINITY, f64::max),
                    OpKind::Floor => vals.next().unwrap_or(0.0).floor(),
                    OpKind::Ceil => vals.next().unwrap_or(0.0).ceil(),
                }
            }
        }
    }

    /// Depth-first traversal with pre/variable/post callbacks. `pre` runs
    /// before descending into an operator, `post` after.
    pub fn visit(
        &self,
        pre: &mut dyn FnMut(&Node),
        var: &mut dyn FnMut(u64),
        post: &mut dyn FnMut(&Node),
    ) {
        self.visit_node(self.root, pre, var, post);
    }

    fn visit_node(
        &self,
        id: NodeId,
        pre: &mut dyn FnMut(&Node),
        var: &mut dyn FnMut(u64),
        post: &mut dyn FnMut(&Node),
    ) {
        let node = &self.nodes[id];
        match node {
            Node::Constant(_) => {
                pre(node);
                post(node);
            }
            Node::Variable(u) => var(*u),
            Node::SubExpression(inner) => {
                pre(node);
                self.visit_node(*inner, pre, var, post);
                post(node);
            }
            Node::Op { args, .. } => {
                pre(node);
                for &a in args {
                    self.visit_node(a, pre, var, post);
                }
                post(node);
            }
        }
    }

    /// Render to a human-readable formula string; `var` names variables.
    pub fn render(&self, var: &dyn Fn(u64) -> String) -> String {
        self.render_node(self.root, var)
    }

    fn render_node(&self, id: NodeId, var: &dyn Fn(u64) -> String) -> String {
        match &self.nodes[id] {
            Node::Constant(c) => {
                if c.fract() == 0.0 && c.abs() < 1e15 {
                    format!("{}", *c as i64)
                } else {
                    format!("{c}")
                }
            }
            Node::Variable(u) => var(*u),
            Node::SubExpression(inner) => self.render_node(*inner, var),
            Node::Op { kind, args } => {
                let parts: Vec<String> =
                    args.iter().map(|&a| self.render_node(a, var)).collect();
                match kind {
                    OpKind::Sum => format!("({})", parts.join(" + ")),
                    OpKind::Sub => format!("({})", parts.join(" - ")),
                    OpKind::Neg => format!("-{}", parts.first().cloned().unwrap_or_default()),
                    OpKind::Prod => format!("({})", parts.join(" * ")),
                    OpKind::Div => format!("({})", parts.join(" / ")),
                    OpKind::Pow => format!("({})", parts.join(" ^ ")),
                    OpKind::Sqrt => format!("sqrt({})", parts.join(", ")),
                    OpKind::Log => format!("log10({})", parts.join(", ")),
                    OpKind::Ln => format!("ln({})", parts.join(", ")),
                    OpKind::Min => format!("min({})", parts.join(", ")),
                    OpKind::Max => format!("max({})", parts.join(", ")),
                    OpKind::Floor => format!("floor({})", parts.join(", ")),
                    OpKind::Ceil => format!("ceil({})", parts.join(", ")),
                }
            }
        }
    }

    /// All distinct variable uservalues, in first-appearance order.
    pub fn variables(&self) -> Vec<u64> {
        let mut out = Vec::new();
        self.visit(&mut |_| {}, &mut |u| {
            if !out.contains(&u) {
                out.push(u);
            }
        }, &mut |_| {});
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Box<dyn Fn(u64) -> f64> {
        Box::new(|u| u as f64)
    }

    #[test]
    fn arithmetic() {
        // (v0 + v1) / 2
        let e = Expression::op(
            OpKind::Div,
            vec![
                Expression::op(
                    OpKind::Sum,
                    vec![Expression::variable(4), Expression::variable(8)],
                ),
                Expression::constant(2.0),
            ],
        );
        assert_eq!(e.evaluate(&*identity()), 6.0);
    }

    #[test]
    fn stddev_shape() {
        // sqrt(v1/n - (v0/n)^2), the canonical stddev over (sum, sumsq)
        let n = 4.0;
        let mean = Expression::op(
            OpKind::Div,
            vec![Expression::variable(0), Expression::constant(n)],
        );
        let e = Expression::op(
            OpKind::Sqrt,
            vec![Expression::op(
                OpKind::Sub,
                vec![
                    Expression::op(
                        OpKind::Div,
                        vec![Expression::variable(1), Expression::constant(n)],
                    ),
                    Expression::op(OpKind::Pow, vec![mean, Expression::constant(2.0)]),
                ],
            )],
        );
        // samples: 1 1 3 3 -> sum=8 sumsq=20 -> var = 5 - 4 = 1
        let env = |u: u64| if u == 0 { 8.0 } else { 20.0 };
        assert!((e.evaluate(&env) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn variables_in_order() {
        let e = Expression::op(
            OpKind::Sum,
            vec![
                Expression::variable(3),
                Expression::variable(1),
                Expression::variable(3),
            ],
        );
        assert_eq!(e.variables(), vec![3, 1]);
    }

    #[test]
    fn min_max_fold() {
        let e = Expression::op(
            OpKind::Min,
            vec![Expression::constant(2.0), Expression::constant(-1.0)],
        );
        assert_eq!(e.evaluate(&|_| 0.0), -1.0);
        let e = Expression::op(
            OpKind::Max,
            vec![Expression::constant(2.0), Expression::constant(-1.0)],
        );
        assert_eq!(e.evaluate(&|_| 0.0), 2.0);
    }
}
