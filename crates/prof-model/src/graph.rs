//! Flow graphs and reconstructions for samples with unknown call chains.
//!
//! A `ContextFlowGraph` symbolically describes the possible routes from some
//! entry function to a sampled Scope. A `ContextReconstruction` instantiates
//! those routes as real Contexts beneath a concrete root, and receives the
//! metric values that could not be attributed directly.

use crate::context::Context;
use crate::metric::Metric;
use crate::scope::Scope;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

/// One possible route to the graph's scope: the entry Scope (an uncalled
/// function) followed by the chain of call sites leading to the sample.
#[derive(Debug, Clone)]
pub struct Template {
    pub entry: Scope,
    pub path: Vec<Scope>,
}

/// How one Metric's values relate to a reconstruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricHandling {
    /// Value belongs inside the reconstructed region (at the sampled scope).
    pub interior: bool,
    /// Value belongs at the entries, outside the reconstructed region.
    pub exterior: bool,
    /// Exterior value that also attributes logically to the root itself.
    pub exterior_logical: bool,
}

pub type MetricHandler = Box<dyn Fn(&Metric) -> MetricHandling + Send + Sync>;

#[derive(Default)]
struct GraphBuilder {
    templates: Vec<Template>,
    handler: Option<MetricHandler>,
    /// Scopes whose graphs must also exist once this one freezes.
    requests: HashSet<Scope>,
}

struct FrozenGraph {
    templates: Vec<Template>,
    entries: HashSet<Scope>,
    handler: Option<MetricHandler>,
}

/// The possible call paths terminating at one Scope.
pub struct ContextFlowGraph {
    scope: Scope,
    builder: Mutex<GraphBuilder>,
    frozen: OnceLock<FrozenGraph>,
}

impl ContextFlowGraph {
    pub fn new(scope: Scope) -> Self {
        ContextFlowGraph {
            scope,
            builder: Mutex::new(GraphBuilder::default()),
            frozen: OnceLock::new(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Record one route. Only valid before freeze.
    pub fn add(&self, template: Template) {
        let mut b = self.builder.lock().expect("flow graph builder poisoned");
        assert!(self.frozen.get().is_none(), "add on a frozen flow graph");
        b.templates.push(template);
    }

    /// Install the per-Metric handler. Only valid before freeze.
    pub fn set_handler(&self, handler: MetricHandler) {
        let mut b = self.builder.lock().expect("flow graph builder poisoned");
        assert!(self.frozen.get().is_none(), "set_handler on a frozen flow graph");
        b.handler = Some(handler);
    }

    /// Ask for another Scope's graph to be materialized alongside this one.
    pub fn request_scope(&self, scope: Scope) {
        assert!(scope != self.scope, "flow graph requesting itself");
        let mut b = self.builder.lock().expect("flow graph builder poisoned");
        b.requests.insert(scope);
    }

    /// Fix the graph. `resolve` is invoked for every requested sibling Scope;
    /// requests always target strictly different Scopes, so the fixed point
    /// terminates.
    pub fn freeze(&self, resolve: &mut dyn FnMut(&Scope)) {
        let built = {
            let mut b = self.builder.lock().expect("flow graph builder poisoned");
            std::mem::take(&mut *b)
        };
        let entries = built.templates.iter().map(|t| t.entry.clone()).collect();
        if self
            .frozen
            .set(FrozenGraph { templates: built.templates, entries, handler: built.handler })
            .is_err()
        {
            panic!("flow graph frozen twice");
        }
        for s in &built.requests {
            debug_assert!(*s != self.scope);
            resolve(s);
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// A frozen graph with no templates carries no information; the pipeline
    /// reports such graphs as absent.
    pub fn is_empty(&self) -> bool {
        self.templates().is_empty()
    }

    pub fn templates(&self) -> &[Template] {
        &self.frozen.get().expect("flow graph read before freeze").templates
    }

    pub fn entries(&self) -> &HashSet<Scope> {
        &self.frozen.get().expect("flow graph read before freeze").entries
    }

    pub fn handling_for(&self, m: &Metric) -> MetricHandling {
        match &self.frozen.get().expect("flow graph read before freeze").handler {
            Some(h) => h(m),
            None => MetricHandling { interior: true, ..Default::default() },
        }
    }
}

impl std::fmt::Debug for ContextFlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextFlowGraph")
            .field("scope", &self.scope)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// One Template made concrete beneath a root Context.
pub struct TemplateInstance {
    /// Context for the entry function, a direct call child of the root.
    pub entry: Arc<Context>,
    /// Contexts along the call-site chain, outermost first.
    pub path: Vec<Arc<Context>>,
    /// Context for the sampled scope itself.
    pub terminal: Arc<Context>,
}

/// A flow graph instantiated under one concrete root.
pub struct ContextReconstruction {
    graph: Arc<ContextFlowGraph>,
    root: Arc<Context>,
    instances: OnceLock<Vec<TemplateInstance>>,
}

impl ContextReconstruction {
    pub(crate) fn new(graph: Arc<ContextFlowGraph>, root: Arc<Context>) -> Self {
        ContextReconstruction { graph, root, instances: OnceLock::new() }
    }

    pub fn graph(&self) -> &Arc<ContextFlowGraph> {
        &self.graph
    }

    pub fn root(&self) -> &Arc<Context> {
        &self.root
    }

    /// Materialize the Contexts along every Template. `make_context` is the
    /// pipeline's classification-aware child creator; called exactly once,
    /// by whoever won the creation race.
    pub fn instantiate(
        &self,
        make_context: &mut dyn FnMut(&Arc<Context>, &Scope) -> Arc<Context>,
    ) {
        let instances = self
            .graph
            .templates()
            .iter()
            .map(|t| {
                let entry = make_context(&self.root, &t.entry);
                let mut cur = entry.clone();
                let mut path = Vec::with_capacity(t.path.len());
                for s in &t.path {
                    cur = make_context(&cur, s);
                    path.push(cur.clone());
                }
                let terminal = make_context(&cur, self.graph.scope());
                TemplateInstance { entry, path, terminal }
            })
            .collect();
        if self.instances.set(instances).is_err() {
            panic!("reconstruction instantiated twice");
        }
    }

    pub fn instances(&self) -> &[TemplateInstance] {
        self.instances
            .get()
            .expect("reconstruction read before instantiation")
    }
}

impl std::fmt::Debug for ContextReconstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextReconstruction")
            .field("scope", self.graph.scope())
            .field("root", &self.root)
            .finish()
    }
}
