//! Classification from binary structure files.
//!
//! A structure file describes one or more binaries: function bounds, loop
//! nests, line tables, and optionally a call graph. Point samples expand
//! into function/loop/line enclosure chains, and the call graph drives flow
//! graph resolution for samples whose calling context is unknown.
//!
//! The carrier format is JSON; the measurement-side structure extractor is
//! an external collaborator and this reader is its narrow contract.

use crate::range_map::RangeMap;
use prof_model::{
    Context, ExtensionClass, File, Function, Metric, MetricHandling, Module, NestedScope,
    Relation, Scope, Template,
};
use prof_pipeline::{Classified, ProfileFinalizer, SourceHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StructFileError {
    #[error("failed to read structure file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed structure file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct StructDoc {
    binaries: Vec<BinaryRec>,
}

#[derive(Debug, Deserialize)]
struct BinaryRec {
    path: PathBuf,
    #[serde(default)]
    has_calls: bool,
    #[serde(default)]
    functions: Vec<FunctionRec>,
    #[serde(default)]
    loops: Vec<LoopRec>,
    #[serde(default)]
    lines: Vec<LineRec>,
    #[serde(default)]
    calls: Vec<CallRec>,
}

#[derive(Debug, Deserialize)]
struct FunctionRec {
    name: String,
    entry: u64,
    ranges: Vec<(u64, u64)>,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    line: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LoopRec {
    ranges: Vec<(u64, u64)>,
    file: PathBuf,
    line: u32,
    /// Offset of the loop head; present for binary-level loops.
    #[serde(default)]
    head: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LineRec {
    ranges: Vec<(u64, u64)>,
    file: PathBuf,
    line: u32,
}

#[derive(Debug, Deserialize)]
struct CallRec {
    /// Call-site offset, within some function's range.
    site: u64,
    /// Entry offset of the called function.
    callee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallGraphStatus {
    Valid,
    NotPresent,
    Errored,
}

/// Per-Module data attached through the classification userdata slot.
struct ModuleStructData {
    funcs: RangeMap<Arc<Function>>,
    by_entry: HashMap<u64, Arc<Function>>,
    /// (start, end, scope); candidates are sorted outermost-first on use.
    loops: Vec<(u64, u64, Scope)>,
    lines: RangeMap<(Arc<File>, u32)>,
    /// Reverse call graph: callee entry -> (call site, caller entry).
    rcg: HashMap<u64, Vec<(u64, u64)>>,
    cfg_status: CallGraphStatus,
}

/// Finalizer loading one structure file.
pub struct StructFile {
    path: PathBuf,
    pending: Mutex<Vec<BinaryRec>>,
    handle: Option<SourceHandle>,
    warned_no_cfg: Once,
    warned_bad_cfg: Once,
}

impl StructFile {
    pub fn new(path: &Path) -> Result<Self, StructFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| StructFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: StructDoc =
            serde_json::from_str(&text).map_err(|source| StructFileError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            target: "finalizer.struct",
            path = %path.display(),
            binaries = doc.binaries.len(),
            "loaded structure file"
        );
        Ok(StructFile {
            path: path.to_path_buf(),
            pending: Mutex::new(doc.binaries),
            handle: None,
            warned_no_cfg: Once::new(),
            warned_bad_cfg: Once::new(),
        })
    }

    /// The binary paths this structure file describes.
    pub fn for_paths(&self) -> Vec<PathBuf> {
        self.pending.lock().expect("struct pending poisoned")
            .iter()
            .map(|b| b.path.clone())
            .collect()
    }

    /// Attach this file's data to `module` if one of our binaries matches,
    /// first by full path and then by file name.
    fn data<'a>(&self, module: &'a Arc<Module>) -> Option<&'a ModuleStructData> {
        if module.classification::<ModuleStructData>().is_none() {
            let mut pending = self.pending.lock().expect("struct pending poisoned");
            let idx = pending
                .iter()
                .position(|b| b.path == module.path())
                .or_else(|| {
                    pending
                        .iter()
                        .position(|b| b.path.file_name() == module.path().file_name())
                })?;
            let rec = pending.remove(idx);
            let data = self.build(module, rec);
            if module.set_classification(data).is_err() {
                // Another structure file got here first; leave its data.
                info!(
                    target: "finalizer.struct",
                    module = %module.path().display(),
                    file = %self.path.display(),
                    "module already classified, ignoring duplicate structure data"
                );
            }
        }
        module.classification::<ModuleStructData>()
    }

    fn build(&self, module: &Arc<Module>, rec: BinaryRec) -> ModuleStructData {
        let h = self.handle.as_ref().expect("finalizer not bound");
        let mut funcs = RangeMap::new();
        let mut by_entry = HashMap::new();
        for f in &rec.functions {
            let source = match (&f.file, f.line) {
                (Some(p), Some(l)) => Some((h.file(p.clone()), l)),
                _ => None,
            };
            let func = Arc::new(Function::new(
                module.clone(),
                f.name.clone(),
                Some(f.entry),
                source,
            ));
            by_entry.insert(f.entry, func.clone());
            for &(s, e) in &f.ranges {
                funcs.insert(s, e, func.clone());
            }
        }

        let mut loops = Vec::new();
        for l in &rec.loops {
            let file = h.file(l.file.clone());
            let scope = match l.head {
                Some(head) => Scope::BinaryLoop {
                    module: module.clone(),
                    offset: head,
                    file,
                    line: l.line,
                },
                None => Scope::LexicalLoop { file, line: l.line },
            };
            for &(s, e) in &l.ranges {
                loops.push((s, e, scope.clone()));
            }
        }

        let mut lines = RangeMap::new();
        for l in &rec.lines {
            let file = h.file(l.file.clone());
            for &(s, e) in &l.ranges {
                lines.insert(s, e, (file.clone(), l.line));
            }
        }

        let mut cfg_status = if rec.has_calls {
            CallGraphStatus::Valid
        } else {
            CallGraphStatus::NotPresent
        };
        let mut rcg: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
        if rec.has_calls {
            for c in &rec.calls {
                let Some(caller) = funcs.get(c.site) else {
                    info!(
                        target: "finalizer.struct",
                        module = %module.path().display(),
                        site = c.site,
                        "call site outside any known function"
                    );
                    cfg_status = CallGraphStatus::Errored;
                    break;
                };
                if !by_entry.contains_key(&c.callee) {
                    info!(
                        target: "finalizer.struct",
                        module = %module.path().display(),
                        callee = c.callee,
                        "missing callee in structure call graph"
                    );
                    cfg_status = CallGraphStatus::Errored;
                    break;
                }
                rcg.entry(c.callee)
                    .or_default()
                    .push((c.site, caller.entry().expect("struct functions have entries")));
            }
            if cfg_status == CallGraphStatus::Errored {
                rcg.clear();
            } else {
                collapse_sccs(&by_entry, &mut rcg);
            }
        }

        ModuleStructData { funcs, by_entry, loops, lines, rcg, cfg_status }
    }
}

/// Tarjan over the reverse call graph, then cycle removal: intra-SCC edges
/// are deleted and replaced by summarizing inter-SCC copies so reachability
/// between functions in different SCCs is preserved.
fn collapse_sccs(by_entry: &HashMap<u64, Arc<Function>>, rcg: &mut HashMap<u64, Vec<(u64, u64)>>) {
    struct Env<'a> {
        rcg: &'a HashMap<u64, Vec<(u64, u64)>>,
        state: HashMap<u64, (usize, usize, bool)>, // (index, lowlink, on stack)
        stack: Vec<u64>,
        counter: usize,
        comp: HashMap<u64, u64>,          // node -> SCC root
        members: HashMap<u64, Vec<u64>>,  // SCC root -> members
    }

    fn visit(env: &mut Env<'_>, node: u64) -> usize {
        if let Some(&(_, low, _)) = env.state.get(&node) {
            return low;
        }
        let index = env.counter;
        env.counter += 1;
        env.state.insert(node, (index, index, true));
        env.stack.push(node);

        let neighbors: Vec<u64> = env
            .rcg
            .get(&node)
            .map(|edges| edges.iter().map(|&(_, caller)| caller).collect())
            .unwrap_or_default();
        let mut low = index;
        for n in neighbors {
            match env.state.get(&n).copied() {
                None => {
                    low = low.min(visit(env, n));
                }
                Some((n_index, _, true)) => {
                    low = low.min(n_index);
                }
                Some((_, _, false)) => {}
            }
        }
        env.state.get_mut(&node).expect("visited node").1 = low;

        if low == index {
            loop {
                let member = env.stack.pop().expect("scc stack underflow");
                env.state.get_mut(&member).expect("visited node").2 = false;
                env.comp.insert(member, node);
                env.members.entry(node).or_default().push(member);
                if member == node {
                    break;
                }
            }
        }
        low
    }

    let mut env = Env {
        rcg,
        state: HashMap::new(),
        stack: Vec::new(),
        counter: 0,
        comp: HashMap::new(),
        members: HashMap::new(),
    };
    for &node in by_entry.keys() {
        visit(&mut env, node);
    }
    let comp = env.comp;
    let members = env.members;

    // Drop the cycle-causing intra-SCC edges; the graph is a DAG after.
    for (callee, edges) in rcg.iter_mut() {
        let callee_comp = comp[callee];
        edges.retain(|&(_, caller)| comp[&caller] != callee_comp);
    }

    // Summarize: every surviving call into an SCC could reach any of its
    // members, so copy the edge to each sibling.
    let mut extra: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
    for (callee, edges) in rcg.iter() {
        for &sibling in &members[&comp[callee]] {
            if sibling == *callee {
                continue;
            }
            extra.entry(sibling).or_default().extend(edges.iter().copied());
        }
    }
    for (callee, edges) in extra {
        rcg.entry(callee).or_default().extend(edges);
    }
}

impl ProfileFinalizer for StructFile {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }

    fn provides(&self) -> ExtensionClass {
        ExtensionClass::CLASSIFICATION
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn classify(&self, ancestor: &Arc<Context>, ns: &mut NestedScope) -> Option<Classified> {
        let Scope::Point { module, offset } = ns.flat().clone() else {
            return None;
        };
        let sd = self.data(&module)?;
        let func = sd.funcs.get(offset)?.clone();
        let h = self.handle.as_ref().expect("finalizer not bound");

        let (_, func_ctx) = h.context(
            ancestor,
            NestedScope::new(ns.relation(), Scope::Function(func)),
        );
        let mut cur = func_ctx.clone();

        // Loop nest, outermost (widest) first.
        let mut containing: Vec<&(u64, u64, Scope)> = sd
            .loops
            .iter()
            .filter(|(s, e, _)| *s <= offset && offset < *e)
            .collect();
        containing.sort_by_key(|(s, e, _)| std::cmp::Reverse(e - s));
        for (_, _, scope) in containing {
            cur = h
                .context(&cur, NestedScope::new(Relation::Enclosure, scope.clone()))
                .1;
        }

        if let Some((file, line)) = sd.lines.get(offset) {
            cur = h
                .context(
                    &cur,
                    NestedScope::new(
                        Relation::Enclosure,
                        Scope::Line { file: file.clone(), line: *line },
                    ),
                )
                .1;
        }

        *ns = ns.clone().with_relation(Relation::Enclosure);
        Some(Classified { relation: Some(func_ctx), flat_parent: cur })
    }

    fn resolve_graph(&self, g: &Arc<prof_model::ContextFlowGraph>) -> bool {
        let Scope::Point { module, offset } = g.scope().clone() else {
            return false;
        };
        let Some(sd) = self.data(&module) else { return false };
        match sd.cfg_status {
            CallGraphStatus::Valid => {}
            CallGraphStatus::NotPresent => {
                self.warned_no_cfg.call_once(|| {
                    warn!(
                        target: "finalizer.struct",
                        file = %self.path.display(),
                        "structure file carries no call graph; calling contexts \
                         within outlined regions cannot be reconstructed"
                    );
                });
                return false;
            }
            CallGraphStatus::Errored => {
                self.warned_bad_cfg.call_once(|| {
                    warn!(
                        target: "finalizer.struct",
                        file = %self.path.display(),
                        "control flow data is corrupt, disabling affected reconstruction"
                    );
                });
                return false;
            }
        }

        // Move from the instruction to its enclosing function, then DFS the
        // reverse call graph to every uncalled entry point.
        let func = match sd.funcs.get(offset) {
            Some(f) => f,
            None => return false,
        };
        let leaf_entry = func.entry().expect("struct functions have entries");

        fn dfs(
            sd: &ModuleStructData,
            module: &Arc<Module>,
            g: &prof_model::ContextFlowGraph,
            rpath: &mut Vec<Scope>,
            callee: u64,
        ) {
            let edges = sd.rcg.get(&callee);
            let terminal = edges.map_or(true, |e| e.is_empty());
            if let Some(edges) = edges {
                for &(site, caller) in edges {
                    rpath.push(Scope::Point { module: module.clone(), offset: site });
                    dfs(sd, module, g, rpath, caller);
                    rpath.pop();
                }
            }
            if terminal {
                let mut fpath = rpath.clone();
                fpath.reverse();
                g.add(Template {
                    entry: Scope::Function(sd.by_entry[&callee].clone()),
                    path: fpath,
                });
            }
        }
        let mut rpath = Vec::new();
        dfs(sd, &module, g, &mut rpath, leaf_entry);

        g.set_handler(Box::new(|m: &Metric| {
            let mut h = MetricHandling::default();
            match m.name() {
                "GINS" => h.interior = true,
                "GKER:COUNT" => {
                    h.exterior = true;
                    h.exterior_logical = true;
                }
                "GKER:SAMPLED_COUNT" => h.exterior = true,
                _ => {}
            }
            h
        }));
        true
    }
}
