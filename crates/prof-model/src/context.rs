//! The calling-context tree.
//!
//! Contexts form a tree rooted at the single global Context. Child creation
//! is concurrent and at-most-once per edge label; losers of the creation
//! race drop their construction and adopt the winner. Parents are held
//! weakly; the tree owns its nodes downward from the root.

use crate::graph::{ContextFlowGraph, ContextReconstruction};
use crate::metric::{AccumulatorRaw, Metric, MetricScope, MetricScopeSet};
use crate::scope::{NestedScope, Relation, Scope};
use crate::util::ByPtr;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

/// Shared per-Context metric data, merged into at thread finalization.
#[derive(Default)]
pub struct ContextData {
    metrics: HashMap<ByPtr<Metric>, MetricAccumulator>,
}

impl ContextData {
    pub fn statistics_for(&mut self, m: &Arc<Metric>) -> &mut MetricAccumulator {
        self.metrics
            .entry(ByPtr::new(m.clone()))
            .or_insert_with(|| MetricAccumulator::new(m.partials().len()))
    }

    pub fn get(&self, m: &Arc<Metric>) -> Option<&MetricAccumulator> {
        self.metrics.get(&ByPtr::new(m.clone()))
    }

    pub fn mark_used(&mut self, m: &Arc<Metric>, scopes: MetricScopeSet) {
        self.statistics_for(m).used |= scopes;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ByPtr<Metric>, &MetricAccumulator)> {
        self.metrics.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Per-(Context, Metric) accumulators: one raw tuple per (Partial, scope).
pub struct MetricAccumulator {
    pub used: MetricScopeSet,
    /// Indexed `[partial][scope.index()]`.
    partials: Vec<[AccumulatorRaw; 4]>,
}

impl MetricAccumulator {
    pub fn new(n_partials: usize) -> Self {
        MetricAccumulator {
            used: MetricScopeSet::empty(),
            partials: vec![[AccumulatorRaw::default(); 4]; n_partials.max(1)],
        }
    }

    pub fn add_raw(&mut self, partial: usize, scope: MetricScope, raw: AccumulatorRaw) {
        self.used |= scope.bit();
        self.partials[partial][scope.index()].add_raw(raw);
    }

    pub fn get(&self, partial: usize, scope: MetricScope) -> AccumulatorRaw {
        self.partials[partial][scope.index()]
    }

    pub fn n_partials(&self) -> usize {
        self.partials.len()
    }
}

/// A node in the calling-context tree.
pub struct Context {
    parent: Weak<Context>,
    nested: NestedScope,
    children: DashMap<NestedScope, Arc<Context>>,
    data: Mutex<ContextData>,
    reconsts: Mutex<HashMap<ByPtr<ContextFlowGraph>, Arc<ContextReconstruction>>>,
    pub(crate) identifier: OnceLock<u32>,
}

impl Context {
    /// The root of a new tree.
    pub fn global() -> Arc<Context> {
        Arc::new(Context {
            parent: Weak::new(),
            nested: NestedScope::new(Relation::Global, Scope::Global),
            children: DashMap::new(),
            data: Mutex::new(ContextData::default()),
            reconsts: Mutex::new(HashMap::new()),
            identifier: OnceLock::new(),
        })
    }

    /// Get or create the child under the given edge label. The bool is true
    /// exactly once per created child, for the caller that created it.
    pub fn ensure(self: &Arc<Self>, ns: NestedScope) -> (Arc<Context>, bool) {
        match self.children.entry(ns.clone()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(v) => {
                let child = Arc::new(Context {
                    parent: Arc::downgrade(self),
                    nested: ns,
                    children: DashMap::new(),
                    data: Mutex::new(ContextData::default()),
                    reconsts: Mutex::new(HashMap::new()),
                    identifier: OnceLock::new(),
                });
                v.insert(child.clone());
                (child, true)
            }
        }
    }

    pub fn direct_parent(&self) -> Option<Arc<Context>> {
        self.parent.upgrade()
    }

    /// The edge label relating this Context to its parent.
    pub fn nested_scope(&self) -> &NestedScope {
        &self.nested
    }

    pub fn relation(&self) -> Relation {
        self.nested.relation()
    }

    pub fn scope(&self) -> &Scope {
        self.nested.flat()
    }

    pub fn is_global(&self) -> bool {
        matches!(self.nested.flat(), Scope::Global)
    }

    /// Snapshot of the current children. Order is unspecified.
    pub fn children(&self) -> Vec<Arc<Context>> {
        self.children.iter().map(|e| e.value().clone()).collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Self, then parents up to and including the root.
    pub fn path_to_root(self: &Arc<Self>) -> Vec<Arc<Context>> {
        let mut out = vec![self.clone()];
        let mut cur = self.direct_parent();
        while let Some(c) = cur {
            cur = c.direct_parent();
            out.push(c);
        }
        out
    }

    pub fn data(&self) -> MutexGuard<'_, ContextData> {
        self.data.lock().expect("context data poisoned")
    }

    /// Lazy slot for the `identifier` extension.
    pub fn identifier_cell(&self) -> &OnceLock<u32> {
        &self.identifier
    }

    /// Get or create the Reconstruction of `graph` rooted here. The bool is
    /// true for the creating caller, which must then instantiate it.
    pub fn ensure_reconstruction(
        self: &Arc<Self>,
        graph: &Arc<ContextFlowGraph>,
    ) -> (Arc<ContextReconstruction>, bool) {
        let mut map = self.reconsts.lock().expect("context reconsts poisoned");
        match map.entry(ByPtr::new(graph.clone())) {
            std::collections::hash_map::Entry::Occupied(e) => (e.get().clone(), false),
            std::collections::hash_map::Entry::Vacant(v) => {
                let rc = Arc::new(ContextReconstruction::new(graph.clone(), self.clone()));
                v.insert(rc.clone());
                (rc, true)
            }
        }
    }

    /// Preorder walk of the whole subtree.
    pub fn walk_preorder(self: &Arc<Self>, f: &mut dyn FnMut(&Arc<Context>, usize)) {
        self.walk_inner(f, 0);
    }

    fn walk_inner(self: &Arc<Self>, f: &mut dyn FnMut(&Arc<Context>, usize), depth: usize) {
        f(self, depth);
        for child in self.children() {
            child.walk_inner(f, depth + 1);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("scope", &self.nested)
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn point_ns(offset: u64) -> NestedScope {
        let m = Arc::new(crate::module::Module::new("/bin/x".into(), None));
        NestedScope::new(Relation::Call, Scope::Point { module: m, offset })
    }

    #[test]
    fn ensure_dedups() {
        let root = Context::global();
        let ns = NestedScope::new(Relation::Call, Scope::Unknown);
        let (a, first_a) = root.ensure(ns.clone());
        let (b, first_b) = root.ensure(ns);
        assert!(first_a);
        assert!(!first_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(root.child_count(), 1);
        assert!(Arc::ptr_eq(&a.direct_parent().unwrap(), &root));
    }

    #[test]
    fn concurrent_ensure_single_winner() {
        let root = Context::global();
        let ns = NestedScope::new(Relation::Call, Scope::Placeholder(1));
        let firsts = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let (_, first) = root.ensure(ns.clone());
                        if first {
                            firsts.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(firsts.load(Ordering::Relaxed), 1);
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn distinct_scopes_distinct_children() {
        let root = Context::global();
        let (a, _) = root.ensure(point_ns(0x10));
        let (b, _) = root.ensure(point_ns(0x10));
        // Same offset but separately-created modules: different identity.
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(root.child_count(), 2);
    }

    #[test]
    fn path_to_root_order() {
        let root = Context::global();
        let (a, _) = root.ensure(NestedScope::new(Relation::Call, Scope::Unknown));
        let (b, _) = a.ensure(NestedScope::new(Relation::Enclosure, Scope::Placeholder(2)));
        let path = b.path_to_root();
        assert_eq!(path.len(), 3);
        assert!(Arc::ptr_eq(&path[0], &b));
        assert!(Arc::ptr_eq(&path[1], &a));
        assert!(Arc::ptr_eq(&path[2], &root));
    }
}
