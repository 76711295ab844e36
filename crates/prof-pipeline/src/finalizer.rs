//! The contract for extension providers.

use crate::handles::SourceHandle;
use prof_model::{
    Context, ContextFlowGraph, ExtensionClass, File, Metric, MetricIdentifier, Module,
    NestedScope, StatsAccess, Thread,
};
use std::path::PathBuf;
use std::sync::Arc;

/// The result of classifying one NestedScope under an ancestor Context.
///
/// The Finalizer has already created the intermediate Contexts; the pipeline
/// creates one final child beneath `flat_parent` using the (possibly
/// rewritten) NestedScope. `relation`, when present, is the Context standing
/// for the relation edge and is what relation-routed Metrics accumulate to.
pub struct Classified {
    pub relation: Option<Arc<Context>>,
    pub flat_parent: Arc<Context>,
}

/// A transformer supplying one or more ExtensionClasses. Per extension the
/// Finalizers form a chain of responsibility iterated in registration order;
/// the first one returning a value wins, except `append_statistics`, which
/// runs on all of them.
///
/// The handle passed to `bind` must not be used until the pipeline runs.
pub trait ProfileFinalizer: Send + Sync {
    /// Bind this Finalizer to a pipeline. Called once, before any Source reads.
    fn bind(&mut self, handle: SourceHandle);

    /// The ExtensionClasses this Finalizer provides.
    fn provides(&self) -> ExtensionClass;

    /// The ExtensionClasses this Finalizer itself needs. Must be disjoint
    /// from `provides`.
    fn requirements(&self) -> ExtensionClass;

    // ExtensionClass: identifier
    fn identify_module(&self, _m: &Arc<Module>) -> Option<u32> {
        None
    }
    fn identify_file(&self, _f: &Arc<File>) -> Option<u32> {
        None
    }
    fn identify_metric(&self, _m: &Arc<Metric>) -> Option<MetricIdentifier> {
        None
    }
    fn identify_context(&self, _c: &Arc<Context>) -> Option<u32> {
        None
    }
    fn identify_thread(&self, _t: &Arc<Thread>) -> Option<u32> {
        None
    }

    // ExtensionClass: resolvedPath
    fn resolve_path_file(&self, _f: &Arc<File>) -> Option<PathBuf> {
        None
    }
    fn resolve_path_module(&self, _m: &Arc<Module>) -> Option<PathBuf> {
        None
    }

    /// ExtensionClass: classification. May rewrite `ns` and insert
    /// intermediate Contexts beneath `ancestor` through its own handle.
    fn classify(&self, _ancestor: &Arc<Context>, _ns: &mut NestedScope) -> Option<Classified> {
        None
    }

    /// ExtensionClass: classification. Populate a fresh ContextFlowGraph
    /// (templates, handler, sibling requests). True when this Finalizer
    /// provided the data.
    fn resolve_graph(&self, _g: &Arc<ContextFlowGraph>) -> bool {
        false
    }

    /// ExtensionClass: statistics. Called on every statistics-providing
    /// Finalizer for every new Metric.
    fn append_statistics(&self, _m: &Arc<Metric>, _stats: StatsAccess<'_>) {}
}
