//! Capability handles binding collaborators to a pipeline.
//!
//! A `SourceHandle` is the emission surface for Sources (and, with
//! classification disabled and no source-local state, for Finalizers). A
//! `SinkHandle` is the read surface for Sinks. Both are cheap to clone and
//! hold the pipeline weakly; they must not be used before the pipeline
//! starts or after it is dropped.

use crate::pipeline::{PipelineCore, TimepointStatus};
use prof_model::{
    ByPtr, Context, ContextFlowGraph, ContextReconstruction, DataClass, ExtensionClass,
    ExtraStatistic, File, Metric, MetricIdentifier, MetricSettings, Module, NestedScope, Ns,
    PerThreadTemporary, ProfileAttributes, Scope, Thread, ThreadAttributes,
};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Emission surface bound to one Source (or one Finalizer).
#[derive(Clone)]
pub struct SourceHandle {
    pub(crate) core: Weak<PipelineCore>,
    /// Present for Sources; absent for Finalizers.
    pub(crate) source_idx: Option<usize>,
    pub(crate) data_limit: DataClass,
    pub(crate) ext_limit: ExtensionClass,
    /// Whether `context` runs the classification chain. Off for Finalizers
    /// so their own context creation does not recurse.
    pub(crate) finalize_contexts: bool,
}

impl SourceHandle {
    fn core(&self) -> Arc<PipelineCore> {
        self.core.upgrade().expect("pipeline no longer exists")
    }

    fn assert_limits(&self, d: DataClass) {
        debug_assert!(
            self.data_limit.all_of(d),
            "source did not register for {d} emission"
        );
        #[cfg(debug_assertions)]
        {
            let core = self.core();
            if let Some(sched) = core.schedule.get() {
                debug_assert!(
                    sched.scheduled.all_of(d) || !sched.scheduled.has_any(),
                    "{d} is not scheduled for this pipeline"
                );
            }
            if let Some(i) = self.source_idx {
                let sl = core.locals()[i].lock().expect("source local poisoned");
                debug_assert!(
                    !sl.disabled.any_of(d),
                    "attempt to emit {d} after the source already read it"
                );
            }
        }
    }

    /// The extended data available to this collaborator.
    pub fn extensions(&self) -> ExtensionClass {
        self.ext_limit
    }

    /// Merge execution-wide attributes.
    pub fn attributes(&self, attrs: ProfileAttributes) {
        self.assert_limits(DataClass::ATTRIBUTES);
        self.core().merge_attributes(attrs);
    }

    /// Widen the pipeline's timepoint bounds directly, for Sources that
    /// carry precomputed bounds rather than individual timepoints.
    pub fn timepoint_bounds(&self, min: Ns, max: Ns) {
        debug_assert!(
            self.data_limit
                .any_of(DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS),
            "source did not register for timepoint emission"
        );
        self.core().merge_timepoint_bounds((min, max));
    }

    pub fn module(&self, path: PathBuf) -> Arc<Module> {
        self.assert_limits(DataClass::REFERENCES);
        self.core().module(path, None)
    }

    pub fn module_with_relative(&self, path: PathBuf, relative: PathBuf) -> Arc<Module> {
        self.assert_limits(DataClass::REFERENCES);
        self.core().module(path, Some(relative))
    }

    pub fn file(&self, path: PathBuf) -> Arc<File> {
        self.assert_limits(DataClass::REFERENCES);
        self.core().file(path)
    }

    pub fn metric(&self, settings: MetricSettings) -> Arc<Metric> {
        self.metric_ex(settings, false)
    }

    /// Register a Metric, optionally marking it relation-routed: values
    /// accumulate onto the relation Context instead of the flat one.
    pub fn metric_ex(&self, settings: MetricSettings, relation: bool) -> Arc<Metric> {
        self.assert_limits(DataClass::ATTRIBUTES);
        let core = self.core();
        let m = core.metric(settings, relation);
        if let Some(i) = self.source_idx {
            core.locals()[i]
                .lock()
                .expect("source local poisoned")
                .thawed
                .insert(ByPtr::new(m.clone()));
        }
        m
    }

    /// Freeze a Metric, notifying Sinks on the freezing call. Sources must
    /// freeze every Metric they register before finishing.
    pub fn metric_freeze(&self, m: &Arc<Metric>) {
        let core = self.core();
        core.metric_freeze(m);
        if let Some(i) = self.source_idx {
            core.locals()[i]
                .lock()
                .expect("source local poisoned")
                .thawed
                .remove(&ByPtr::new(m.clone()));
        }
    }

    pub fn extra_statistic(&self, es: ExtraStatistic) -> Arc<ExtraStatistic> {
        self.assert_limits(DataClass::ATTRIBUTES);
        self.core().extra_statistic(es)
    }

    /// The global root Context.
    pub fn global(&self) -> Arc<Context> {
        self.core().global.clone()
    }

    /// Look up or create a child Context. Returns (relation, flat): the flat
    /// Context is where point-scoped data lands; the relation Context is
    /// where relation-routed Metrics land. They coincide unless a
    /// classification Finalizer split the edge.
    pub fn context(&self, parent: &Arc<Context>, ns: NestedScope) -> (Arc<Context>, Arc<Context>) {
        self.assert_limits(DataClass::CONTEXTS);
        self.core().context(parent, ns, self.finalize_contexts)
    }

    /// The flow graph describing possible call paths to `scope`, or None if
    /// no classifier can reconstruct it.
    pub fn context_flow_graph(&self, scope: &Scope) -> Option<Arc<ContextFlowGraph>> {
        self.assert_limits(DataClass::CONTEXTS);
        self.core().context_flow_graph(scope)
    }

    pub fn context_reconstruction(
        &self,
        graph: &Arc<ContextFlowGraph>,
        root: &Arc<Context>,
    ) -> Arc<ContextReconstruction> {
        self.assert_limits(DataClass::CONTEXTS);
        self.core().context_reconstruction(graph, root)
    }

    /// Pool `graph` into the thread's reconstruction group `gid`,
    /// instantiating it under every root already known to call one of the
    /// graph's entries.
    pub fn add_graph_to_group(
        &self,
        tt: &Arc<PerThreadTemporary>,
        gid: u64,
        graph: &Arc<ContextFlowGraph>,
    ) {
        self.assert_limits(DataClass::CONTEXTS);
        self.core().add_graph_to_group(tt.as_ref(), gid, graph);
    }

    /// Register `root` as calling `entry` within group `gid`, instantiating
    /// every pooled graph that enters there.
    pub fn add_root_to_group(
        &self,
        tt: &Arc<PerThreadTemporary>,
        gid: u64,
        root: &Arc<Context>,
        entry: Scope,
    ) {
        self.assert_limits(DataClass::CONTEXTS);
        self.core().add_root_to_group(tt.as_ref(), gid, root, entry);
    }

    fn assert_metrics_wave(&self, tt: &PerThreadTemporary) {
        self.assert_limits(DataClass::METRICS);
        let _ = tt;
        #[cfg(debug_assertions)]
        if let Some(i) = self.source_idx {
            let core = self.core();
            let sl = core.locals()[i].lock().expect("source local poisoned");
            debug_assert!(sl.last_wave, "attempt to emit metrics before requested");
        }
    }

    pub fn accumulate_to<'a>(
        &self,
        tt: &'a Arc<PerThreadTemporary>,
        ctx: &'a Arc<Context>,
    ) -> AccumulatorsRef<'a> {
        self.assert_metrics_wave(tt);
        AccumulatorsRef { tt, target: AccTarget::Context(ctx) }
    }

    pub fn accumulate_to_reconstruction<'a>(
        &self,
        tt: &'a Arc<PerThreadTemporary>,
        rc: &'a Arc<ContextReconstruction>,
    ) -> AccumulatorsRef<'a> {
        self.assert_metrics_wave(tt);
        AccumulatorsRef { tt, target: AccTarget::Reconstruction(rc) }
    }

    /// Accumulate to a group root; distributed with the group at finalize.
    pub fn accumulate_to_group<'a>(
        &self,
        tt: &'a Arc<PerThreadTemporary>,
        gid: u64,
        ctx: &'a Arc<Context>,
    ) -> AccumulatorsRef<'a> {
        self.assert_metrics_wave(tt);
        AccumulatorsRef { tt, target: AccTarget::GroupContext(gid, ctx) }
    }

    /// Accumulate against a pooled flow graph; distributed across its
    /// instantiated Reconstructions at finalize.
    pub fn accumulate_to_graph<'a>(
        &self,
        tt: &'a Arc<PerThreadTemporary>,
        gid: u64,
        graph: &'a Arc<ContextFlowGraph>,
    ) -> AccumulatorsRef<'a> {
        self.assert_metrics_wave(tt);
        AccumulatorsRef { tt, target: AccTarget::GroupGraph(gid, graph) }
    }

    /// Create a Thread owned by this Source, finalized when the Source ends.
    pub fn thread(&self, attrs: ThreadAttributes) -> Arc<PerThreadTemporary> {
        self.assert_limits(DataClass::THREADS);
        assert!(attrs.ok(), "source did not fill out the thread identity");
        let core = self.core();
        let idx = self
            .source_idx
            .expect("thread() requires a source-bound handle");
        let t = core.new_thread(attrs);
        let tt = Arc::new(PerThreadTemporary::new(t));
        core.locals()[idx]
            .lock()
            .expect("source local poisoned")
            .threads
            .push(tt.clone());
        tt
    }

    /// Get or create the Thread shared across Sources under this identity
    /// tuple; finalized in the dedicated merged-thread phase.
    pub fn merged_thread(&self, attrs: ThreadAttributes) -> Arc<PerThreadTemporary> {
        self.assert_limits(DataClass::THREADS);
        assert!(attrs.ok(), "source did not fill out the thread identity");
        self.core().merged_thread(attrs)
    }

    /// Emit one ctx timepoint. A `RewindStart` return means everything told
    /// to this stream must be replayed from the beginning.
    pub fn ctx_timepoint(
        &self,
        tt: &Arc<PerThreadTemporary>,
        ctx: Arc<Context>,
        time: Ns,
    ) -> TimepointStatus {
        self.assert_limits(DataClass::CTX_TIMEPOINTS);
        self.core().ctx_timepoint(tt.as_ref(), ctx, time)
    }

    /// Emit one metric timepoint; same rewind protocol as `ctx_timepoint`.
    pub fn metric_timepoint(
        &self,
        tt: &Arc<PerThreadTemporary>,
        m: &Arc<Metric>,
        value: f64,
        time: Ns,
    ) -> TimepointStatus {
        self.assert_limits(DataClass::METRIC_TIMEPOINTS);
        self.core().metric_timepoint(tt.as_ref(), m, value, time)
    }

    // Lazy extension reads, for collaborators registered for them.

    pub fn resolved_path_module(&self, m: &Arc<Module>) -> PathBuf {
        debug_assert!(self.ext_limit.has_resolved_path());
        self.core().resolved_path_module(m)
    }

    pub fn resolved_path_file(&self, f: &Arc<File>) -> PathBuf {
        debug_assert!(self.ext_limit.has_resolved_path());
        self.core().resolved_path_file(f)
    }

    pub fn module_id(&self, m: &Arc<Module>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().module_id(m)
    }

    pub fn context_id(&self, c: &Arc<Context>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().context_id(c)
    }

    pub fn metric_id(&self, m: &Arc<Metric>) -> MetricIdentifier {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().metric_id(m)
    }
}

enum AccTarget<'a> {
    Context(&'a Arc<Context>),
    Reconstruction(&'a Arc<ContextReconstruction>),
    GroupContext(u64, &'a Arc<Context>),
    GroupGraph(u64, &'a Arc<ContextFlowGraph>),
}

/// A borrowed accumulation target within one thread's temporary state.
pub struct AccumulatorsRef<'a> {
    tt: &'a Arc<PerThreadTemporary>,
    target: AccTarget<'a>,
}

impl AccumulatorsRef<'_> {
    pub fn add(&self, m: &Arc<Metric>, value: f64) {
        debug_assert!(m.is_frozen(), "accumulation into an unfrozen Metric");
        match self.target {
            AccTarget::Context(c) => self.tt.add_to_context(c, m, value),
            AccTarget::Reconstruction(rc) => self.tt.add_to_reconstruction(rc, m, value),
            AccTarget::GroupContext(gid, c) => self.tt.add_to_group_context(gid, c, m, value),
            AccTarget::GroupGraph(gid, g) => self.tt.add_to_group_graph(gid, g, m, value),
        }
    }
}

/// Read surface bound to one Sink.
#[derive(Clone)]
pub struct SinkHandle {
    pub(crate) core: Weak<PipelineCore>,
    pub(crate) idx: usize,
    pub(crate) data_limit: DataClass,
    pub(crate) ext_limit: ExtensionClass,
}

impl SinkHandle {
    fn core(&self) -> Arc<PipelineCore> {
        self.core.upgrade().expect("pipeline no longer exists")
    }

    pub fn team_size(&self) -> usize {
        self.core().team_size
    }

    pub fn attributes(&self) -> ProfileAttributes {
        debug_assert!(
            self.data_limit.has_attributes(),
            "sink did not register for attributes absorption"
        );
        self.core().attrs.lock().expect("attrs poisoned").clone()
    }

    pub fn timepoint_bounds(&self) -> Option<(Ns, Ns)> {
        debug_assert!(
            self.data_limit
                .any_of(DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS),
            "sink did not register for timepoints absorption"
        );
        *self
            .core()
            .timepoint_bounds
            .lock()
            .expect("bounds poisoned")
    }

    pub fn modules(&self) -> Vec<Arc<Module>> {
        debug_assert!(self.data_limit.has_references());
        self.core().modules.snapshot()
    }

    pub fn files(&self) -> Vec<Arc<File>> {
        debug_assert!(self.data_limit.has_references());
        self.core().files.snapshot()
    }

    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        debug_assert!(self.data_limit.has_attributes());
        self.core().metrics.snapshot()
    }

    pub fn extra_statistics(&self) -> Vec<Arc<ExtraStatistic>> {
        debug_assert!(self.data_limit.has_attributes());
        self.core().estats.snapshot()
    }

    /// The global root Context; the whole tree hangs off it.
    pub fn contexts(&self) -> Arc<Context> {
        debug_assert!(self.data_limit.has_contexts());
        self.core().global.clone()
    }

    pub fn context_flow_graphs(&self) -> Vec<Arc<ContextFlowGraph>> {
        debug_assert!(self.data_limit.has_contexts());
        self.core().graphs.snapshot()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        debug_assert!(self.data_limit.has_threads());
        self.core().threads.snapshot()
    }

    // Lazy extension reads. Each resolves through the Finalizer chain on
    // first access and is cached on the entity.

    pub fn module_id(&self, m: &Arc<Module>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().module_id(m)
    }
    pub fn file_id(&self, f: &Arc<File>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().file_id(f)
    }
    pub fn metric_id(&self, m: &Arc<Metric>) -> MetricIdentifier {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().metric_id(m)
    }
    pub fn context_id(&self, c: &Arc<Context>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().context_id(c)
    }
    pub fn thread_id(&self, t: &Arc<Thread>) -> u32 {
        debug_assert!(self.ext_limit.has_identifier());
        self.core().thread_id(t)
    }
    pub fn resolved_path_module(&self, m: &Arc<Module>) -> PathBuf {
        debug_assert!(self.ext_limit.has_resolved_path());
        self.core().resolved_path_module(m)
    }
    pub fn resolved_path_file(&self, f: &Arc<File>) -> PathBuf {
        debug_assert!(self.ext_limit.has_resolved_path());
        self.core().resolved_path_file(f)
    }

    /// Serialize with the previous Sink in the ordered wavefront chain: wait
    /// for it to pass its barrier, then pass our own when the guard drops.
    pub fn enter_ordered_wavefront(&self) -> OrderedGuard {
        let core = self.core();
        let e = &core.sinks[self.idx];
        assert!(e.ordered_wavefront, "sink is not in the ordered wavefront chain");
        if let Some(p) = e.prior_wavefront {
            core.sinks[p].wavefront_dep.wait();
        }
        OrderedGuard { core: core.clone(), idx: self.idx, write: false }
    }

    /// Serialize with the previous Sink in the ordered write chain.
    pub fn enter_ordered_write(&self) -> OrderedGuard {
        let core = self.core();
        let e = &core.sinks[self.idx];
        assert!(e.ordered_write, "sink is not in the ordered write chain");
        if let Some(p) = e.prior_write {
            core.sinks[p].write_dep.wait();
        }
        OrderedGuard { core: core.clone(), idx: self.idx, write: true }
    }
}

/// Passes the owning Sink's ordered-chain barrier when dropped.
pub struct OrderedGuard {
    core: Arc<PipelineCore>,
    idx: usize,
    write: bool,
}

impl Drop for OrderedGuard {
    fn drop(&mut self) {
        let e = &self.core.sinks[self.idx];
        if self.write {
            e.write_dep.signal();
        } else {
            e.wavefront_dep.signal();
        }
    }
}
