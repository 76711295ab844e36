//! The contract for output-artifact consumers.

use crate::handles::SinkHandle;
use crate::work::WorkshareResult;
use prof_model::{
    Context, CtxTimepoint, DataClass, ExtensionClass, ExtraStatistic, File, Metric,
    MetricTimepoint, Module, PerThreadTemporary, Thread,
};
use std::sync::Arc;

/// A consumer of pipeline data that writes one output artifact.
///
/// Notification methods are called from many worker threads and must be
/// internally synchronized; `write` is externally serialized per Sink, but
/// `help` may run concurrently with another thread's `write`.
pub trait ProfileSink: Send + Sync {
    /// Bind this Sink to a pipeline. Called exactly once, before the run;
    /// the handle must not be used until notifications begin.
    fn bind(&mut self, handle: SinkHandle);

    /// The DataClasses this Sink wants to absorb.
    fn accepts(&self) -> DataClass;

    /// The subset of `accepts` to deliver as early wavefronts. Only the
    /// waveable classes (attributes, references, threads, contexts) are
    /// allowed here.
    fn wavefronts(&self) -> DataClass {
        DataClass::empty()
    }

    /// The extended data this Sink needs to function.
    fn requirements(&self) -> ExtensionClass;

    /// A requested wavefront has passed. `delivered` is the set of all
    /// wavefronts passed so far; each class is reported at most once.
    fn notify_wavefront(&self, _delivered: DataClass) {}

    fn notify_module(&self, _m: &Arc<Module>) {}
    fn notify_file(&self, _f: &Arc<File>) {}
    fn notify_metric(&self, _m: &Arc<Metric>) {}
    fn notify_extra_statistic(&self, _es: &Arc<ExtraStatistic>) {}
    fn notify_context(&self, _c: &Arc<Context>) {}
    fn notify_thread(&self, _t: &Arc<Thread>) {}

    /// A batch of context timepoints for `t`, in stream order.
    fn notify_timepoints(&self, _t: &Arc<Thread>, _tps: &[CtxTimepoint]) {}

    /// The ctx timepoint stream for `t` will restart from its beginning;
    /// drop everything staged for it.
    fn notify_ctx_timepoint_rewind(&self, _t: &Arc<Thread>) {}

    /// A batch of metric timepoints for `(t, m)`, in stream order.
    fn notify_metric_timepoints(
        &self,
        _t: &Arc<Thread>,
        _m: &Arc<Metric>,
        _tps: &[MetricTimepoint],
    ) {
    }

    /// The `(t, m)` timepoint stream will restart from its beginning.
    fn notify_metric_timepoint_rewind(&self, _t: &Arc<Thread>, _m: &Arc<Metric>) {}

    /// `t` has finished: all its timepoint batches are delivered and its
    /// accumulations are folded into the shared Contexts.
    fn notify_thread_final(&self, _tt: &Arc<PerThreadTemporary>) {}

    /// Write the output artifact. I/O failure here is fatal to the run.
    fn write(&self) -> std::io::Result<()>;

    /// Contribute to this Sink's parallel workshare from another thread.
    /// Sinks without internal parallelism report an idle completion.
    fn help(&self) -> WorkshareResult {
        WorkshareResult::idle_complete()
    }
}
