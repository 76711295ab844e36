//! End-to-end pipeline scenarios with mock collaborators: merge semantics,
//! classification, timepoint ordering and rewind, merged threads, and the
//! wavefront/thread-finalization ordering guarantees.

use prof_model::{
    Context, DataClass, ExtensionClass, Metric, MetricScope, MetricScopeSet, MetricSettings,
    Module, NestedScope, PerThreadTemporary, ProfileAttributes, Relation, Scope, Thread,
    ThreadAttributes,
};
use prof_model::attributes::{IdTupleEntry, tuple_kind};
use prof_pipeline::{
    Classified, PipelineBuilder, ProfileFinalizer, ProfileSink, ProfileSource, SinkHandle,
    SourceError, SourceHandle, TimepointStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
enum Ev {
    Wavefront(DataClass),
    Module(PathBuf),
    Metric(String),
    Thread,
    Context(String),
    CtxBatch(Vec<u64>),
    CtxRewind,
    MetricBatch(Vec<u64>),
    ThreadFinal,
}

type Log = Arc<Mutex<Vec<Ev>>>;

fn log_of(log: &Log) -> Vec<Ev> {
    log.lock().unwrap().clone()
}

struct RecordingSink {
    log: Log,
    waves: DataClass,
    bounds: Arc<Mutex<Option<(u64, u64)>>>,
    handle: Option<SinkHandle>,
}

impl RecordingSink {
    fn new(waves: DataClass) -> (Box<Self>, Log, Arc<Mutex<Option<(u64, u64)>>>) {
        let log = Log::default();
        let bounds = Arc::new(Mutex::new(None));
        let sink = Box::new(RecordingSink {
            log: log.clone(),
            waves,
            bounds: bounds.clone(),
            handle: None,
        });
        (sink, log, bounds)
    }
    fn push(&self, ev: Ev) {
        self.log.lock().unwrap().push(ev);
    }
}

impl ProfileSink for RecordingSink {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::all()
    }
    fn wavefronts(&self) -> DataClass {
        self.waves
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }
    fn notify_wavefront(&self, delivered: DataClass) {
        self.push(Ev::Wavefront(delivered));
    }
    fn notify_module(&self, m: &Arc<Module>) {
        self.push(Ev::Module(m.path().to_path_buf()));
    }
    fn notify_metric(&self, m: &Arc<Metric>) {
        self.push(Ev::Metric(m.name().to_string()));
    }
    fn notify_thread(&self, _t: &Arc<Thread>) {
        self.push(Ev::Thread);
    }
    fn notify_context(&self, c: &Arc<Context>) {
        self.push(Ev::Context(format!("{:?}", c.nested_scope())));
    }
    fn notify_timepoints(&self, _t: &Arc<Thread>, tps: &[prof_model::CtxTimepoint]) {
        self.push(Ev::CtxBatch(tps.iter().map(|tp| tp.time).collect()));
    }
    fn notify_ctx_timepoint_rewind(&self, _t: &Arc<Thread>) {
        self.push(Ev::CtxRewind);
    }
    fn notify_metric_timepoints(
        &self,
        _t: &Arc<Thread>,
        _m: &Arc<Metric>,
        tps: &[prof_model::MetricTimepoint],
    ) {
        self.push(Ev::MetricBatch(tps.iter().map(|tp| tp.time).collect()));
    }
    fn notify_thread_final(&self, _tt: &Arc<PerThreadTemporary>) {
        self.push(Ev::ThreadFinal);
    }
    fn write(&self) -> std::io::Result<()> {
        if let Some(h) = &self.handle {
            *self.bounds.lock().unwrap() = h.timepoint_bounds();
        }
        Ok(())
    }
}

fn rank_thread_tuple() -> ThreadAttributes {
    ThreadAttributes::new(vec![
        IdTupleEntry { kind: tuple_kind::RANK, logical_index: 0, physical_index: 0 },
        IdTupleEntry { kind: tuple_kind::THREAD, logical_index: 0, physical_index: 0 },
    ])
}

/// Shared slot the test reads after the run.
type Slot<T> = Arc<Mutex<Option<T>>>;

// ---------------------------------------------------------------------------
// S1: one source, one sample.

struct SingleSampleSource {
    handle: Option<SourceHandle>,
    metric: Option<Arc<Metric>>,
    tt: Option<Arc<PerThreadTemporary>>,
    flat: Option<Arc<Context>>,
    out_root: Slot<Arc<Context>>,
    out_metric: Slot<Arc<Metric>>,
    out_ctx: Slot<Arc<Context>>,
}

impl ProfileSource for SingleSampleSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES
            | DataClass::REFERENCES
            | DataClass::THREADS
            | DataClass::CONTEXTS
            | DataClass::METRICS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        requested
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        if needed.has_attributes() {
            let mut attrs = ProfileAttributes::default();
            attrs.set_name("a".into());
            h.attributes(attrs);
            let mut s = MetricSettings::new("M", "a metric");
            s.scopes = MetricScopeSet::POINT | MetricScopeSet::EXECUTION;
            let m = h.metric(s);
            m.stats_access().request_sum_partial();
            h.metric_freeze(&m);
            *self.out_metric.lock().unwrap() = Some(m.clone());
            self.metric = Some(m);
        }
        if needed.has_references() {
            h.module("/bin/x".into());
        }
        if needed.has_threads() {
            self.tt = Some(h.thread(rank_thread_tuple()));
        }
        if needed.has_contexts() {
            let module = h.module("/bin/x".into());
            let root = h.global();
            *self.out_root.lock().unwrap() = Some(root.clone());
            let (_rel, flat) = h.context(
                &root,
                NestedScope::new(Relation::Call, Scope::Point { module, offset: 0x100 }),
            );
            *self.out_ctx.lock().unwrap() = Some(flat.clone());
            self.flat = Some(flat);
        }
        if needed.has_metrics() {
            let tt = self.tt.as_ref().unwrap();
            let flat = self.flat.as_ref().unwrap();
            h.accumulate_to(tt, flat).add(self.metric.as_ref().unwrap(), 1.0);
        }
        Ok(())
    }
}

#[test]
fn s1_trivial_single_sample() {
    let (sink, log, _) = RecordingSink::new(DataClass::empty());
    let out_root: Slot<Arc<Context>> = Default::default();
    let out_metric: Slot<Arc<Metric>> = Default::default();
    let out_ctx: Slot<Arc<Context>> = Default::default();
    let mut b = PipelineBuilder::new();
    b.add_source(Box::new(SingleSampleSource {
        handle: None,
        metric: None,
        tt: None,
        flat: None,
        out_root: out_root.clone(),
        out_metric: out_metric.clone(),
        out_ctx: out_ctx.clone(),
    }));
    b.add_sink(sink);
    b.build(2).run().unwrap();

    let root = out_root.lock().unwrap().clone().unwrap();
    let m = out_metric.lock().unwrap().clone().unwrap();
    let ctx = out_ctx.lock().unwrap().clone().unwrap();

    assert_eq!(root.child_count(), 1);
    assert!(matches!(ctx.scope(), Scope::Point { offset: 0x100, .. }));
    assert_eq!(ctx.relation(), Relation::Call);

    // Point value at the sampled context, execution value at the root.
    assert_eq!(ctx.data().get(&m).unwrap().get(0, MetricScope::Point).sum, 1.0);
    assert_eq!(root.data().get(&m).unwrap().get(0, MetricScope::Execution).sum, 1.0);

    let evs = log_of(&log);
    // Global + the sample's context, announced exactly once each.
    let ctxs = evs.iter().filter(|e| matches!(e, Ev::Context(_))).count();
    assert_eq!(ctxs, 2);
    assert_eq!(evs.iter().filter(|e| matches!(e, Ev::Metric(_))).count(), 1);
    assert_eq!(evs.iter().filter(|e| **e == Ev::Thread).count(), 1);
    assert_eq!(evs.iter().filter(|e| **e == Ev::ThreadFinal).count(), 1);
    assert_eq!(
        evs.iter().filter(|e| matches!(e, Ev::Module(_))).count(),
        1,
        "module interned once across references and contexts reads"
    );
}

// ---------------------------------------------------------------------------
// S2: a classification finalizer splits point samples into
// call->function -> enclosure->point, and the relation bit routes metrics.

struct FunctionClassifier {
    handle: Option<SourceHandle>,
    funcs: Mutex<HashMap<u64, Arc<prof_model::Function>>>,
}

impl ProfileFinalizer for FunctionClassifier {
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
        let Scope::Point { module, offset } = ns.flat().clone() else { return None };
        let func = self
            .funcs
            .lock()
            .unwrap()
            .entry(offset & !0xff)
            .or_insert_with(|| {
                Arc::new(prof_model::Function::new(
                    module.clone(),
                    format!("f_{:x}", offset & !0xff),
                    Some(offset & !0xff),
                    None,
                ))
            })
            .clone();
        let h = self.handle.as_ref().unwrap();
        let (_r, func_ctx) = h.context(
            ancestor,
            NestedScope::new(ns.relation(), Scope::Function(func)),
        );
        *ns = ns.clone().with_relation(Relation::Enclosure);
        Some(Classified { relation: Some(func_ctx.clone()), flat_parent: func_ctx })
    }
}

struct ClassifiedSource {
    handle: Option<SourceHandle>,
    state: Option<(Arc<PerThreadTemporary>, Arc<Context>, Arc<Context>)>,
    metrics: Option<(Arc<Metric>, Arc<Metric>)>,
    out_root: Slot<Arc<Context>>,
    out_metrics: Slot<(Arc<Metric>, Arc<Metric>)>,
}

impl ProfileSource for ClassifiedSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES
            | DataClass::REFERENCES
            | DataClass::THREADS
            | DataClass::CONTEXTS
            | DataClass::METRICS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        requested
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        if needed.has_attributes() {
            let mut rs = MetricSettings::new("CALLS", "relation-routed");
            rs.scopes = MetricScopeSet::POINT;
            let mr = h.metric_ex(rs, true);
            mr.stats_access().request_sum_partial();
            h.metric_freeze(&mr);
            let mut fs = MetricSettings::new("CYCLES", "flat");
            fs.scopes = MetricScopeSet::POINT;
            let mf = h.metric(fs);
            mf.stats_access().request_sum_partial();
            h.metric_freeze(&mf);
            *self.out_metrics.lock().unwrap() = Some((mr.clone(), mf.clone()));
            self.metrics = Some((mr, mf));
        }
        if needed.has_threads() {
            let tt = h.thread(rank_thread_tuple());
            self.state = Some((tt, h.global(), h.global()));
        }
        if needed.has_contexts() {
            let module = h.module("/bin/m".into());
            let root = h.global();
            *self.out_root.lock().unwrap() = Some(root.clone());
            let (rel, flat) = h.context(
                &root,
                NestedScope::new(Relation::Call, Scope::Point { module, offset: 0x200 }),
            );
            let tt = self.state.take().unwrap().0;
            self.state = Some((tt, rel, flat));
        }
        if needed.has_metrics() {
            let (tt, rel, flat) = self.state.as_ref().unwrap();
            let (mr, mf) = self.metrics.as_ref().unwrap();
            h.accumulate_to(tt, rel).add(mr, 1.0);
            h.accumulate_to(tt, flat).add(mf, 1.0);
        }
        Ok(())
    }
}

#[test]
fn s2_classification_inserts_intermediate_contexts() {
    let (sink, log, _) = RecordingSink::new(DataClass::empty());
    let out_root: Slot<Arc<Context>> = Default::default();
    let out_metrics: Slot<(Arc<Metric>, Arc<Metric>)> = Default::default();
    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(FunctionClassifier {
        handle: None,
        funcs: Mutex::new(HashMap::new()),
    }));
    b.add_source(Box::new(ClassifiedSource {
        handle: None,
        state: None,
        metrics: None,
        out_root: out_root.clone(),
        out_metrics: out_metrics.clone(),
    }));
    b.add_sink(sink);
    b.build(2).run().unwrap();

    let root = out_root.lock().unwrap().clone().unwrap();
    let (mr, mf) = out_metrics.lock().unwrap().clone().unwrap();

    // global -> call->function -> enclosure->point
    assert_eq!(root.child_count(), 1);
    let func_ctx = root.children().pop().unwrap();
    assert!(matches!(func_ctx.scope(), Scope::Function(_)));
    assert_eq!(func_ctx.relation(), Relation::Call);
    assert_eq!(func_ctx.child_count(), 1);
    let point_ctx = func_ctx.children().pop().unwrap();
    assert!(matches!(point_ctx.scope(), Scope::Point { offset: 0x200, .. }));
    assert_eq!(point_ctx.relation(), Relation::Enclosure);

    // Relation metric on the relation context, flat metric on the flat one.
    assert_eq!(func_ctx.data().get(&mr).unwrap().get(0, MetricScope::Point).sum, 1.0);
    assert!(func_ctx.data().get(&mf).is_none());
    assert_eq!(point_ctx.data().get(&mf).unwrap().get(0, MetricScope::Point).sum, 1.0);
    assert!(point_ctx.data().get(&mr).is_none());

    // Three contexts announced: global, function, point.
    let evs = log_of(&log);
    assert_eq!(evs.iter().filter(|e| matches!(e, Ev::Context(_))).count(), 3);
}

// ---------------------------------------------------------------------------
// S3/S4: bounded-disorder timepoints and the rewind protocol.

struct TimepointSource {
    handle: Option<SourceHandle>,
    times: Vec<u64>,
    disorder: u32,
    tt: Option<Arc<PerThreadTemporary>>,
    ctxs: Vec<Arc<Context>>,
}

impl ProfileSource for TimepointSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::THREADS | DataClass::CONTEXTS | DataClass::CTX_TIMEPOINTS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        if requested.has_ctx_timepoints() {
            requested | DataClass::THREADS | DataClass::CONTEXTS
        } else {
            requested
        }
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        if needed.has_threads() {
            let mut attrs = rank_thread_tuple();
            attrs.set_ctx_timepoint_disorder(self.disorder);
            self.tt = Some(h.thread(attrs));
        }
        if needed.has_contexts() {
            let root = h.global();
            for i in 0..2u64 {
                let (_r, c) = h.context(
                    &root,
                    NestedScope::new(Relation::Call, Scope::Placeholder(i)),
                );
                self.ctxs.push(c);
            }
        }
        if needed.has_ctx_timepoints() {
            let tt = self.tt.clone().unwrap();
            let mut attempts = 0;
            'replay: loop {
                attempts += 1;
                assert!(attempts <= 3, "unexpected rewind loop");
                for (i, &t) in self.times.iter().enumerate() {
                    let ctx = self.ctxs[i % self.ctxs.len()].clone();
                    match h.ctx_timepoint(&tt, ctx, t) {
                        TimepointStatus::Next => {}
                        TimepointStatus::RewindStart => continue 'replay,
                    }
                }
                break;
            }
        }
        Ok(())
    }
}

fn run_timepoints(times: Vec<u64>, disorder: u32) -> (Vec<Ev>, Option<(u64, u64)>) {
    let (sink, log, bounds) = RecordingSink::new(DataClass::empty());
    let mut b = PipelineBuilder::new();
    b.add_source(Box::new(TimepointSource {
        handle: None,
        times,
        disorder,
        tt: None,
        ctxs: Vec::new(),
    }));
    b.add_sink(sink);
    b.build(2).run().unwrap();
    let b = *bounds.lock().unwrap();
    (log_of(&log), b)
}

#[test]
fn s3_bounded_disorder_sorts_without_rewind() {
    let (evs, bounds) = run_timepoints(vec![5, 3, 6, 4, 7, 8], 2);
    assert!(!evs.contains(&Ev::CtxRewind));
    let delivered: Vec<u64> = evs
        .iter()
        .filter_map(|e| match e {
            Ev::CtxBatch(ts) => Some(ts.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, vec![3, 4, 5, 6, 7, 8]);
    assert_eq!(bounds, Some((3, 8)));

    // notify_thread_final comes after every timepoint batch.
    let last_batch = evs.iter().rposition(|e| matches!(e, Ev::CtxBatch(_))).unwrap();
    let final_pos = evs.iter().position(|e| *e == Ev::ThreadFinal).unwrap();
    assert!(final_pos > last_batch);
}

#[test]
fn s4_disorder_overflow_rewinds_and_upgrades() {
    let (evs, bounds) = run_timepoints(vec![5, 3, 10, 4], 1);
    let rewinds = evs.iter().filter(|e| **e == Ev::CtxRewind).count();
    assert_eq!(rewinds, 1, "one overflow, then the upgraded bound absorbs it");

    // Everything after the rewind is sorted and complete.
    let rewind_pos = evs.iter().position(|e| *e == Ev::CtxRewind).unwrap();
    let delivered: Vec<u64> = evs[rewind_pos..]
        .iter()
        .filter_map(|e| match e {
            Ev::CtxBatch(ts) => Some(ts.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(delivered, vec![3, 4, 5, 10]);
    assert_eq!(bounds, Some((3, 10)));
}

// ---------------------------------------------------------------------------
// S5: merged threads dedup across sources.

struct MergedSource {
    handle: Option<SourceHandle>,
    value: f64,
    tt: Option<Arc<PerThreadTemporary>>,
    ctx: Option<Arc<Context>>,
    metric: Option<Arc<Metric>>,
    out_ctx: Slot<Arc<Context>>,
    out_metric: Slot<Arc<Metric>>,
}

impl ProfileSource for MergedSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::THREADS | DataClass::CONTEXTS | DataClass::METRICS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        requested
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        if needed.has_attributes() {
            let mut s = MetricSettings::new("GPU", "merged");
            s.scopes = MetricScopeSet::POINT;
            let m = h.metric(s);
            m.stats_access().request_sum_partial();
            h.metric_freeze(&m);
            *self.out_metric.lock().unwrap() = Some(m.clone());
            self.metric = Some(m);
        }
        if needed.has_threads() {
            self.tt = Some(h.merged_thread(rank_thread_tuple()));
        }
        if needed.has_contexts() {
            let (_r, c) = h.context(
                &h.global(),
                NestedScope::new(Relation::Call, Scope::Placeholder(7)),
            );
            *self.out_ctx.lock().unwrap() = Some(c.clone());
            self.ctx = Some(c);
        }
        if needed.has_metrics() {
            h.accumulate_to(self.tt.as_ref().unwrap(), self.ctx.as_ref().unwrap())
                .add(self.metric.as_ref().unwrap(), self.value);
        }
        Ok(())
    }
}

#[test]
fn s5_merged_threads_share_one_temporary() {
    let (sink, log, _) = RecordingSink::new(DataClass::empty());
    let out_ctx: Slot<Arc<Context>> = Default::default();
    let out_metric: Slot<Arc<Metric>> = Default::default();
    let mut b = PipelineBuilder::new();
    for value in [1.0, 2.0] {
        b.add_source(Box::new(MergedSource {
            handle: None,
            value,
            tt: None,
            ctx: None,
            metric: None,
            out_ctx: out_ctx.clone(),
            out_metric: out_metric.clone(),
        }));
    }
    b.add_sink(sink);
    b.build(4).run().unwrap();

    let evs = log_of(&log);
    assert_eq!(evs.iter().filter(|e| **e == Ev::Thread).count(), 1);
    assert_eq!(evs.iter().filter(|e| **e == Ev::ThreadFinal).count(), 1);

    let ctx = out_ctx.lock().unwrap().clone().unwrap();
    let m = out_metric.lock().unwrap().clone().unwrap();
    assert_eq!(ctx.data().get(&m).unwrap().get(0, MetricScope::Point).sum, 3.0);
}

// ---------------------------------------------------------------------------
// Wavefront ordering: no Sink sees a wavefront before every Source finished
// reading that class.

struct TracingSource {
    handle: Option<SourceHandle>,
    trace: Arc<Mutex<Vec<String>>>,
    name: &'static str,
}

impl ProfileSource for TracingSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::CONTEXTS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        requested
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        if needed.has_contexts() {
            h.context(
                &h.global(),
                NestedScope::new(Relation::Call, Scope::Placeholder(1)),
            );
            self.trace.lock().unwrap().push(format!("{}:read:C", self.name));
        }
        Ok(())
    }
}

struct WaveTracingSink {
    trace: Arc<Mutex<Vec<String>>>,
}

impl ProfileSink for WaveTracingSink {
    fn bind(&mut self, _handle: SinkHandle) {}
    fn accepts(&self) -> DataClass {
        DataClass::CONTEXTS
    }
    fn wavefronts(&self) -> DataClass {
        DataClass::CONTEXTS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }
    fn notify_wavefront(&self, delivered: DataClass) {
        if delivered.has_contexts() {
            self.trace.lock().unwrap().push("wave:C".into());
        }
    }
    fn write(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn wavefront_delivered_after_all_sources_read() {
    let trace: Arc<Mutex<Vec<String>>> = Default::default();
    let mut b = PipelineBuilder::new();
    for name in ["s0", "s1", "s2"] {
        b.add_source(Box::new(TracingSource {
            handle: None,
            trace: trace.clone(),
            name,
        }));
    }
    b.add_sink(Box::new(WaveTracingSink { trace: trace.clone() }));
    b.build(3).run().unwrap();

    let t = trace.lock().unwrap().clone();
    let wave = t.iter().position(|s| s == "wave:C").expect("wavefront fired");
    let reads = t.iter().filter(|s| s.ends_with(":read:C")).count();
    assert_eq!(reads, 3);
    assert_eq!(
        t[..wave].iter().filter(|s| s.ends_with(":read:C")).count(),
        3,
        "every source finished contexts before the wavefront"
    );
}

// ---------------------------------------------------------------------------
// Ordered chains serialize the chained sinks' critical regions in
// registration order, regardless of which worker delivers first.

struct OrderedSink {
    name: &'static str,
    trace: Arc<Mutex<Vec<String>>>,
    handle: Option<SinkHandle>,
}

impl ProfileSink for OrderedSink {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::CONTEXTS
    }
    fn wavefronts(&self) -> DataClass {
        DataClass::CONTEXTS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }
    fn notify_wavefront(&self, _delivered: DataClass) {
        let h = self.handle.as_ref().unwrap();
        let _guard = h.enter_ordered_wavefront();
        self.trace.lock().unwrap().push(format!("wave:{}", self.name));
    }
    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().unwrap();
        let _guard = h.enter_ordered_write();
        self.trace.lock().unwrap().push(format!("write:{}", self.name));
        Ok(())
    }
}

#[test]
fn ordered_chains_serialize_in_registration_order() {
    let trace: Arc<Mutex<Vec<String>>> = Default::default();
    let mut b = PipelineBuilder::new();
    b.add_source(Box::new(TracingSource {
        handle: None,
        trace: Default::default(),
        name: "s",
    }));
    for name in ["first", "second", "third"] {
        b.add_sink_with(
            Box::new(OrderedSink { name, trace: trace.clone(), handle: None }),
            prof_pipeline::SinkOptions { ordered_wavefront: true, ordered_write: true },
        );
    }
    b.build(4).run().unwrap();

    let t = trace.lock().unwrap().clone();
    let waves: Vec<&String> = t.iter().filter(|s| s.starts_with("wave:")).collect();
    assert_eq!(waves, ["wave:first", "wave:second", "wave:third"]);
    let writes: Vec<&String> = t.iter().filter(|s| s.starts_with("write:")).collect();
    assert_eq!(writes, ["write:first", "write:second", "write:third"]);
}

// Sinks whose wavefront classes have no provider still progress.
#[test]
fn unscheduled_wavefronts_deliver_immediately() {
    let (sink, log, _) = RecordingSink::new(DataClass::THREADS | DataClass::ATTRIBUTES);
    let trace: Arc<Mutex<Vec<String>>> = Default::default();
    let mut b = PipelineBuilder::new();
    // Provides attributes/references/contexts but never threads.
    b.add_source(Box::new(TracingSource { handle: None, trace, name: "s" }));
    b.add_sink(sink);
    b.build(2).run().unwrap();

    let evs = log_of(&log);
    let waves: Vec<DataClass> = evs
        .iter()
        .filter_map(|e| match e {
            Ev::Wavefront(d) => Some(*d),
            _ => None,
        })
        .collect();
    assert!(!waves.is_empty());
    assert!(waves.iter().any(|d| d.has_threads()));
    assert!(waves.last().unwrap().has_attributes());
}
