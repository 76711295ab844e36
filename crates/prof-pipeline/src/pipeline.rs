//! The pipeline orchestrator: shared state, the wavefront schedule, and the
//! worker-team run loop.

use crate::finalizer::ProfileFinalizer;
use crate::sink::ProfileSink;
use crate::source::ProfileSource;
use crate::work::OnceSignal;
use prof_model::timepoints::{FALLBACK_DISORDER, STAGING_FLUSH};
use prof_model::{
    ByPtr, Context, ContextFlowGraph, ContextReconstruction, CtxTimepoint, DataClass,
    ExtensionClass, ExtraStatistic, File, IdTuple, Metric, MetricIdentifier, MetricSettings,
    MetricTimepoint, Module, NestedScope, Ns, PerThreadTemporary, ProfileAttributes, Registry,
    Relation, Scope, Thread, ThreadAttributes, TimepointsData, Timestamped, UniquedSet,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, OnceLock, RwLock};
use tracing::{debug, error, info, warn};

/// Fatal failures of the run itself. Everything recoverable is handled
/// inside the run and logged instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("sink #{sink} failed to write its output: {source}")]
    SinkWrite {
        sink: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Response to a timepoint emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimepointStatus {
    /// Keep going with the next timepoint.
    Next,
    /// Discard everything emitted for this stream and replay it from the
    /// beginning.
    RewindStart,
}

#[derive(Debug, Default)]
pub(crate) struct WavefrontStatus {
    state: DataClass,
    delivered: DataClass,
}

pub(crate) struct SinkEntry {
    pub sink: Box<dyn ProfileSink>,
    pub data_limit: DataClass,
    pub wave_limit: DataClass,
    #[allow(dead_code)]
    pub ext_limit: ExtensionClass,
    /// Wavefront classes that must pass before this sink's own deliveries,
    /// from the ordered wavefront chain.
    pub wavefront_prior_delay: DataClass,
    pub ordered_wavefront: bool,
    pub ordered_write: bool,
    pub prior_wavefront: Option<usize>,
    pub prior_write: Option<usize>,
    pub wavefront_dep: OnceSignal,
    pub write_dep: OnceSignal,
    pub status: Mutex<WavefrontStatus>,
}

pub(crate) struct Finalizers {
    pub all: Vec<Box<dyn ProfileFinalizer>>,
    pub identifier: Vec<usize>,
    pub resolved_path: Vec<usize>,
    pub classification: Vec<usize>,
    pub statistics: Vec<usize>,
}

pub(crate) struct SourceState {
    pub source: Option<Box<dyn ProfileSource>>,
    pub read: DataClass,
}

pub(crate) struct SourceCell {
    pub state: Mutex<SourceState>,
    pub data_limit: DataClass,
    pub waves_complete: OnceSignal,
}

#[derive(Default)]
pub(crate) struct SourceLocal {
    pub threads: Vec<Arc<PerThreadTemporary>>,
    pub last_wave: bool,
    /// Classes this Source has finished reading; further emission of them
    /// is a contract violation.
    pub disabled: DataClass,
    pub thawed: HashSet<ByPtr<Metric>>,
}

pub(crate) struct Schedule {
    pub scheduled: DataClass,
    pub scheduled_waves: DataClass,
    pub unscheduled_waves: DataClass,
}

/// All state shared between the run loop, the handles, and the collaborators.
pub(crate) struct PipelineCore {
    pub sinks: Vec<SinkEntry>,
    pub finalizers: Finalizers,
    pub modules: UniquedSet<PathBuf, Module>,
    pub files: UniquedSet<PathBuf, File>,
    pub metrics: UniquedSet<MetricSettings, Metric>,
    pub estats: UniquedSet<String, ExtraStatistic>,
    pub graphs: UniquedSet<Scope, ContextFlowGraph>,
    pub threads: Registry<Thread>,
    pub global: Arc<Context>,
    pub attrs: Mutex<ProfileAttributes>,
    pub timepoint_bounds: Mutex<Option<(Ns, Ns)>>,
    pub merged: RwLock<std::collections::HashMap<IdTuple, Arc<PerThreadTemporary>>>,
    pub source_cells: OnceLock<Vec<SourceCell>>,
    pub source_locals: OnceLock<Vec<Mutex<SourceLocal>>>,
    pub schedule: OnceLock<Schedule>,
    #[allow(dead_code)]
    pub requested: ExtensionClass,
    pub team_size: usize,
}

impl PipelineCore {
    pub fn cells(&self) -> &[SourceCell] {
        self.source_cells.get().expect("pipeline sources not bound")
    }
    pub fn locals(&self) -> &[Mutex<SourceLocal>] {
        self.source_locals.get().expect("pipeline sources not bound")
    }
    pub fn sched(&self) -> &Schedule {
        self.schedule.get().expect("pipeline schedule not computed")
    }

    fn for_sinks(&self, wanted: DataClass, mut f: impl FnMut(&SinkEntry)) {
        for e in &self.sinks {
            if e.data_limit.any_of(wanted) {
                f(e);
            }
        }
    }

    // ---- entity creation + notification -----------------------------------

    pub fn module(&self, path: PathBuf, relative: Option<PathBuf>) -> Arc<Module> {
        let (m, first) = self
            .modules
            .ensure(path.clone(), || Module::new(path, relative));
        if first {
            self.for_sinks(DataClass::REFERENCES, |e| e.sink.notify_module(&m));
        }
        m
    }

    pub fn file(&self, path: PathBuf) -> Arc<File> {
        let (f, first) = self.files.ensure(path.clone(), || File::new(path));
        if first {
            self.for_sinks(DataClass::REFERENCES, |e| e.sink.notify_file(&f));
        }
        f
    }

    pub fn metric(&self, settings: MetricSettings, relation: bool) -> Arc<Metric> {
        let (m, _first) = self
            .metrics
            .ensure(settings.clone(), || Metric::with_relation(settings, relation));
        if !m.is_frozen() {
            for &i in &self.finalizers.statistics {
                self.finalizers.all[i].append_statistics(&m, m.stats_access());
            }
        }
        m
    }

    pub fn metric_freeze(&self, m: &Arc<Metric>) {
        if m.freeze() {
            self.for_sinks(DataClass::ATTRIBUTES, |e| e.sink.notify_metric(m));
        }
    }

    pub fn extra_statistic(&self, es: ExtraStatistic) -> Arc<ExtraStatistic> {
        let (e, first) = self.estats.ensure(es.name.clone(), || es);
        if first {
            self.for_sinks(DataClass::ATTRIBUTES, |s| s.sink.notify_extra_statistic(&e));
        }
        e
    }

    pub fn new_thread(&self, attrs: ThreadAttributes) -> Arc<Thread> {
        let t = Arc::new(Thread::new(attrs));
        self.threads.push(t.clone());
        self.for_sinks(DataClass::THREADS, |e| e.sink.notify_thread(&t));
        t
    }

    pub fn merged_thread(&self, attrs: ThreadAttributes) -> Arc<PerThreadTemporary> {
        let key = attrs.idtuple_key();
        {
            let map = self.merged.read().expect("merged threads poisoned");
            if let Some(tt) = map.get(&key) {
                return tt.clone();
            }
        }
        let mut map = self.merged.write().expect("merged threads poisoned");
        if let Some(tt) = map.get(&key) {
            return tt.clone();
        }
        let t = self.new_thread(attrs);
        let tt = Arc::new(PerThreadTemporary::new(t));
        map.insert(key, tt.clone());
        tt
    }

    pub fn notify_context(&self, c: &Arc<Context>) {
        self.for_sinks(DataClass::CONTEXTS, |e| e.sink.notify_context(c));
    }

    /// Classification-aware child lookup. Returns (relation ctx, flat ctx).
    pub fn context(
        &self,
        parent: &Arc<Context>,
        ns: NestedScope,
        classify: bool,
    ) -> (Arc<Context>, Arc<Context>) {
        let mut res_ns = ns.clone();
        let mut relation: Option<Arc<Context>> = None;
        let mut flat_parent = parent.clone();
        if classify {
            for &i in &self.finalizers.classification {
                let mut this_ns = ns.clone();
                if let Some(cls) = self.finalizers.all[i].classify(parent, &mut this_ns) {
                    res_ns = this_ns;
                    relation = cls.relation;
                    flat_parent = cls.flat_parent;
                    break;
                }
            }
        }
        let (flat, first) = flat_parent.ensure(res_ns);
        if first {
            self.notify_context(&flat);
        }
        (relation.unwrap_or_else(|| flat.clone()), flat)
    }

    /// Get or build the flow graph for a Scope. Absent (None) when no
    /// classifier could say anything about it.
    pub fn context_flow_graph(&self, scope: &Scope) -> Option<Arc<ContextFlowGraph>> {
        let (fg, first) = self
            .graphs
            .ensure(scope.clone(), || ContextFlowGraph::new(scope.clone()));
        if first {
            for &i in &self.finalizers.classification {
                if self.finalizers.all[i].resolve_graph(&fg) {
                    break;
                }
            }
            fg.freeze(&mut |s| {
                debug_assert!(s != scope);
                self.context_flow_graph(s);
            });
        } else {
            // The creating thread freezes without blocking; requests form a
            // DAG over strictly different Scopes, so this terminates.
            while !fg.is_frozen() {
                std::thread::yield_now();
            }
        }
        if fg.is_empty() { None } else { Some(fg) }
    }

    pub fn context_reconstruction(
        &self,
        graph: &Arc<ContextFlowGraph>,
        root: &Arc<Context>,
    ) -> Arc<ContextReconstruction> {
        debug_assert!(!graph.is_empty(), "reconstruction of an empty flow graph");
        let (rc, first) = root.ensure_reconstruction(graph);
        if first {
            rc.instantiate(&mut |parent, scope| {
                self.context(parent, NestedScope::new(Relation::Call, scope.clone()), true)
                    .1
            });
        }
        rc
    }

    pub fn add_graph_to_group(
        &self,
        tt: &PerThreadTemporary,
        gid: u64,
        graph: &Arc<ContextFlowGraph>,
    ) {
        tt.with_group(gid, |group| {
            let key = ByPtr::new(graph.clone());
            if group.fg_reconsts.contains_key(&key) {
                return;
            }
            let mut reconsts = HashSet::new();
            for entry in graph.entries() {
                if let Some(roots) = group.c_entries.get(entry) {
                    for root in roots {
                        reconsts
                            .insert(ByPtr::new(self.context_reconstruction(graph, root.inner())));
                    }
                }
            }
            group.fg_reconsts.insert(key, reconsts);
        });
    }

    pub fn add_root_to_group(
        &self,
        tt: &PerThreadTemporary,
        gid: u64,
        root: &Arc<Context>,
        entry: Scope,
    ) {
        tt.with_group(gid, |group| {
            if !group
                .c_entries
                .entry(entry.clone())
                .or_default()
                .insert(ByPtr::new(root.clone()))
            {
                return;
            }
            let mut additions = Vec::new();
            for (graph, _) in group.fg_reconsts.iter() {
                if graph.entries().contains(&entry) {
                    additions.push(graph.clone());
                }
            }
            for graph in additions {
                let rc = self.context_reconstruction(graph.inner(), root);
                group
                    .fg_reconsts
                    .get_mut(&graph)
                    .expect("graph vanished from group")
                    .insert(ByPtr::new(rc));
            }
        });
    }

    // ---- lazy extensions ---------------------------------------------------

    pub fn module_id(&self, m: &Arc<Module>) -> u32 {
        *m.identifier_cell().get_or_init(|| {
            for &i in &self.finalizers.identifier {
                if let Some(v) = self.finalizers.all[i].identify_module(m) {
                    return v;
                }
            }
            u32::MAX
        })
    }

    pub fn file_id(&self, f: &Arc<File>) -> u32 {
        *f.identifier_cell().get_or_init(|| {
            for &i in &self.finalizers.identifier {
                if let Some(v) = self.finalizers.all[i].identify_file(f) {
                    return v;
                }
            }
            u32::MAX
        })
    }

    pub fn metric_id(&self, m: &Arc<Metric>) -> MetricIdentifier {
        *m.identifier_cell().get_or_init(|| {
            for &i in &self.finalizers.identifier {
                if let Some(v) = self.finalizers.all[i].identify_metric(m) {
                    return v;
                }
            }
            MetricIdentifier::new(u32::MAX, m.partials().len(), m.scopes())
        })
    }

    pub fn context_id(&self, c: &Arc<Context>) -> u32 {
        *c.identifier_cell().get_or_init(|| {
            for &i in &self.finalizers.identifier {
                if let Some(v) = self.finalizers.all[i].identify_context(c) {
                    return v;
                }
            }
            u32::MAX
        })
    }

    pub fn thread_id(&self, t: &Arc<Thread>) -> u32 {
        *t.identifier_cell().get_or_init(|| {
            for &i in &self.finalizers.identifier {
                if let Some(v) = self.finalizers.all[i].identify_thread(t) {
                    return v;
                }
            }
            u32::MAX
        })
    }

    fn default_resolved(path: &std::path::Path) -> PathBuf {
        if !path.as_os_str().is_empty() && path.is_absolute() && path.exists() {
            path.to_path_buf()
        } else {
            PathBuf::new()
        }
    }

    pub fn resolved_path_module(&self, m: &Arc<Module>) -> PathBuf {
        m.resolved_path_cell()
            .get_or_init(|| {
                for &i in &self.finalizers.resolved_path {
                    if let Some(v) = self.finalizers.all[i].resolve_path_module(m) {
                        debug_assert!(v.as_os_str().is_empty() || v.is_absolute());
                        return v;
                    }
                }
                Self::default_resolved(m.path())
            })
            .clone()
    }

    pub fn resolved_path_file(&self, f: &Arc<File>) -> PathBuf {
        f.resolved_path_cell()
            .get_or_init(|| {
                for &i in &self.finalizers.resolved_path {
                    if let Some(v) = self.finalizers.all[i].resolve_path_file(f) {
                        debug_assert!(v.as_os_str().is_empty() || v.is_absolute());
                        return v;
                    }
                }
                Self::default_resolved(f.path())
            })
            .clone()
    }

    // ---- attributes and bounds --------------------------------------------

    pub fn merge_attributes(&self, attrs: ProfileAttributes) {
        self.attrs.lock().expect("attrs poisoned").merge(attrs);
    }

    pub fn merge_timepoint_bounds(&self, (min, max): (Ns, Ns)) {
        let mut b = self.timepoint_bounds.lock().expect("bounds poisoned");
        *b = match *b {
            Some((lo, hi)) => Some((lo.min(min), hi.max(max))),
            None => Some((min, max)),
        };
    }

    // ---- timepoints --------------------------------------------------------

    fn enqueue_timepoint<T: Timestamped>(
        &self,
        tpd: &mut TimepointsData<T>,
        tp: T,
        stream: &str,
        notify_batch: &dyn Fn(&PipelineCore, &[T]),
        notify_rewind: &dyn Fn(&PipelineCore),
    ) -> TimepointStatus {
        if tpd.unbounded_disorder {
            // Collect the whole stream; sorted at thread finalization.
            tpd.staging.push(tp);
            return TimepointStatus::Next;
        }

        let mut tp = tp;
        if tpd.sort_buf.bound() > 0 {
            if !tpd.sort_buf.full() {
                tpd.sort_buf.push(tp);
                return TimepointStatus::Next;
            }
            let (evicted, over) = tpd.sort_buf.replace(tp);
            if over {
                tpd.sort_buf.clear();
                tpd.staging.clear();
                if tpd.sort_buf.bound() < 800 {
                    // Rewinds are expensive; only retry with the bigger
                    // bound when the failed attempt was much smaller.
                    debug!(stream, "timepoint disorder bound exceeded, retrying with {FALLBACK_DISORDER}");
                    tpd.sort_buf = prof_model::SortBuf::new(FALLBACK_DISORDER as usize + 2);
                } else {
                    warn!(
                        stream,
                        "timepoint stream is extremely unordered, falling back to an \
                         in-memory sort; this will significantly increase memory usage"
                    );
                    tpd.unbounded_disorder = true;
                }
                notify_rewind(self);
                return TimepointStatus::RewindStart;
            }
            tp = evicted;
        }

        tpd.staging.push(tp);
        if tpd.staging.len() >= STAGING_FLUSH {
            let batch = std::mem::take(&mut tpd.staging);
            notify_batch(self, &batch);
            tpd.staging.reserve(STAGING_FLUSH);
        }
        TimepointStatus::Next
    }

    pub fn ctx_timepoint(
        &self,
        tt: &PerThreadTemporary,
        ctx: Arc<Context>,
        time: Ns,
    ) -> TimepointStatus {
        tt.observe_time(time);
        let thread = tt.thread().clone();
        let mut tpd = tt.ctx_timepoints();
        self.enqueue_timepoint(
            &mut tpd,
            CtxTimepoint { time, context: ctx },
            "ctx",
            &|core, batch| {
                core.for_sinks(DataClass::CTX_TIMEPOINTS, |e| {
                    e.sink.notify_timepoints(&thread, batch)
                });
            },
            &|core| {
                core.for_sinks(DataClass::CTX_TIMEPOINTS, |e| {
                    e.sink.notify_ctx_timepoint_rewind(&thread)
                });
            },
        )
    }

    pub fn metric_timepoint(
        &self,
        tt: &PerThreadTemporary,
        m: &Arc<Metric>,
        value: f64,
        time: Ns,
    ) -> TimepointStatus {
        tt.observe_time(time);
        let thread = tt.thread().clone();
        let mut map = tt.metric_timepoints();
        let tpd = map.entry(ByPtr::new(m.clone())).or_insert_with(|| {
            TimepointsData::new(thread.attributes.metric_timepoint_disorder(m.name()))
        });
        self.enqueue_timepoint(
            tpd,
            MetricTimepoint { time, value },
            "metric",
            &|core, batch| {
                core.for_sinks(DataClass::METRIC_TIMEPOINTS, |e| {
                    e.sink.notify_metric_timepoints(&thread, m, batch)
                });
            },
            &|core| {
                core.for_sinks(DataClass::METRIC_TIMEPOINTS, |e| {
                    e.sink.notify_metric_timepoint_rewind(&thread, m)
                });
            },
        )
    }

    // ---- wavefronts --------------------------------------------------------

    /// Update one Sink's wavefront view and deliver a notification when
    /// everything it is waiting on has passed.
    pub fn notify_sink_wave(&self, idx: usize, new_waves: DataClass) {
        let e = &self.sinks[idx];
        let all_waves;
        {
            let mut st = e.status.lock().expect("wavefront status poisoned");
            st.state |= new_waves;
            if st.delivered.all_of(st.state & e.wave_limit) {
                return;
            }
            if !st
                .state
                .all_of(e.wavefront_prior_delay & self.sched().scheduled_waves)
            {
                return;
            }
            let newly_delivered = st.state & e.wave_limit;
            st.delivered |= newly_delivered;
            all_waves = st.delivered;
        }
        e.sink.notify_wavefront(all_waves);
    }

    // ---- thread completion -------------------------------------------------

    /// Drain a thread's timepoints, finalize its accumulations, and hand it
    /// to the Sinks.
    pub fn complete(&self, tt: &Arc<PerThreadTemporary>, bounds: &mut Option<(Ns, Ns)>) {
        let thread = tt.thread().clone();
        {
            let mut tpd = tt.ctx_timepoints();
            if !tpd.staging.is_empty() {
                if tpd.unbounded_disorder {
                    tpd.staging.sort_by_key(|t| t.time);
                }
                let batch = std::mem::take(&mut tpd.staging);
                self.for_sinks(DataClass::CTX_TIMEPOINTS, |e| {
                    e.sink.notify_timepoints(&thread, &batch)
                });
            }
            if !tpd.sort_buf.is_empty() {
                let batch = tpd.sort_buf.sorted();
                self.for_sinks(DataClass::CTX_TIMEPOINTS, |e| {
                    e.sink.notify_timepoints(&thread, &batch)
                });
            }
        }
        {
            let mut map = tt.metric_timepoints();
            for (m, tpd) in map.iter_mut() {
                if !tpd.staging.is_empty() {
                    if tpd.unbounded_disorder {
                        tpd.staging.sort_by_key(|t| t.time);
                    }
                    let batch = std::mem::take(&mut tpd.staging);
                    self.for_sinks(DataClass::METRIC_TIMEPOINTS, |e| {
                        e.sink.notify_metric_timepoints(&thread, m.inner(), &batch)
                    });
                }
                if !tpd.sort_buf.is_empty() {
                    let batch = tpd.sort_buf.sorted();
                    self.for_sinks(DataClass::METRIC_TIMEPOINTS, |e| {
                        e.sink.notify_metric_timepoints(&thread, m.inner(), &batch)
                    });
                }
            }
        }

        if let Some(b) = tt.time_bounds() {
            *bounds = match *bounds {
                Some((lo, hi)) => Some((lo.min(b.0), hi.max(b.1))),
                None => Some(b),
            };
        }

        tt.finalize();
        self.for_sinks(DataClass::THREADS, |e| e.sink.notify_thread_final(tt));
    }
}

/// A configured pipeline, ready to run.
pub struct ProfilePipeline {
    pub(crate) core: Arc<PipelineCore>,
}

fn for_dynamic(cursor: &AtomicUsize, len: usize, mut f: impl FnMut(usize)) {
    loop {
        let i = cursor.fetch_add(1, Ordering::AcqRel);
        if i >= len {
            break;
        }
        f(i);
    }
}

impl ProfilePipeline {
    /// Drive every Source to completion and every Sink through its write,
    /// using a fixed team of worker threads.
    pub fn run(self) -> Result<(), PipelineError> {
        let core = &self.core;
        let team = core.team_size.max(1);
        let cells = core.cells();
        let n_sources = cells.len();
        let n_sinks = core.sinks.len();
        let sched = core.sched();
        info!(
            target: "pipeline.run",
            sources = n_sources,
            sinks = n_sinks,
            team,
            scheduled = %sched.scheduled,
            waves = %sched.scheduled_waves,
            "starting pipeline"
        );

        const WAVE_ORDER: [DataClass; 4] = [
            DataClass::ATTRIBUTES,
            DataClass::REFERENCES,
            DataClass::THREADS,
            DataClass::CONTEXTS,
        ];
        let countdowns: Vec<AtomicUsize> =
            (0..WAVE_ORDER.len()).map(|_| AtomicUsize::new(n_sources)).collect();
        let wave_cursors: Vec<AtomicUsize> =
            (0..WAVE_ORDER.len()).map(|_| AtomicUsize::new(0)).collect();
        let unsched_cursor = AtomicUsize::new(0);
        let nowave_cursor = AtomicUsize::new(0);
        let finishing_cursor = AtomicUsize::new(0);
        let release_cursor = AtomicUsize::new(0);
        let write_cursor = AtomicUsize::new(0);
        let barrier = Barrier::new(team);
        let (merged_tx, merged_rx) = crossbeam_channel::unbounded::<Arc<PerThreadTemporary>>();
        let merged_tx = Mutex::new(Some(merged_tx));
        let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..team {
                s.spawn(|| {
                    // Unscheduled wavefronts are delivered immediately so
                    // Sinks without a provider still progress.
                    for_dynamic(&unsched_cursor, n_sinks, |i| {
                        core.notify_sink_wave(i, sched.unscheduled_waves);
                    });

                    // Sources with no scheduled waves go straight to the
                    // finishing wave.
                    for_dynamic(&nowave_cursor, n_sources, |i| {
                        if !(sched.scheduled_waves & cells[i].data_limit).has_any() {
                            cells[i].waves_complete.signal();
                        }
                    });

                    for (w, class) in WAVE_ORDER.into_iter().enumerate() {
                        if !(class & sched.scheduled_waves).has_any() {
                            continue;
                        }
                        for_dynamic(&wave_cursors[w], n_sources, |i| {
                            let cell = &cells[i];
                            {
                                let mut st =
                                    cell.state.lock().expect("source state poisoned");
                                let prior_read = st.read;
                                let mut req = DataClass::empty();
                                let mut failed = false;
                                if let Some(src) = st.source.as_mut() {
                                    req = (src.finalize_request(class) - prior_read)
                                        & cell.data_limit;
                                    if req.has_any() {
                                        if let Err(e) = src.read(req) {
                                            warn!(
                                                target: "pipeline.waves",
                                                source = i,
                                                error = %e,
                                                "source failed, dropping its remaining contribution"
                                            );
                                            failed = true;
                                        }
                                        #[cfg(debug_assertions)]
                                        {
                                            core.locals()[i]
                                                .lock()
                                                .expect("source local poisoned")
                                                .disabled |= req;
                                        }
                                    }
                                }
                                st.read |= req;
                                if failed {
                                    st.source = None;
                                }
                                if st.read.all_of(sched.scheduled_waves & cell.data_limit)
                                    || st.source.is_none()
                                {
                                    cell.waves_complete.signal();
                                }
                            }
                            if countdowns[w].fetch_sub(1, Ordering::AcqRel) == 1 {
                                for j in 0..n_sinks {
                                    core.notify_sink_wave(j, class);
                                }
                            }
                        });
                    }

                    // Finishing wave: metrics, timepoints, reconstructions.
                    let mut local_bounds: Option<(Ns, Ns)> = None;
                    for_dynamic(&finishing_cursor, n_sources, |i| {
                        let cell = &cells[i];
                        cell.waves_complete.wait();
                        {
                            let mut st = cell.state.lock().expect("source state poisoned");
                            core.locals()[i]
                                .lock()
                                .expect("source local poisoned")
                                .last_wave = true;
                            let prior_read = st.read;
                            let mut req = DataClass::empty();
                            let mut failed = false;
                            if let Some(src) = st.source.as_mut() {
                                req = (src
                                    .finalize_request(sched.scheduled - sched.scheduled_waves)
                                    - prior_read)
                                    & cell.data_limit;
                                if req.has_any() {
                                    if let Err(e) = src.read(req) {
                                        warn!(
                                            target: "pipeline.waves",
                                            source = i,
                                            error = %e,
                                            "source failed in the finishing wave"
                                        );
                                        failed = true;
                                    }
                                }
                            }
                            st.read |= req;
                            if failed {
                                st.source = None;
                            }
                        }
                        let (threads, thawed_empty) = {
                            let mut sl =
                                core.locals()[i].lock().expect("source local poisoned");
                            (std::mem::take(&mut sl.threads), sl.thawed.is_empty())
                        };
                        debug_assert!(
                            thawed_empty,
                            "source finished without freezing all of its metrics"
                        );
                        for tt in threads {
                            core.complete(&tt, &mut local_bounds);
                        }
                    });

                    // Everything must be read before merged threads drain.
                    if barrier.wait().is_leader() {
                        let tx = merged_tx
                            .lock()
                            .expect("merged sender poisoned")
                            .take()
                            .expect("one leader per run");
                        let map = core.merged.read().expect("merged threads poisoned");
                        for tt in map.values() {
                            tx.send(tt.clone()).expect("merged receiver alive");
                        }
                        // Sender drops here; the channel is fully stocked.
                    }
                    barrier.wait();

                    while let Ok(tt) = merged_rx.try_recv() {
                        core.complete(&tt, &mut local_bounds);
                    }

                    if let Some(b) = local_bounds {
                        core.merge_timepoint_bounds(b);
                    }

                    // All threads handled before Sinks start writing.
                    barrier.wait();

                    // Free input state early, then let the Sinks write.
                    for_dynamic(&release_cursor, n_sources, |i| {
                        cells[i].state.lock().expect("source state poisoned").source = None;
                    });

                    for_dynamic(&write_cursor, n_sinks, |i| {
                        if let Err(e) = core.sinks[i].sink.write() {
                            error!(target: "pipeline.run", sink = i, error = %e, "sink write failed");
                            let mut slot = first_error.lock().expect("error slot poisoned");
                            if slot.is_none() {
                                *slot = Some(PipelineError::SinkWrite { sink: i, source: e });
                            }
                        }
                    });

                    // Out of work: assist the remaining Sinks' workshares.
                    let mut working: Vec<usize> = (0..n_sinks).collect();
                    let mut didwork = true;
                    while !working.is_empty() {
                        if !didwork {
                            std::thread::yield_now();
                        }
                        didwork = false;
                        working.retain(|&i| {
                            let r = core.sinks[i].sink.help();
                            didwork |= r.contributed;
                            !r.completed
                        });
                    }
                });
            }
        });

        match first_error.into_inner().expect("error slot poisoned") {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
