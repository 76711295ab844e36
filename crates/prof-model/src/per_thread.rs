//! Transient per-thread state during ingest.
//!
//! A `PerThreadTemporary` lives from a thread's first sample until its
//! end-of-thread finalization. Accumulations are thread-local until
//! `finalize`, which distributes reconstruction-group values per the flow
//! graph handlers and folds everything into the shared per-Context
//! accumulators with scope propagation. The maps are internally locked
//! because merged threads are shared across Sources.

use crate::context::Context;
use crate::graph::{ContextFlowGraph, ContextReconstruction};
use crate::metric::{AccumulatorRaw, Metric, MetricScope};
use crate::scope::{Relation, Scope};
use crate::attributes::Thread;
use crate::timepoints::{CtxTimepoint, MetricTimepoint, Ns, TimepointsData};
use crate::util::ByPtr;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-local accumulations for one target: per-Metric, per-Partial raws.
pub type MetricValues = HashMap<ByPtr<Metric>, Vec<AccumulatorRaw>>;

fn add_value(values: &mut MetricValues, m: &Arc<Metric>, v: f64) {
    let raws = values
        .entry(ByPtr::new(m.clone()))
        .or_insert_with(|| vec![AccumulatorRaw::default(); m.partials().len().max(1)]);
    for (raw, p) in raws.iter_mut().zip(m.partials()) {
        raw.add(p.apply(v));
    }
}

fn merge_values(into: &mut MetricValues, m: &ByPtr<Metric>, raws: &[AccumulatorRaw], factor: f64) {
    let dst = into
        .entry(m.clone())
        .or_insert_with(|| vec![AccumulatorRaw::default(); raws.len()]);
    for (d, r) in dst.iter_mut().zip(raws) {
        d.add_raw(r.scaled(factor));
    }
}

/// Pooled state for one reconstruction group id.
#[derive(Default)]
pub struct ReconstructionGroup {
    /// Reconstructions instantiated so far, per flow graph.
    pub fg_reconsts: HashMap<ByPtr<ContextFlowGraph>, HashSet<ByPtr<ContextReconstruction>>>,
    /// Roots registered so far, per entry Scope they were seen calling.
    pub c_entries: HashMap<Scope, HashSet<ByPtr<Context>>>,
    /// Unresolved accumulations against whole flow graphs.
    pub fg_data: HashMap<ByPtr<ContextFlowGraph>, MetricValues>,
    /// Accumulations against the group's roots directly.
    pub c_data: HashMap<ByPtr<Context>, MetricValues>,
}

struct AccumStore {
    c_data: HashMap<ByPtr<Context>, MetricValues>,
    r_data: HashMap<ByPtr<ContextReconstruction>, MetricValues>,
}

/// Per-thread staging for everything a Source emits about one Thread.
pub struct PerThreadTemporary {
    thread: Arc<Thread>,
    accum: Mutex<AccumStore>,
    r_groups: Mutex<HashMap<u64, ReconstructionGroup>>,
    pub(crate) ctx_tp: Mutex<TimepointsData<CtxTimepoint>>,
    pub(crate) metric_tp: Mutex<HashMap<ByPtr<Metric>, TimepointsData<MetricTimepoint>>>,
    finalized: Mutex<HashMap<ByPtr<Context>, MetricValues>>,
    min_time: AtomicU64,
    max_time: AtomicU64,
}

impl PerThreadTemporary {
    pub fn new(thread: Arc<Thread>) -> Self {
        let ctx_disorder = thread.attributes.ctx_timepoint_disorder();
        PerThreadTemporary {
            thread,
            accum: Mutex::new(AccumStore { c_data: HashMap::new(), r_data: HashMap::new() }),
            r_groups: Mutex::new(HashMap::new()),
            ctx_tp: Mutex::new(TimepointsData::new(ctx_disorder)),
            metric_tp: Mutex::new(HashMap::new()),
            finalized: Mutex::new(HashMap::new()),
            min_time: AtomicU64::new(u64::MAX),
            max_time: AtomicU64::new(0),
        }
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    pub fn observe_time(&self, t: Ns) {
        self.min_time.fetch_min(t, Ordering::Relaxed);
        self.max_time.fetch_max(t, Ordering::Relaxed);
    }

    /// Observed (min, max) timepoint times, when any timepoint was seen.
    pub fn time_bounds(&self) -> Option<(Ns, Ns)> {
        let min = self.min_time.load(Ordering::Relaxed);
        let max = self.max_time.load(Ordering::Relaxed);
        if min > max { None } else { Some((min, max)) }
    }

    pub fn add_to_context(&self, ctx: &Arc<Context>, m: &Arc<Metric>, v: f64) {
        let mut a = self.accum.lock().expect("thread accumulators poisoned");
        add_value(a.c_data.entry(ByPtr::new(ctx.clone())).or_default(), m, v);
    }

    pub fn add_to_reconstruction(
        &self,
        rc: &Arc<ContextReconstruction>,
        m: &Arc<Metric>,
        v: f64,
    ) {
        let mut a = self.accum.lock().expect("thread accumulators poisoned");
        add_value(a.r_data.entry(ByPtr::new(rc.clone())).or_default(), m, v);
    }

    pub fn add_to_group_context(&self, gid: u64, ctx: &Arc<Context>, m: &Arc<Metric>, v: f64) {
        let mut g = self.r_groups.lock().expect("thread groups poisoned");
        let group = g.entry(gid).or_default();
        add_value(group.c_data.entry(ByPtr::new(ctx.clone())).or_default(), m, v);
    }

    pub fn add_to_group_graph(
        &self,
        gid: u64,
        graph: &Arc<ContextFlowGraph>,
        m: &Arc<Metric>,
        v: f64,
    ) {
        let mut g = self.r_groups.lock().expect("thread groups poisoned");
        let group = g.entry(gid).or_default();
        debug_assert!(
            group.fg_reconsts.contains_key(&ByPtr::new(graph.clone())),
            "graph must be registered with the group before accumulation"
        );
        add_value(group.fg_data.entry(ByPtr::new(graph.clone())).or_default(), m, v);
    }

    /// Run `f` under the group's lock, creating the group on first touch.
    pub fn with_group<R>(&self, gid: u64, f: impl FnOnce(&mut ReconstructionGroup) -> R) -> R {
        let mut g = self.r_groups.lock().expect("thread groups poisoned");
        f(g.entry(gid).or_default())
    }

    pub fn ctx_timepoints(&self) -> MutexGuard<'_, TimepointsData<CtxTimepoint>> {
        self.ctx_tp.lock().expect("thread ctx timepoints poisoned")
    }

    pub fn metric_timepoints(
        &self,
    ) -> MutexGuard<'_, HashMap<ByPtr<Metric>, TimepointsData<MetricTimepoint>>> {
        self.metric_tp.lock().expect("thread metric timepoints poisoned")
    }

    /// Distribute reconstruction values and fold everything into the shared
    /// per-Context accumulators. Timepoint draining is the pipeline's job
    /// and happens before this. Idempotent: the staged values drain on the
    /// first call and later calls see nothing.
    pub fn finalize(&self) {
        let (mut local, r_data) = {
            let mut accum = self.accum.lock().expect("thread accumulators poisoned");
            (std::mem::take(&mut accum.c_data), std::mem::take(&mut accum.r_data))
        };
        let groups = std::mem::take(&mut *self.r_groups.lock().expect("thread groups poisoned"));

        // Unresolved group accumulations distribute across every
        // Reconstruction instantiated for the (graph, root) pairs.
        for group in groups.into_values() {
            for (graph, values) in group.fg_data {
                let Some(reconsts) = group.fg_reconsts.get(&graph) else { continue };
                if reconsts.is_empty() {
                    continue;
                }
                let share = 1.0 / reconsts.len() as f64;
                for rc in reconsts {
                    distribute(rc, &values, share, &mut local);
                }
            }
            for (ctx, values) in group.c_data {
                for (m, raws) in &values {
                    merge_values(local.entry(ctx.clone()).or_default(), m, raws, 1.0);
                }
            }
        }
        for (rc, values) in r_data {
            distribute(&rc, &values, 1.0, &mut local);
        }

        // Fold into the shared tree with per-scope propagation.
        for (ctx, values) in &local {
            let path = ctx.inner().path_to_root();
            let root = path.last().expect("path includes self").clone();
            for (m, raws) in values {
                for scope in m.scopes().members() {
                    let targets: Vec<&Arc<Context>> = match scope {
                        MetricScope::Point => vec![ctx.inner()],
                        MetricScope::Function => path.iter().collect(),
                        MetricScope::LexAware => {
                            let mut out = vec![ctx.inner()];
                            for window in path.windows(2) {
                                match window[0].relation() {
                                    Relation::Enclosure | Relation::InlinedCall => {
                                        out.push(&window[1]);
                                    }
                                    _ => break,
                                }
                            }
                            out
                        }
                        MetricScope::Execution => vec![&root],
                    };
                    for target in targets {
                        let mut data = target.data();
                        let acc = data.statistics_for(m.inner());
                        for (i, raw) in raws.iter().enumerate() {
                            if !raw.is_zero() {
                                acc.add_raw(i, scope, *raw);
                            }
                        }
                    }
                }
            }
        }

        // Keep the resolved per-thread values for Sinks that emit
        // per-profile data.
        self.finalized
            .lock()
            .expect("thread finalized poisoned")
            .extend(local);
    }

    /// The resolved per-Context values of this thread. Populated by
    /// `finalize`; empty before it.
    pub fn finalized_data(&self) -> MutexGuard<'_, HashMap<ByPtr<Context>, MetricValues>> {
        self.finalized.lock().expect("thread finalized poisoned")
    }
}

fn distribute(
    rc: &ByPtr<ContextReconstruction>,
    values: &MetricValues,
    share: f64,
    out: &mut HashMap<ByPtr<Context>, MetricValues>,
) {
    let insts = rc.instances();
    if insts.is_empty() {
        return;
    }
    let per_template = share / insts.len() as f64;
    for (m, raws) in values {
        let handling = rc.graph().handling_for(m);
        if handling.interior {
            for inst in insts {
                merge_values(
                    out.entry(ByPtr::new(inst.terminal.clone())).or_default(),
                    m,
                    raws,
                    per_template,
                );
            }
        }
        if handling.exterior {
            for inst in insts {
                merge_values(
                    out.entry(ByPtr::new(inst.entry.clone())).or_default(),
                    m,
                    raws,
                    per_template,
                );
            }
        }
        if handling.exterior_logical {
            merge_values(
                out.entry(ByPtr::new(rc.root().clone())).or_default(),
                m,
                raws,
                share,
            );
        }
    }
}
