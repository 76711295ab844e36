//! Single-threaded pipeline configuration.
//!
//! Collaborators are registered here, dependency expansion and the ordered
//! chains are computed, and `build` wires everything into a runnable
//! `ProfilePipeline`. Contract violations (missing extensions, invalid
//! wavefront requests) are programmer errors and panic.

use crate::finalizer::ProfileFinalizer;
use crate::handles::{SinkHandle, SourceHandle};
use crate::pipeline::{
    Finalizers, PipelineCore, ProfilePipeline, Schedule, SinkEntry, SourceCell, SourceLocal,
    SourceState, WavefrontStatus,
};
use crate::sink::ProfileSink;
use crate::source::ProfileSource;
use crate::work::OnceSignal;
use prof_model::{Context, DataClass, ExtensionClass, Registry, UniquedSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::debug;

/// Per-sink registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkOptions {
    /// Join the ordered wavefront chain: this Sink's wavefront deliveries
    /// wait for the previous chained Sink to pass its barrier.
    pub ordered_wavefront: bool,
    /// Join the ordered write chain, serializing `write` regions likewise.
    pub ordered_write: bool,
}

struct PendingSink {
    sink: Box<dyn ProfileSink>,
    data_limit: DataClass,
    wave_limit: DataClass,
    ext_limit: ExtensionClass,
    opts: SinkOptions,
}

/// Builder for a `ProfilePipeline`.
#[derive(Default)]
pub struct PipelineBuilder {
    sources: Vec<Box<dyn ProfileSource>>,
    sinks: Vec<PendingSink>,
    finalizers: Vec<Box<dyn ProfileFinalizer>>,
    available: ExtensionClass,
    requested: ExtensionClass,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: Box<dyn ProfileSource>) -> &mut Self {
        self.sources.push(source);
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn ProfileSink>) -> &mut Self {
        self.add_sink_with(sink, SinkOptions::default())
    }

    pub fn add_sink_with(&mut self, sink: Box<dyn ProfileSink>, opts: SinkOptions) -> &mut Self {
        let mut acc = sink.accepts();
        let wave = sink.wavefronts();
        let req = sink.requirements();
        assert!(
            acc.all_of(wave),
            "sink requested wavefronts outside its accepted classes"
        );
        assert!(
            DataClass::waveable().all_of(wave),
            "early wavefronts requested for invalid data classes"
        );
        // Transitive expansion: consuming derived data implies consuming
        // what it is keyed on.
        if acc.has_metrics() {
            acc |= DataClass::ATTRIBUTES | DataClass::THREADS;
        }
        if acc.has_contexts() {
            acc |= DataClass::REFERENCES;
        }
        if acc.has_ctx_timepoints() {
            acc |= DataClass::CONTEXTS | DataClass::THREADS;
        }
        if acc.has_metric_timepoints() {
            acc |= DataClass::ATTRIBUTES | DataClass::THREADS;
        }
        self.requested |= req;
        self.sinks.push(PendingSink {
            sink,
            data_limit: acc,
            wave_limit: acc & wave,
            ext_limit: req,
            opts,
        });
        self
    }

    pub fn add_finalizer(&mut self, finalizer: Box<dyn ProfileFinalizer>) -> &mut Self {
        let pro = finalizer.provides();
        let req = finalizer.requirements();
        assert!(
            !pro.any_of(req),
            "finalizer provides and requires the same extension"
        );
        self.available |= pro;
        self.requested |= req;
        self.finalizers.push(finalizer);
        self
    }

    /// Wire everything together. Sinks and Finalizers are bound here; the
    /// global Context exists and is announced before any data can enter.
    pub fn build(self, team_size: usize) -> ProfilePipeline {
        let PipelineBuilder { mut sources, sinks, mut finalizers, available, requested } = self;
        assert!(
            (requested - available).is_empty(),
            "a collaborator requires extended data no finalizer provides: {}",
            requested - available
        );

        // Finalizer buckets, in registration order.
        let mut buckets = Finalizers {
            all: Vec::new(),
            identifier: Vec::new(),
            resolved_path: Vec::new(),
            classification: Vec::new(),
            statistics: Vec::new(),
        };
        for (i, f) in finalizers.iter().enumerate() {
            let pro = f.provides();
            if pro.has_identifier() {
                buckets.identifier.push(i);
            }
            if pro.has_resolved_path() {
                buckets.resolved_path.push(i);
            }
            if pro.has_classification() {
                buckets.classification.push(i);
            }
            if pro.has_statistics() {
                buckets.statistics.push(i);
            }
        }

        // Ordered chains are linked in registration order.
        let mut entries: Vec<SinkEntry> = Vec::with_capacity(sinks.len());
        let mut prior_wavefront: Option<usize> = None;
        let mut wavefront_dep_classes = DataClass::empty();
        let mut prior_write: Option<usize> = None;
        for (idx, p) in sinks.iter().enumerate() {
            let mut prior_delay = DataClass::empty();
            if p.opts.ordered_wavefront {
                prior_delay = wavefront_dep_classes;
                wavefront_dep_classes |= p.wave_limit;
            }
            entries.push(SinkEntry {
                // Placeholder box swapped below once the real one binds.
                sink: Box::new(UnboundSink),
                data_limit: p.data_limit,
                wave_limit: p.wave_limit,
                ext_limit: p.ext_limit,
                wavefront_prior_delay: prior_delay,
                ordered_wavefront: p.opts.ordered_wavefront,
                ordered_write: p.opts.ordered_write,
                prior_wavefront: if p.opts.ordered_wavefront {
                    let prev = prior_wavefront;
                    prior_wavefront = Some(idx);
                    prev
                } else {
                    None
                },
                prior_write: if p.opts.ordered_write {
                    let prev = prior_write;
                    prior_write = Some(idx);
                    prev
                } else {
                    None
                },
                wavefront_dep: OnceSignal::new(),
                write_dep: OnceSignal::new(),
                status: Mutex::new(WavefrontStatus::default()),
            });
        }

        let team_size = team_size.max(1);
        let core = Arc::new_cyclic(|weak| {
            // Bind sinks and finalizers while they are still mutable; their
            // handles stay dormant until the run starts.
            for (idx, (entry, pending)) in entries.iter_mut().zip(sinks).enumerate() {
                let mut sink = pending.sink;
                sink.bind(SinkHandle {
                    core: weak.clone(),
                    idx,
                    data_limit: entry.data_limit,
                    ext_limit: entry.ext_limit,
                });
                entry.sink = sink;
            }
            for f in finalizers.iter_mut() {
                f.bind(SourceHandle {
                    core: weak.clone(),
                    source_idx: None,
                    data_limit: DataClass::all(),
                    ext_limit: ExtensionClass::all(),
                    finalize_contexts: false,
                });
            }
            buckets.all = finalizers;

            // The global Context is announced before any data enters.
            let global = Context::global();
            for e in &entries {
                if e.data_limit.has_contexts() {
                    e.sink.notify_context(&global);
                }
            }

            PipelineCore {
                sinks: entries,
                finalizers: buckets,
                modules: UniquedSet::new(),
                files: UniquedSet::new(),
                metrics: UniquedSet::new(),
                estats: UniquedSet::new(),
                graphs: UniquedSet::new(),
                threads: Registry::new(),
                global,
                attrs: Mutex::new(Default::default()),
                timepoint_bounds: Mutex::new(None),
                merged: RwLock::new(Default::default()),
                source_cells: OnceLock::new(),
                source_locals: OnceLock::new(),
                schedule: OnceLock::new(),
                requested,
                team_size,
            }
        });

        // Sources bind last, after the output side is fully prepared.
        let mut cells = Vec::with_capacity(sources.len());
        let mut locals = Vec::with_capacity(sources.len());
        let mut provided = DataClass::empty();
        for (idx, source) in sources.iter_mut().enumerate() {
            let data_limit = source.provides();
            source.bind(SourceHandle {
                core: Arc::downgrade(&core),
                source_idx: Some(idx),
                data_limit,
                ext_limit: ExtensionClass::all(),
                finalize_contexts: true,
            });
            provided |= data_limit;
            locals.push(Mutex::new(SourceLocal::default()));
            cells.push(SourceCell {
                state: Mutex::new(SourceState { source: None, read: DataClass::empty() }),
                data_limit,
                waves_complete: OnceSignal::new(),
            });
        }
        for (cell, source) in cells.iter_mut().zip(sources) {
            cell.state.get_mut().expect("fresh mutex").source = Some(source);
        }

        let all_requested = core
            .sinks
            .iter()
            .fold(DataClass::empty(), |acc, e| acc | e.data_limit);
        let all_waves = core
            .sinks
            .iter()
            .fold(DataClass::empty(), |acc, e| acc | e.wave_limit);
        let scheduled = provided & all_requested;
        let schedule = Schedule {
            scheduled,
            scheduled_waves: all_waves & scheduled,
            unscheduled_waves: all_waves - scheduled,
        };
        debug!(
            target: "pipeline.build",
            scheduled = %schedule.scheduled,
            waves = %schedule.scheduled_waves,
            unscheduled = %schedule.unscheduled_waves,
            "pipeline schedule computed"
        );

        core.source_cells.set(cells).ok().expect("cells set twice");
        core.source_locals.set(locals).ok().expect("locals set twice");
        core.schedule.set(schedule).ok().expect("schedule set twice");

        ProfilePipeline { core }
    }
}

/// Placeholder occupying a SinkEntry before its real Sink binds.
struct UnboundSink;

impl ProfileSink for UnboundSink {
    fn bind(&mut self, _handle: SinkHandle) {
        unreachable!("placeholder sink bound")
    }
    fn accepts(&self) -> DataClass {
        DataClass::empty()
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }
    fn write(&self) -> std::io::Result<()> {
        unreachable!("placeholder sink written")
    }
}
