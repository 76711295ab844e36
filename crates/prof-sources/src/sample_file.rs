//! The native measurement reader.
//!
//! One measurement unit is a JSON document describing one process: profile
//! attributes, metric declarations, the module list, and per-thread sampled
//! call stacks with optional timepoint traces and outlined (unknown call
//! chain) samples. The document is parsed at open so `provides` is stable;
//! anything malformed mid-document aborts only this Source's contribution.

use prof_model::{
    Context, ContextFlowGraph, DataClass, IdTupleEntry, Metric, MetricScopeSet, MetricSettings,
    MetricVisibility, Module, NestedScope, PerThreadTemporary, ProfileAttributes, Relation,
    Scope, ThreadAttributes,
};
use prof_pipeline::{ProfileSource, SourceError, SourceHandle, TimepointStatus};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Doc {
    #[serde(default)]
    attributes: AttrsRec,
    #[serde(default)]
    metrics: Vec<MetricRec>,
    #[serde(default)]
    modules: Vec<PathBuf>,
    #[serde(default)]
    threads: Vec<ThreadRec>,
}

#[derive(Debug, Default, Deserialize)]
struct AttrsRec {
    name: Option<String>,
    job: Option<u64>,
    path: Option<PathBuf>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    /// Kind number (as a JSON object key) to display name.
    #[serde(default)]
    idtuple_names: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MetricRec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    relation: bool,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    order: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TupleRec {
    kind: u16,
    #[serde(default)]
    logical: u64,
    physical: u64,
}

#[derive(Debug, Deserialize)]
struct SampleRec {
    /// Call stack, outermost first: (module index, offset).
    stack: Vec<(usize, u64)>,
    values: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct OutlinedRec {
    /// Reconstruction group id; samples sharing it pool their roots.
    group: u64,
    module: usize,
    offset: u64,
    #[serde(default)]
    root_stack: Vec<(usize, u64)>,
    values: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct TimepointRec {
    time: u64,
    stack: Vec<(usize, u64)>,
}

#[derive(Debug, Deserialize)]
struct MetricTimepointRec {
    time: u64,
    metric: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ThreadRec {
    idtuple: Vec<TupleRec>,
    #[serde(default)]
    ctx_disorder: u32,
    #[serde(default)]
    metric_disorder: BTreeMap<String, u32>,
    #[serde(default)]
    samples: Vec<SampleRec>,
    #[serde(default)]
    outlined: Vec<OutlinedRec>,
    #[serde(default)]
    timepoints: Vec<TimepointRec>,
    #[serde(default)]
    metric_timepoints: Vec<MetricTimepointRec>,
}

fn parse_scopes(names: &[String], path: &Path) -> Result<MetricScopeSet, SourceError> {
    if names.is_empty() {
        return Ok(MetricScopeSet::POINT | MetricScopeSet::FUNCTION | MetricScopeSet::EXECUTION);
    }
    let mut out = MetricScopeSet::empty();
    for n in names {
        out |= match n.as_str() {
            "point" => MetricScopeSet::POINT,
            "function" => MetricScopeSet::FUNCTION,
            "lex_aware" => MetricScopeSet::LEX_AWARE,
            "execution" => MetricScopeSet::EXECUTION,
            other => {
                return Err(SourceError::Parse(format!(
                    "unknown metric scope {other:?} in {}",
                    path.display()
                )));
            }
        };
    }
    Ok(out)
}

struct PreparedThread {
    tt: Arc<PerThreadTemporary>,
    rec: usize,
    /// Per sample: (relation ctx, flat ctx, sample index).
    samples: Vec<(Arc<Context>, Arc<Context>, usize)>,
    /// Per outlined sample with a resolved flow graph.
    outlined: Vec<(u64, Arc<ContextFlowGraph>, usize)>,
    /// Outlined samples with no flow graph fall back to an unknown context.
    fallback: Vec<(Arc<Context>, usize)>,
    ctx_tps: Vec<(u64, Arc<Context>)>,
}

/// Source reading one native measurement document.
pub struct SampleFile {
    path: PathBuf,
    doc: Doc,
    handle: Option<SourceHandle>,
    provides: DataClass,
    metrics: HashMap<String, Arc<Metric>>,
    modules: Vec<Arc<Module>>,
    prepared: Vec<PreparedThread>,
}

impl SampleFile {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let text = std::fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: Doc = serde_json::from_str(&text).map_err(|e| {
            SourceError::Parse(format!("{}: {e}", path.display()))
        })?;
        for t in &doc.threads {
            let frames = t
                .samples
                .iter()
                .flat_map(|s| s.stack.iter())
                .chain(t.timepoints.iter().flat_map(|tp| tp.stack.iter()))
                .chain(t.outlined.iter().flat_map(|o| o.root_stack.iter()))
                .map(|&(m, _)| m)
                .chain(t.outlined.iter().map(|o| o.module));
            for m in frames {
                if m >= doc.modules.len() {
                    return Err(SourceError::Parse(format!(
                        "{}: frame references module {m} of {}",
                        path.display(),
                        doc.modules.len()
                    )));
                }
            }
        }
        let mut provides = DataClass::ATTRIBUTES
            | DataClass::REFERENCES
            | DataClass::THREADS
            | DataClass::CONTEXTS
            | DataClass::METRICS;
        if doc.threads.iter().any(|t| !t.timepoints.is_empty()) {
            provides |= DataClass::CTX_TIMEPOINTS;
        }
        if doc.threads.iter().any(|t| !t.metric_timepoints.is_empty()) {
            provides |= DataClass::METRIC_TIMEPOINTS;
        }
        debug!(
            target: "source.samples",
            path = %path.display(),
            threads = doc.threads.len(),
            "opened measurement document"
        );
        Ok(SampleFile {
            path: path.to_path_buf(),
            doc,
            handle: None,
            provides,
            metrics: HashMap::new(),
            modules: Vec::new(),
            prepared: Vec::new(),
        })
    }

    fn resolve_stack(
        &self,
        h: &SourceHandle,
        stack: &[(usize, u64)],
    ) -> (Arc<Context>, Arc<Context>) {
        let mut rel = h.global();
        let mut flat = h.global();
        for &(midx, offset) in stack {
            let module = self.modules[midx].clone();
            let (r, f) = h.context(
                &flat,
                NestedScope::new(Relation::Call, Scope::Point { module, offset }),
            );
            rel = r;
            flat = f;
        }
        (rel, flat)
    }

    fn read_attributes(&mut self, h: &SourceHandle) -> Result<(), SourceError> {
        let mut attrs = ProfileAttributes::default();
        if let Some(n) = &self.doc.attributes.name {
            attrs.set_name(n.clone());
        }
        if let Some(j) = self.doc.attributes.job {
            attrs.set_job(j);
        }
        if let Some(p) = &self.doc.attributes.path {
            attrs.set_path(p.clone());
        }
        for (k, v) in &self.doc.attributes.environment {
            attrs.set_environment(k.clone(), v.clone());
        }
        for (k, v) in &self.doc.attributes.idtuple_names {
            let kind: u16 = k.parse().map_err(|_| {
                SourceError::Parse(format!(
                    "{}: id tuple kind {k:?} is not a number",
                    self.path.display()
                ))
            })?;
            attrs.set_idtuple_name(kind, v.clone());
        }
        h.attributes(attrs);

        for rec in &self.doc.metrics {
            let mut s = MetricSettings::new(rec.name.clone(), rec.description.clone());
            s.scopes = parse_scopes(&rec.scopes, &self.path)?;
            s.visibility = match rec.visibility.as_deref() {
                None | Some("shown") => MetricVisibility::Shown,
                Some("hidden") => MetricVisibility::HiddenByDefault,
                Some("invisible") => MetricVisibility::Invisible,
                Some(other) => {
                    return Err(SourceError::Parse(format!(
                        "{}: unknown metric visibility {other:?}",
                        self.path.display()
                    )));
                }
            };
            s.order_id = rec.order;
            let m = h.metric_ex(s, rec.relation);
            m.stats_access().request_sum_partial();
            h.metric_freeze(&m);
            self.metrics.insert(rec.name.clone(), m);
        }
        Ok(())
    }

    fn read_contexts(&mut self, h: &SourceHandle) {
        let prepared = std::mem::take(&mut self.prepared);
        let resolved: Vec<PreparedThread> = prepared
            .into_iter()
            .map(|mut p| {
                let rec = &self.doc.threads[p.rec];
                for (i, s) in rec.samples.iter().enumerate() {
                    let (rel, flat) = self.resolve_stack(h, &s.stack);
                    p.samples.push((rel, flat, i));
                }
                for (i, o) in rec.outlined.iter().enumerate() {
                    let (_, root) = self.resolve_stack(h, &o.root_stack);
                    let scope = Scope::Point {
                        module: self.modules[o.module].clone(),
                        offset: o.offset,
                    };
                    match h.context_flow_graph(&scope) {
                        Some(fg) => {
                            for entry in fg.entries().clone() {
                                h.add_root_to_group(&p.tt, o.group, &root, entry);
                            }
                            h.add_graph_to_group(&p.tt, o.group, &fg);
                            p.outlined.push((o.group, fg, i));
                        }
                        None => {
                            // No structure to reconstruct under; keep the
                            // values under an unknown child of the root.
                            let (_, unknown) = h.context(
                                &root,
                                NestedScope::new(Relation::Call, Scope::Unknown),
                            );
                            p.fallback.push((unknown, i));
                        }
                    }
                }
                for tp in &rec.timepoints {
                    let (_, ctx) = self.resolve_stack(h, &tp.stack);
                    p.ctx_tps.push((tp.time, ctx));
                }
                p
            })
            .collect();
        self.prepared = resolved;
    }

    fn read_metrics(&self, h: &SourceHandle) {
        for p in &self.prepared {
            let rec = &self.doc.threads[p.rec];
            for (rel, flat, i) in &p.samples {
                for (name, &v) in &rec.samples[*i].values {
                    let Some(m) = self.metrics.get(name) else {
                        warn!(
                            target: "source.samples",
                            metric = %name,
                            "sample references an undeclared metric, dropped"
                        );
                        continue;
                    };
                    let target = if m.is_relation() { rel } else { flat };
                    h.accumulate_to(&p.tt, target).add(m, v);
                }
            }
            for (gid, fg, i) in &p.outlined {
                for (name, &v) in &rec.outlined[*i].values {
                    let Some(m) = self.metrics.get(name) else { continue };
                    h.accumulate_to_graph(&p.tt, *gid, fg).add(m, v);
                }
            }
            for (ctx, i) in &p.fallback {
                for (name, &v) in &rec.outlined[*i].values {
                    let Some(m) = self.metrics.get(name) else { continue };
                    h.accumulate_to(&p.tt, ctx).add(m, v);
                }
            }
        }
    }

    fn read_ctx_timepoints(&self, h: &SourceHandle) {
        for p in &self.prepared {
            let mut attempts = 0;
            'replay: loop {
                attempts += 1;
                if attempts > 3 {
                    warn!(
                        target: "source.samples",
                        "giving up on a repeatedly rewinding timepoint stream"
                    );
                    break;
                }
                for (time, ctx) in &p.ctx_tps {
                    match h.ctx_timepoint(&p.tt, ctx.clone(), *time) {
                        TimepointStatus::Next => {}
                        TimepointStatus::RewindStart => continue 'replay,
                    }
                }
                break;
            }
        }
    }

    fn read_metric_timepoints(&self, h: &SourceHandle) {
        for p in &self.prepared {
            let rec = &self.doc.threads[p.rec];
            let mut streams: BTreeMap<&str, Vec<(u64, f64)>> = BTreeMap::new();
            for tp in &rec.metric_timepoints {
                streams.entry(&tp.metric).or_default().push((tp.time, tp.value));
            }
            for (name, tps) in streams {
                let Some(m) = self.metrics.get(name) else {
                    warn!(
                        target: "source.samples",
                        metric = %name,
                        "timepoints reference an undeclared metric, dropped"
                    );
                    continue;
                };
                let mut attempts = 0;
                'replay: loop {
                    attempts += 1;
                    if attempts > 3 {
                        break;
                    }
                    for &(time, value) in &tps {
                        match h.metric_timepoint(&p.tt, m, value, time) {
                            TimepointStatus::Next => {}
                            TimepointStatus::RewindStart => continue 'replay,
                        }
                    }
                    break;
                }
            }
        }
    }
}

impl ProfileSource for SampleFile {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }

    fn provides(&self) -> DataClass {
        self.provides
    }

    fn finalize_request(&self, requested: DataClass) -> DataClass {
        let mut d = requested;
        if d.any_of(
            DataClass::METRICS | DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS,
        ) {
            d |= DataClass::ATTRIBUTES
                | DataClass::REFERENCES
                | DataClass::THREADS
                | DataClass::CONTEXTS;
        }
        if d.has_contexts() {
            d |= DataClass::REFERENCES | DataClass::THREADS;
        }
        d & self.provides
    }

    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().expect("source not bound");
        if needed.has_attributes() {
            self.read_attributes(&h)?;
        }
        if needed.has_references() {
            self.modules = self
                .doc
                .modules
                .iter()
                .map(|p| h.module(p.clone()))
                .collect();
        }
        if needed.has_threads() {
            for (i, rec) in self.doc.threads.iter().enumerate() {
                let tuple: Vec<IdTupleEntry> = rec
                    .idtuple
                    .iter()
                    .map(|t| IdTupleEntry {
                        kind: t.kind,
                        logical_index: t.logical,
                        physical_index: t.physical,
                    })
                    .collect();
                let mut attrs = ThreadAttributes::new(tuple);
                attrs.set_ctx_timepoint_disorder(rec.ctx_disorder);
                for (m, &k) in &rec.metric_disorder {
                    attrs.set_metric_timepoint_disorder(m.clone(), k);
                }
                if !attrs.ok() {
                    return Err(SourceError::Parse(format!(
                        "{}: thread {i} has an empty id tuple",
                        self.path.display()
                    )));
                }
                self.prepared.push(PreparedThread {
                    tt: h.thread(attrs),
                    rec: i,
                    samples: Vec::new(),
                    outlined: Vec::new(),
                    fallback: Vec::new(),
                    ctx_tps: Vec::new(),
                });
            }
        }
        if needed.has_contexts() {
            self.read_contexts(&h);
        }
        if needed.has_metrics() {
            self.read_metrics(&h);
        }
        if needed.has_ctx_timepoints() {
            self.read_ctx_timepoints(&h);
        }
        if needed.has_metric_timepoints() {
            self.read_metric_timepoints(&h);
        }
        Ok(())
    }
}
