//! End-to-end classifier behavior through a real pipeline: dense id
//! allocation, structure-file classification chains, call-graph recovery
//! with SCC collapse, and reconstruction metric distribution.

use prof_finalizers::{DenseIds, StructFile};
use prof_model::{
    Context, ContextFlowGraph, DataClass, ExtensionClass, Metric, MetricScope, MetricScopeSet,
    MetricSettings, NestedScope, Relation, Scope, ThreadAttributes,
};
use prof_model::attributes::{IdTupleEntry, tuple_kind};
use prof_pipeline::{
    PipelineBuilder, ProfileSink, ProfileSource, SinkHandle, SourceError, SourceHandle,
};
use std::collections::BTreeSet;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

type ReadFn = Box<dyn FnMut(&SourceHandle, DataClass) -> Result<(), SourceError> + Send>;

struct ClosureSource {
    handle: Option<SourceHandle>,
    provides: DataClass,
    read_fn: ReadFn,
}

impl ClosureSource {
    fn new(provides: DataClass, read_fn: ReadFn) -> Box<Self> {
        Box::new(ClosureSource { handle: None, provides, read_fn })
    }
}

impl ProfileSource for ClosureSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        self.provides
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        requested
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().unwrap();
        (self.read_fn)(&h, needed)
    }
}

struct NullSink;

impl ProfileSink for NullSink {
    fn bind(&mut self, _handle: SinkHandle) {}
    fn accepts(&self) -> DataClass {
        DataClass::all()
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }
    fn write(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sink that resolves dense ids for everything during write().
struct IdProbeSink {
    handle: Option<SinkHandle>,
    out: Arc<Mutex<IdReport>>,
}

#[derive(Default, Debug)]
struct IdReport {
    modules: BTreeSet<u32>,
    files: BTreeSet<u32>,
    threads: BTreeSet<u32>,
    contexts: BTreeSet<u32>,
    root_id: Option<u32>,
    metric_blocks: Vec<(u32, u32)>, // (base, size)
}

impl ProfileSink for IdProbeSink {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::all()
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }
    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().unwrap();
        let mut out = self.out.lock().unwrap();
        for m in h.modules() {
            out.modules.insert(h.module_id(&m));
        }
        for f in h.files() {
            out.files.insert(h.file_id(&f));
        }
        for t in h.threads() {
            out.threads.insert(h.thread_id(&t));
        }
        for m in h.metrics() {
            let id = h.metric_id(&m);
            out.metric_blocks.push((id.base(), id.block_size()));
        }
        let root = h.contexts();
        out.root_id = Some(h.context_id(&root));
        root.walk_preorder(&mut |c, _| {
            out.contexts.insert(h.context_id(c));
        });
        Ok(())
    }
}

fn tuple(rank: u64) -> ThreadAttributes {
    ThreadAttributes::new(vec![IdTupleEntry {
        kind: tuple_kind::RANK,
        logical_index: rank,
        physical_index: rank,
    }])
}

#[test]
fn dense_ids_are_contiguous_and_blocked() {
    let out = Arc::new(Mutex::new(IdReport::default()));
    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(DenseIds::new()));
    b.add_source(ClosureSource::new(
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::THREADS | DataClass::CONTEXTS,
        Box::new(|h, needed| {
            if needed.has_attributes() {
                let mut s1 = MetricSettings::new("M1", "");
                s1.scopes = MetricScopeSet::POINT | MetricScopeSet::EXECUTION;
                let m1 = h.metric(s1);
                m1.stats_access().request_sum_partial();
                h.metric_freeze(&m1);

                let mut s2 = MetricSettings::new("M2", "");
                s2.scopes = MetricScopeSet::FUNCTION;
                let m2 = h.metric(s2);
                m2.stats_access().request_sum_partial();
                m2.stats_access().request_partial(
                    prof_model::Combinator::Max,
                    prof_model::Expression::variable(prof_model::Partial::VAL),
                );
                h.metric_freeze(&m2);
            }
            if needed.has_references() {
                h.module("/bin/a".into());
                h.module("/bin/b".into());
                h.file("src/a.c".into());
                h.file("src/b.c".into());
            }
            if needed.has_threads() {
                h.thread(tuple(0));
                h.thread(tuple(1));
            }
            if needed.has_contexts() {
                let root = h.global();
                let (_r, c1) =
                    h.context(&root, NestedScope::new(Relation::Call, Scope::Placeholder(1)));
                h.context(&c1, NestedScope::new(Relation::Call, Scope::Placeholder(2)));
            }
            Ok(())
        }),
    ));
    b.add_sink(Box::new(IdProbeSink { handle: None, out: out.clone() }));
    b.add_sink(Box::new(NullSink));
    b.build(2).run().unwrap();

    let r = out.lock().unwrap();
    assert_eq!(r.modules.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(r.files.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(r.threads.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(r.root_id, Some(0));
    // Root is 0; the two children number from 1.
    assert_eq!(r.contexts.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

    // Two metrics, each a block of 2, non-overlapping from 0.
    let mut blocks = r.metric_blocks.clone();
    blocks.sort();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0], (0, 2));
    assert_eq!(blocks[1], (2, 2));
}

// ---------------------------------------------------------------------------
// Structure-file driven behavior.

fn write_struct_file() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let doc = serde_json::json!({
        "binaries": [{
            "path": "/gpu/kern.bin",
            "has_calls": true,
            "functions": [
                {"name": "E", "entry": 256, "ranges": [[256, 512]], "file": "k.cu", "line": 10},
                {"name": "A", "entry": 512, "ranges": [[512, 768]]},
                {"name": "B", "entry": 768, "ranges": [[768, 1024]]},
                {"name": "D", "entry": 1024, "ranges": [[1024, 1280]], "file": "k.cu", "line": 40}
            ],
            "loops": [
                {"ranges": [[1100, 1200]], "file": "k.cu", "line": 42}
            ],
            "lines": [
                {"ranges": [[1150, 1160]], "file": "k.cu", "line": 43}
            ],
            "calls": [
                {"site": 300, "callee": 512},
                {"site": 600, "callee": 768},
                {"site": 800, "callee": 512},
                {"site": 900, "callee": 1024}
            ]
        }]
    });
    f.write_all(doc.to_string().as_bytes()).unwrap();
    f
}

#[test]
fn struct_classification_expands_point_samples() {
    let f = write_struct_file();
    let root_slot: Arc<Mutex<Option<Arc<Context>>>> = Default::default();
    let flat_slot: Arc<Mutex<Option<Arc<Context>>>> = Default::default();
    let rel_slot: Arc<Mutex<Option<Arc<Context>>>> = Default::default();

    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(StructFile::new(f.path()).unwrap()));
    let (rs, fs, es) = (root_slot.clone(), flat_slot.clone(), rel_slot.clone());
    b.add_source(ClosureSource::new(
        DataClass::REFERENCES | DataClass::CONTEXTS,
        Box::new(move |h, needed| {
            if needed.has_contexts() {
                let module = h.module("/gpu/kern.bin".into());
                let root = h.global();
                *rs.lock().unwrap() = Some(root.clone());
                let (rel, flat) = h.context(
                    &root,
                    NestedScope::new(Relation::Call, Scope::Point { module, offset: 1150 }),
                );
                *fs.lock().unwrap() = Some(flat);
                *es.lock().unwrap() = Some(rel);
            }
            Ok(())
        }),
    ));
    b.add_sink(Box::new(NullSink));
    b.build(2).run().unwrap();

    let flat = flat_slot.lock().unwrap().clone().unwrap();
    let rel = rel_slot.lock().unwrap().clone().unwrap();

    // Chain: global -> call->D() -> enclosure->loop -> enclosure->line
    //        -> enclosure->point(1150)
    assert!(matches!(flat.scope(), Scope::Point { offset: 1150, .. }));
    assert_eq!(flat.relation(), Relation::Enclosure);
    let line = flat.direct_parent().unwrap();
    assert!(matches!(line.scope(), Scope::Line { line: 43, .. }));
    let lp = line.direct_parent().unwrap();
    assert!(matches!(lp.scope(), Scope::LexicalLoop { line: 42, .. }));
    let func = lp.direct_parent().unwrap();
    match func.scope() {
        Scope::Function(fun) => assert_eq!(fun.name(), "D"),
        other => panic!("expected function context, got {other:?}"),
    }
    assert_eq!(func.relation(), Relation::Call);
    assert!(func.direct_parent().unwrap().is_global());

    // The relation context is the function, not the flat point.
    assert!(Arc::ptr_eq(&rel, &func));
}

#[test]
fn call_graph_scc_collapse_preserves_reachability() {
    let f = write_struct_file();
    let graph_slot: Arc<Mutex<Option<Arc<ContextFlowGraph>>>> = Default::default();

    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(StructFile::new(f.path()).unwrap()));
    let gs = graph_slot.clone();
    b.add_source(ClosureSource::new(
        DataClass::REFERENCES | DataClass::CONTEXTS,
        Box::new(move |h, needed| {
            if needed.has_contexts() {
                let module = h.module("/gpu/kern.bin".into());
                let fg = h.context_flow_graph(&Scope::Point { module, offset: 1150 });
                *gs.lock().unwrap() = fg;
            }
            Ok(())
        }),
    ));
    b.add_sink(Box::new(NullSink));
    b.build(2).run().unwrap();

    let fg = graph_slot.lock().unwrap().clone().expect("flow graph resolved");
    // A<->B form a cycle; the only true entry reaching the sample is E.
    // The exact summarized edges are unspecified, but every template must
    // run from E through real call sites to the sampled function.
    assert!(!fg.templates().is_empty());
    for t in fg.templates() {
        match &t.entry {
            Scope::Function(fun) => assert_eq!(fun.name(), "E"),
            other => panic!("expected function entry, got {other:?}"),
        }
        assert!(!t.path.is_empty());
        for s in &t.path {
            assert!(matches!(s, Scope::Point { .. }), "call sites are points");
        }
    }
    assert_eq!(fg.entries().len(), 1);
}

#[test]
fn reconstruction_distributes_interior_metrics() {
    let f = write_struct_file();
    let root_slot: Arc<Mutex<Option<Arc<Context>>>> = Default::default();
    let metric_slot: Arc<Mutex<Option<Arc<Metric>>>> = Default::default();

    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(StructFile::new(f.path()).unwrap()));
    let (rs, ms) = (root_slot.clone(), metric_slot.clone());
    b.add_source(ClosureSource::new(
        DataClass::ATTRIBUTES
            | DataClass::REFERENCES
            | DataClass::THREADS
            | DataClass::CONTEXTS
            | DataClass::METRICS,
        Box::new(move |h, needed| {
            if needed.has_attributes() {
                let mut s = MetricSettings::new("GINS", "gpu instructions");
                s.scopes = MetricScopeSet::POINT | MetricScopeSet::FUNCTION;
                let m = h.metric(s);
                m.stats_access().request_sum_partial();
                h.metric_freeze(&m);
                *ms.lock().unwrap() = Some(m);
            }
            if needed.has_metrics() {
                // Everything else is deferred to the finishing wave so the
                // whole flow runs in one pass.
                let tt = h.thread(tuple(0));
                let module = h.module("/gpu/kern.bin".into());
                let global = h.global();
                *rs.lock().unwrap() = Some(global.clone());
                let (_r, root) = h.context(
                    &global,
                    NestedScope::new(Relation::Call, Scope::Placeholder(99)),
                );

                let fg = h
                    .context_flow_graph(&Scope::Point { module, offset: 1150 })
                    .expect("flow graph");
                let gid = 1u64;
                for entry in fg.entries() {
                    h.add_root_to_group(&tt, gid, &root, entry.clone());
                }
                h.add_graph_to_group(&tt, gid, &fg);
                let m = ms.lock().unwrap().clone().unwrap();
                h.accumulate_to_graph(&tt, gid, &fg).add(&m, 6.0);
            }
            Ok(())
        }),
    ));
    b.add_sink(Box::new(NullSink));
    b.build(2).run().unwrap();

    let global = root_slot.lock().unwrap().clone().unwrap();
    let m = metric_slot.lock().unwrap().clone().unwrap();

    // The interior value lands at the reconstructed sample context, fully.
    let mut found = 0.0;
    global.walk_preorder(&mut |c, _| {
        if matches!(c.scope(), Scope::Point { offset: 1150, .. }) {
            if let Some(acc) = c.data().get(&m) {
                found += acc.get(0, MetricScope::Point).sum;
            }
        }
    });
    assert!((found - 6.0).abs() < 1e-9, "interior metric sums to 6.0, got {found}");
}
