//! The native measurement reader, end to end: attributes, metrics, call
//! stacks, relation routing, timepoints, and parse-failure degradation.

use prof_finalizers::DenseIds;
use prof_model::{Context, DataClass, ExtensionClass, Metric, MetricScope, Scope};
use prof_pipeline::{PipelineBuilder, ProfileSink, SinkHandle};
use prof_sources::SampleFile;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

struct Probe {
    handle: Option<SinkHandle>,
    root: Arc<Mutex<Option<Arc<Context>>>>,
    metrics: Arc<Mutex<Vec<Arc<Metric>>>>,
    threads: Arc<Mutex<usize>>,
    batches: Arc<Mutex<Vec<Vec<u64>>>>,
}

impl ProfileSink for Probe {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::all()
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }
    fn notify_timepoints(&self, _t: &Arc<prof_model::Thread>, tps: &[prof_model::CtxTimepoint]) {
        self.batches
            .lock()
            .unwrap()
            .push(tps.iter().map(|tp| tp.time).collect());
    }
    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().unwrap();
        *self.root.lock().unwrap() = Some(h.contexts());
        *self.metrics.lock().unwrap() = h.metrics();
        *self.threads.lock().unwrap() = h.threads().len();
        Ok(())
    }
}

fn measurement_doc() -> serde_json::Value {
    serde_json::json!({
        "attributes": {
            "name": "demo",
            "job": 9,
            "environment": {"OMP_NUM_THREADS": "2"},
            "idtuple_names": {"2": "RANK", "3": "THREAD"}
        },
        "metrics": [
            {"name": "CYCLES", "description": "cpu cycles",
             "scopes": ["point", "function", "execution"]},
            {"name": "CALLS", "scopes": ["point"], "relation": true}
        ],
        "modules": ["/bin/app", "/lib/libm.so"],
        "threads": [
            {
                "idtuple": [{"kind": 2, "physical": 0}, {"kind": 3, "physical": 0}],
                "ctx_disorder": 2,
                "samples": [
                    {"stack": [[0, 256], [0, 300]],
                     "values": {"CYCLES": 3.0, "CALLS": 1.0}},
                    {"stack": [[0, 256], [1, 64]], "values": {"CYCLES": 2.0}}
                ],
                "timepoints": [
                    {"time": 5, "stack": [[0, 256]]},
                    {"time": 3, "stack": [[0, 256], [0, 300]]},
                    {"time": 6, "stack": [[0, 256]]},
                    {"time": 4, "stack": [[0, 256], [1, 64]]}
                ]
            },
            {
                "idtuple": [{"kind": 2, "physical": 0}, {"kind": 3, "physical": 1}],
                "samples": [
                    {"stack": [[0, 256], [0, 300]], "values": {"CYCLES": 5.0}}
                ]
            }
        ]
    })
}

#[test]
fn reads_a_measurement_document() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(measurement_doc().to_string().as_bytes()).unwrap();

    let root: Arc<Mutex<Option<Arc<Context>>>> = Default::default();
    let metrics: Arc<Mutex<Vec<Arc<Metric>>>> = Default::default();
    let threads: Arc<Mutex<usize>> = Default::default();
    let batches: Arc<Mutex<Vec<Vec<u64>>>> = Default::default();

    let mut b = PipelineBuilder::new();
    b.add_finalizer(Box::new(DenseIds::new()));
    b.add_source(Box::new(SampleFile::open(f.path()).unwrap()));
    b.add_sink(Box::new(Probe {
        handle: None,
        root: root.clone(),
        metrics: metrics.clone(),
        threads: threads.clone(),
        batches: batches.clone(),
    }));
    b.build(2).run().unwrap();

    let root = root.lock().unwrap().take().unwrap();
    let metrics = metrics.lock().unwrap().clone();
    assert_eq!(*threads.lock().unwrap(), 2);
    assert_eq!(metrics.len(), 2);
    let cycles = metrics.iter().find(|m| m.name() == "CYCLES").unwrap();
    let calls = metrics.iter().find(|m| m.name() == "CALLS").unwrap();
    assert!(calls.is_relation());

    // Tree: global -> 256 -> {300, 64}.
    assert_eq!(root.child_count(), 1);
    let outer = root.children().pop().unwrap();
    assert!(matches!(outer.scope(), Scope::Point { offset: 256, .. }));
    assert_eq!(outer.child_count(), 2);

    let inner = |offset: u64| {
        outer
            .children()
            .into_iter()
            .find(|c| matches!(c.scope(), Scope::Point { offset: o, .. } if *o == offset))
            .unwrap()
    };
    // CYCLES point values per leaf; both threads' 300-samples merge.
    let leaf300 = inner(300);
    assert_eq!(
        leaf300.data().get(cycles).unwrap().get(0, MetricScope::Point).sum,
        8.0
    );
    let leaf64 = inner(64);
    assert_eq!(
        leaf64.data().get(cycles).unwrap().get(0, MetricScope::Point).sum,
        2.0
    );
    // Function scope is inclusive at the shared caller.
    assert_eq!(
        outer.data().get(cycles).unwrap().get(0, MetricScope::Function).sum,
        10.0
    );
    // Execution lands on the root.
    assert_eq!(
        root.data().get(cycles).unwrap().get(0, MetricScope::Execution).sum,
        10.0
    );
    // With no classification Finalizer the relation context is the flat
    // one, so CALLS sits on the leaf.
    assert_eq!(
        leaf300.data().get(calls).unwrap().get(0, MetricScope::Point).sum,
        1.0
    );

    // K=2 tolerates the interleaving: delivered in sorted order.
    let delivered: Vec<u64> = batches.lock().unwrap().iter().flatten().copied().collect();
    assert_eq!(delivered, vec![3, 4, 5, 6]);
}

#[test]
fn malformed_document_is_rejected_at_open() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"{\"threads\": [{\"idtuple\": []").unwrap();
    assert!(SampleFile::open(f.path()).is_err());
}

#[test]
fn out_of_range_module_index_is_rejected() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let doc = serde_json::json!({
        "modules": ["/bin/app"],
        "threads": [{
            "idtuple": [{"kind": 3, "physical": 0}],
            "samples": [{"stack": [[4, 16]], "values": {}}]
        }]
    });
    f.write_all(doc.to_string().as_bytes()).unwrap();
    assert!(SampleFile::open(f.path()).is_err());
}
