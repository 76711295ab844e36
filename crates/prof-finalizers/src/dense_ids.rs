//! Dense identifier allocation.
//!
//! Modules, Files and Threads number from 0; Contexts from 1 with 0
//! reserved for the global root; Metrics claim a block of
//! `max(|partials|, 1) * |scopes|` consecutive ids so Sinks can enumerate
//! (partial, scope) tuples by offset.

use prof_model::{Context, ExtensionClass, File, Metric, MetricIdentifier, Module, Thread};
use prof_pipeline::{ProfileFinalizer, SourceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub struct DenseIds {
    module_id: AtomicU32,
    file_id: AtomicU32,
    metric_id: AtomicU32,
    context_id: AtomicU32,
    thread_id: AtomicU32,
}

impl DenseIds {
    pub fn new() -> Self {
        DenseIds { context_id: AtomicU32::new(1), ..Default::default() }
    }
}

impl ProfileFinalizer for DenseIds {
    fn bind(&mut self, _handle: SourceHandle) {}

    fn provides(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn identify_module(&self, _m: &Arc<Module>) -> Option<u32> {
        Some(self.module_id.fetch_add(1, Ordering::Relaxed))
    }
    fn identify_file(&self, _f: &Arc<File>) -> Option<u32> {
        Some(self.file_id.fetch_add(1, Ordering::Relaxed))
    }
    fn identify_metric(&self, m: &Arc<Metric>) -> Option<MetricIdentifier> {
        let block = (m.partials().len().max(1) as u32) * m.scopes().bits().count_ones();
        let base = self.metric_id.fetch_add(block, Ordering::Relaxed);
        Some(MetricIdentifier::new(base, m.partials().len(), m.scopes()))
    }
    fn identify_context(&self, c: &Arc<Context>) -> Option<u32> {
        if c.direct_parent().is_none() {
            return Some(0); // Reserved for the root Context
        }
        Some(self.context_id.fetch_add(1, Ordering::Relaxed))
    }
    fn identify_thread(&self, _t: &Arc<Thread>) -> Option<u32> {
        Some(self.thread_id.fetch_add(1, Ordering::Relaxed))
    }
}
