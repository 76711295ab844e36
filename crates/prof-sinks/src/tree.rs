//! Sending halves of the rank-tree reduction.
//!
//! Non-root ranks ship their state up the tree: identifiers and structure
//! right after ingest (`TreeSender`), metric accumulators at write time
//! (`MetricSender`). The matching receivers live in `prof-sources`.

use crate::packed::Packer;
use prof_collective::{Collective, RankTree, Tag};
use prof_model::{DataClass, ExtensionClass};
use prof_pipeline::{ProfileSink, SinkHandle};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Ships attributes + references + contexts to the parent rank.
pub struct TreeSender {
    handle: Option<SinkHandle>,
    packer: Mutex<Packer>,
    collective: Arc<dyn Collective>,
    tree: RankTree,
}

impl TreeSender {
    pub fn new(collective: Arc<dyn Collective>, tree: RankTree) -> Self {
        assert!(tree.parent().is_some(), "the root rank does not send");
        TreeSender { handle: None, packer: Mutex::new(Packer::default()), collective, tree }
    }
}

impl ProfileSink for TreeSender {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::CONTEXTS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }

    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().expect("sink not bound");
        let mut packer = self.packer.lock().expect("packer poisoned");
        let mut block = Vec::new();
        packer.pack_attributes(h, &mut block);
        packer.pack_references(h, &mut block);
        packer.pack_contexts(h, &mut block);
        let parent = self.tree.parent().expect("checked at construction");
        debug!(
            target: "sink.tree",
            parent,
            bytes = block.len(),
            "sending id block up the rank tree"
        );
        self.collective.send_bytes(&block, parent, Tag::RANK_TREE_IDS);
        Ok(())
    }
}

/// Ships metric accumulators (and optionally timepoint bounds) to the
/// parent rank.
pub struct MetricSender {
    handle: Option<SinkHandle>,
    packer: Mutex<Packer>,
    collective: Arc<dyn Collective>,
    tree: RankTree,
    needs_timepoints: bool,
}

impl MetricSender {
    pub fn new(collective: Arc<dyn Collective>, tree: RankTree, needs_timepoints: bool) -> Self {
        assert!(tree.parent().is_some(), "the root rank does not send");
        MetricSender {
            handle: None,
            packer: Mutex::new(Packer::default()),
            collective,
            tree,
            needs_timepoints,
        }
    }
}

impl ProfileSink for MetricSender {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        let mut d = DataClass::ATTRIBUTES | DataClass::CONTEXTS | DataClass::METRICS;
        if self.needs_timepoints {
            d |= DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS;
        }
        d
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }

    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().expect("sink not bound");
        let mut packer = self.packer.lock().expect("packer poisoned");
        let mut block = Vec::new();
        packer.pack_attributes(h, &mut block);
        packer.pack_metrics(h, &mut block);
        if self.needs_timepoints {
            packer.pack_timepoint_bounds(h, &mut block);
        }
        let parent = self.tree.parent().expect("checked at construction");
        debug!(
            target: "sink.tree",
            parent,
            bytes = block.len(),
            "sending metric block up the rank tree"
        );
        self.collective
            .send_bytes(&block, parent, Tag::RANK_TREE_METRICS);
        Ok(())
    }
}
