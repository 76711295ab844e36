//! Receiving halves of the rank-tree reduction.
//!
//! One Receiver per child rank feeds a parent's pipeline. `Receiver`
//! ingests identifiers and structure; `MetricReceiver` ingests metric
//! accumulators (resolved through an `IdTracker`'s maps), optionally
//! replaying a locally stashed references+contexts block first.

use crate::packed::{IdMaps, Unpacker};
use prof_collective::{Collective, RankTree, Tag};
use prof_model::DataClass;
use prof_pipeline::{PipelineBuilder, ProfileSource, SourceError, SourceHandle};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Ingests one child rank's attributes + references + contexts.
pub struct Receiver {
    handle: Option<SourceHandle>,
    unpacker: Unpacker,
    collective: Arc<dyn Collective>,
    peer: usize,
    done: bool,
}

impl Receiver {
    pub fn new(collective: Arc<dyn Collective>, peer: usize) -> Self {
        Receiver { handle: None, unpacker: Unpacker::default(), collective, peer, done: false }
    }

    /// One Receiver per child of this rank.
    pub fn append(b: &mut PipelineBuilder, collective: &Arc<dyn Collective>, tree: RankTree) {
        for peer in tree.children() {
            b.add_source(Box::new(Receiver::new(collective.clone(), peer)));
        }
    }
}

impl ProfileSource for Receiver {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::CONTEXTS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        if requested.any_of(self.provides()) {
            requested | self.provides()
        } else {
            requested
        }
    }
    fn read(&mut self, _needed: DataClass) -> Result<(), SourceError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let h = self.handle.clone().expect("source not bound");
        let block = self.collective.recv_bytes(self.peer, Tag::RANK_TREE_IDS);
        debug!(target: "source.tree", peer = self.peer, bytes = block.len(), "received id block");
        let mut buf: &[u8] = &block;
        self.unpacker.unpack_attributes(&h, &mut buf);
        self.unpacker.unpack_references(&h, &mut buf);
        self.unpacker.unpack_contexts(&h, &mut buf);
        Ok(())
    }
}

/// Ingests one child rank's metric accumulators.
pub struct MetricReceiver {
    handle: Option<SourceHandle>,
    unpacker: Unpacker,
    collective: Arc<dyn Collective>,
    peer: usize,
    maps: Arc<Mutex<IdMaps>>,
    /// References+contexts packed by this rank's own earlier phase; replayed
    /// into this pipeline before the metric block arrives.
    stash: Option<Arc<Vec<u8>>>,
    needs_timepoints: bool,
    done: bool,
}

impl MetricReceiver {
    pub fn new(
        collective: Arc<dyn Collective>,
        peer: usize,
        maps: Arc<Mutex<IdMaps>>,
        stash: Option<Arc<Vec<u8>>>,
        needs_timepoints: bool,
    ) -> Self {
        MetricReceiver {
            handle: None,
            unpacker: Unpacker::default(),
            collective,
            peer,
            maps,
            stash,
            needs_timepoints,
            done: false,
        }
    }

    pub fn append(
        b: &mut PipelineBuilder,
        collective: &Arc<dyn Collective>,
        tree: RankTree,
        maps: &Arc<Mutex<IdMaps>>,
        stash: Option<Arc<Vec<u8>>>,
        needs_timepoints: bool,
    ) {
        for peer in tree.children() {
            b.add_source(Box::new(MetricReceiver::new(
                collective.clone(),
                peer,
                maps.clone(),
                stash.clone(),
                needs_timepoints,
            )));
        }
    }
}

impl ProfileSource for MetricReceiver {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        let mut d = DataClass::ATTRIBUTES | DataClass::METRICS;
        if self.stash.is_some() {
            d |= DataClass::REFERENCES | DataClass::CONTEXTS;
        }
        if self.needs_timepoints {
            d |= DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS;
        }
        d
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        if requested.has_metrics() {
            requested | self.provides()
        } else if requested.any_of(DataClass::REFERENCES | DataClass::CONTEXTS)
            && self.stash.is_some()
        {
            requested | (DataClass::REFERENCES | DataClass::CONTEXTS)
        } else {
            requested
        }
    }
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError> {
        let h = self.handle.clone().expect("source not bound");
        if let Some(stash) = self.stash.take() {
            if needed.any_of(DataClass::REFERENCES | DataClass::CONTEXTS) {
                let mut buf: &[u8] = &stash;
                self.unpacker.unpack_references(&h, &mut buf);
                self.unpacker.unpack_contexts(&h, &mut buf);
            } else {
                self.stash = Some(stash);
            }
        }
        if !needed.has_metrics() || self.done {
            return Ok(());
        }
        self.done = true;
        let block = self.collective.recv_bytes(self.peer, Tag::RANK_TREE_METRICS);
        debug!(
            target: "source.tree",
            peer = self.peer,
            bytes = block.len(),
            "received metric block"
        );
        let mut buf: &[u8] = &block;
        self.unpacker.unpack_attributes(&h, &mut buf);
        {
            let maps = self.maps.lock().expect("id maps poisoned");
            self.unpacker.unpack_metrics(&mut buf, &maps);
        }
        if self.needs_timepoints {
            self.unpacker.unpack_timepoint_bounds(&h, &mut buf);
        }
        Ok(())
    }
}
