//! Profile-wide attributes and per-thread identity.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::warn;

/// Attributes of the profiled execution as a whole. Sources merge into a
/// single shared instance; conflicting scalar values keep the first writer.
#[derive(Debug, Clone, Default)]
pub struct ProfileAttributes {
    name: Option<String>,
    path: Option<PathBuf>,
    job: Option<u64>,
    environment: BTreeMap<String, String>,
    idtuple_names: BTreeMap<u16, String>,
}

impl ProfileAttributes {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
    pub fn job(&self) -> Option<u64> {
        self.job
    }
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }
    pub fn idtuple_names(&self) -> &BTreeMap<u16, String> {
        &self.idtuple_names
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }
    pub fn set_job(&mut self, job: u64) {
        self.job = Some(job);
    }
    pub fn set_environment(&mut self, key: String, value: String) {
        self.environment.insert(key, value);
    }
    pub fn set_idtuple_name(&mut self, kind: u16, name: String) {
        self.idtuple_names.insert(kind, name);
    }

    /// Union another attribute set into this one. First writer wins for the
    /// scalar slots; maps union with the existing entries kept on conflict.
    pub fn merge(&mut self, other: ProfileAttributes) {
        match (&self.name, other.name) {
            (None, Some(n)) => self.name = Some(n),
            (Some(a), Some(b)) if *a != b => {
                warn!(target: "pipeline.attrs", ours = %a, theirs = %b,
                      "conflicting profile names, keeping the first");
            }
            _ => {}
        }
        match (&self.path, other.path) {
            (None, Some(p)) => self.path = Some(p),
            (Some(a), Some(b)) if *a != b => {
                warn!(target: "pipeline.attrs", "conflicting profile paths, keeping the first");
            }
            _ => {}
        }
        match (self.job, other.job) {
            (None, Some(j)) => self.job = Some(j),
            (Some(a), Some(b)) if a != b => {
                warn!(target: "pipeline.attrs", ours = a, theirs = b,
                      "conflicting job ids, keeping the first");
            }
            _ => {}
        }
        for (k, v) in other.environment {
            self.environment.entry(k).or_insert(v);
        }
        for (k, v) in other.idtuple_names {
            self.idtuple_names.entry(k).or_insert(v);
        }
    }
}

/// Well-known id-tuple kinds. Stored as raw u16 on the wire; unknown kinds
/// pass through untouched.
pub mod tuple_kind {
    pub const SUMMARY: u16 = 0;
    pub const NODE: u16 = 1;
    pub const RANK: u16 = 2;
    pub const THREAD: u16 = 3;
    pub const GPU_DEVICE: u16 = 4;
    pub const GPU_CONTEXT: u16 = 5;
    pub const GPU_STREAM: u16 = 6;
    pub const CORE: u16 = 7;
}

/// One element of a thread's hierarchical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdTupleEntry {
    pub kind: u16,
    pub logical_index: u64,
    pub physical_index: u64,
}

/// A thread's identity: a sequence of (kind, logical, physical) triples from
/// outermost (node) to innermost (thread/stream). Equality and hashing ignore
/// the logical index, matching the dedup rule for merged threads.
#[derive(Debug, Clone, Eq)]
pub struct IdTuple(pub Vec<IdTupleEntry>);

impl PartialEq for IdTuple {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.kind == b.kind && a.physical_index == b.physical_index)
    }
}

impl std::hash::Hash for IdTuple {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for e in &self.0 {
            e.kind.hash(state);
            e.physical_index.hash(state);
        }
    }
}

/// Everything a Source must declare about a thread before emitting for it.
#[derive(Debug, Clone, Default)]
pub struct ThreadAttributes {
    idtuple: Vec<IdTupleEntry>,
    ctx_timepoint_disorder: u32,
    metric_timepoint_disorder: BTreeMap<String, u32>,
}

impl ThreadAttributes {
    pub fn new(idtuple: Vec<IdTupleEntry>) -> Self {
        ThreadAttributes { idtuple, ..Default::default() }
    }

    pub fn idtuple(&self) -> &[IdTupleEntry] {
        &self.idtuple
    }

    pub fn idtuple_key(&self) -> IdTuple {
        IdTuple(self.idtuple.clone())
    }

    /// Declared disorder bound for the thread's ctx timepoint stream.
    pub fn ctx_timepoint_disorder(&self) -> u32 {
        self.ctx_timepoint_disorder
    }
    pub fn set_ctx_timepoint_disorder(&mut self, k: u32) {
        self.ctx_timepoint_disorder = k;
    }

    /// Declared disorder bound for one metric's timepoint stream; unknown
    /// metrics are in-order.
    pub fn metric_timepoint_disorder(&self, metric_name: &str) -> u32 {
        self.metric_timepoint_disorder
            .get(metric_name)
            .copied()
            .unwrap_or(0)
    }
    pub fn set_metric_timepoint_disorder(&mut self, metric_name: String, k: u32) {
        self.metric_timepoint_disorder.insert(metric_name, k);
    }

    /// Readiness predicate: a Source must fill the identity before use.
    pub fn ok(&self) -> bool {
        !self.idtuple.is_empty()
    }
}

impl std::fmt::Display for ThreadAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for e in &self.idtuple {
            if !first {
                write!(f, ".")?;
            }
            first = false;
            write!(f, "{}:{}", e.kind, e.physical_index)?;
        }
        Ok(())
    }
}

/// A single profiled thread of execution.
#[derive(Debug)]
pub struct Thread {
    pub attributes: ThreadAttributes,
    pub(crate) identifier: OnceLock<u32>,
}

impl Thread {
    pub fn new(attributes: ThreadAttributes) -> Self {
        Thread { attributes, identifier: OnceLock::new() }
    }

    /// Lazy slot for the `identifier` extension.
    pub fn identifier_cell(&self) -> &OnceLock<u32> {
        &self.identifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_first_scalar() {
        let mut a = ProfileAttributes::default();
        a.set_name("first".into());
        let mut b = ProfileAttributes::default();
        b.set_name("second".into());
        b.set_job(7);
        b.set_environment("K".into(), "V".into());
        a.merge(b);
        assert_eq!(a.name(), Some("first"));
        assert_eq!(a.job(), Some(7));
        assert_eq!(a.environment().get("K").map(String::as_str), Some("V"));
    }

    #[test]
    fn idtuple_ignores_logical_index() {
        let a = IdTuple(vec![IdTupleEntry {
            kind: tuple_kind::RANK,
            logical_index: 0,
            physical_index: 3,
        }]);
        let b = IdTuple(vec![IdTupleEntry {
            kind: tuple_kind::RANK,
            logical_index: 9,
            physical_index: 3,
        }]);
        assert_eq!(a, b);
        let c = IdTuple(vec![IdTupleEntry {
            kind: tuple_kind::RANK,
            logical_index: 0,
            physical_index: 4,
        }]);
        assert_ne!(a, c);
    }

    #[test]
    fn readiness() {
        assert!(!ThreadAttributes::default().ok());
        assert!(
            ThreadAttributes::new(vec![IdTupleEntry {
                kind: tuple_kind::THREAD,
                logical_index: 0,
                physical_index: 0,
            }])
            .ok()
        );
    }
}
