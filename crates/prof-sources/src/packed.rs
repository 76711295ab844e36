//! Reading byte-packed pipeline state.
//!
//! The inverse of the `prof-sinks` packing family. Wire details match the
//! packer exactly: little-endian integers, NUL-terminated strings, and the
//! 64-bit sentinel closing each context subtree. Blobs are produced by our
//! own packer, so truncation here is a broken internal contract and panics.

use bytes::Buf;
use prof_model::{
    Context, DataClass, ExtensionClass, ExtraStatistic, Expression, Metric, MetricIdentifier,
    MetricScopeSet, MetricSettings, MetricVisibility, Module, NestedScope, OpKind,
    ProfileAttributes, Relation, Scope, ScopeType,
};
use prof_pipeline::{
    Classified, ProfileFinalizer, ProfileSink, ProfileSource, SinkHandle, SourceError,
    SourceHandle,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

/// Closes a context subtree; doubles as the "no job id" marker. Identical
/// to the packer's constant.
pub const SENTINEL: u64 = 0xFEF1_F0F3u64 << 32;

fn get_str(buf: &mut &[u8]) -> String {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .expect("unterminated string in packed blob");
    let s = String::from_utf8_lossy(&buf[..pos]).into_owned();
    buf.advance(pos + 1);
    s
}

fn get_path(buf: &mut &[u8]) -> Option<PathBuf> {
    let s = get_str(buf);
    if s.is_empty() { None } else { Some(PathBuf::from(s)) }
}

/// Shared id maps filled by an `IdTracker` and consumed when unpacking
/// metric accumulators.
#[derive(Default)]
pub struct IdMaps {
    pub contexts: HashMap<u64, Arc<Context>>,
    pub metrics: HashMap<u64, Arc<Metric>>,
}

/// Sink recording the identifier of every Context and Metric it sees, so a
/// later metric block can resolve them by id.
pub struct IdTracker {
    handle: Option<SinkHandle>,
    maps: Arc<Mutex<IdMaps>>,
}

impl IdTracker {
    pub fn new() -> (Self, Arc<Mutex<IdMaps>>) {
        let maps = Arc::new(Mutex::new(IdMaps::default()));
        (IdTracker { handle: None, maps: maps.clone() }, maps)
    }
}

impl ProfileSink for IdTracker {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }
    fn accepts(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::CONTEXTS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER
    }
    fn notify_context(&self, c: &Arc<Context>) {
        let h = self.handle.as_ref().expect("sink not bound");
        self.maps
            .lock()
            .expect("id maps poisoned")
            .contexts
            .insert(h.context_id(c) as u64, c.clone());
    }
    fn notify_metric(&self, m: &Arc<Metric>) {
        let h = self.handle.as_ref().expect("sink not bound");
        self.maps
            .lock()
            .expect("id maps poisoned")
            .metrics
            .insert(h.metric_id(m).base() as u64, m.clone());
    }
    fn write(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reusable unpacking state, mirroring the packer's section order.
#[derive(Default)]
pub struct Unpacker {
    metrics: Vec<(Arc<Metric>, u8)>,
    modules: Vec<Arc<Module>>,
}

impl Unpacker {
    /// Unpack the `attributes` section, emitting attributes, metrics and
    /// extra statistics through the handle. Metrics freeze here.
    pub fn unpack_attributes(&mut self, h: &SourceHandle, buf: &mut &[u8]) {
        let mut attrs = ProfileAttributes::default();
        let job = buf.get_u64_le();
        if job != SENTINEL {
            attrs.set_job(job);
        }
        let name = get_str(buf);
        if !name.is_empty() {
            attrs.set_name(name);
        }
        if let Some(p) = get_path(buf) {
            attrs.set_path(p);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let k = get_str(buf);
            let v = get_str(buf);
            attrs.set_environment(k, v);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let kind = buf.get_u16_le();
            attrs.set_idtuple_name(kind, get_str(buf));
        }
        h.attributes(attrs);

        self.metrics.clear();
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let mut s = MetricSettings::new(get_str(buf), get_str(buf));
            s.scopes = MetricScopeSet::from_bits_truncate(buf.get_u8());
            s.visibility = match buf.get_u8() {
                1 => MetricVisibility::HiddenByDefault,
                2 => MetricVisibility::Invisible,
                _ => MetricVisibility::Shown,
            };
            let order = buf.get_u64_le();
            if order != u64::MAX {
                s.order_id = Some(order);
            }
            let _base_id = buf.get_u64_le();
            let nparts = buf.get_u8();
            let m = h.metric(s);
            if nparts > 0 {
                // The plain sum partial always leads; anything beyond it is
                // recreated by the same statistics Finalizers on this rank.
                m.stats_access().request_sum_partial();
            }
            self.metrics.push((m, nparts));
        }

        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let name = get_str(buf);
            let description = get_str(buf);
            let scopes = MetricScopeSet::from_bits_truncate(buf.get_u8());
            let mut referenced: Vec<Arc<Metric>> = Vec::new();
            let formula = self.unpack_expression(buf, &mut referenced);
            h.extra_statistic(ExtraStatistic {
                name,
                description,
                scopes,
                show_percent: false,
                formula,
                metrics: referenced,
            });
        }

        for (m, nparts) in &self.metrics {
            h.metric_freeze(m);
            debug_assert_eq!(
                m.partials().len(),
                *nparts as usize,
                "inconsistent partial counts across ranks"
            );
        }
    }

    fn unpack_expression(&self, buf: &mut &[u8], referenced: &mut Vec<Arc<Metric>>) -> Expression {
        let kind = buf.get_u8();
        match kind {
            0 => Expression::constant(buf.get_f64_le()),
            1 => {
                let m = self.metrics[buf.get_u64_le() as usize].0.clone();
                m.stats_access().request_sum_partial();
                let idx = referenced
                    .iter()
                    .position(|x| Arc::ptr_eq(x, &m))
                    .unwrap_or_else(|| {
                        referenced.push(m);
                        referenced.len() - 1
                    });
                Expression::variable(idx as u64)
            }
            2 => unreachable!("packed expressions carry no subexpression nodes"),
            tag => {
                let kind = OpKind::from_tag(tag).expect("unknown expression tag in packed blob");
                let argc = buf.get_u8();
                let args = (0..argc)
                    .map(|_| self.unpack_expression(buf, referenced))
                    .collect();
                Expression::op(kind, args)
            }
        }
    }

    /// Unpack the `references` section, establishing the module order.
    pub fn unpack_references(&mut self, h: &SourceHandle, buf: &mut &[u8]) {
        self.modules.clear();
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let path = get_path(buf).expect("module with empty path in packed blob");
            let m = match get_path(buf) {
                Some(rel) => h.module_with_relative(path, rel),
                None => h.module(path),
            };
            self.modules.push(m);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let path = get_path(buf).expect("file with empty path in packed blob");
            h.file(path);
        }
    }

    /// Unpack the context tree and flow-graph scopes. Unrepresented scopes
    /// were packed as bare tags; their children re-parent one level up.
    pub fn unpack_contexts(&mut self, h: &SourceHandle, buf: &mut &[u8]) {
        let global_tag = buf.get_u64_le();
        debug_assert_eq!(global_tag, ScopeType::Global as u64, "packed root is not global");
        let _global_id = buf.get_u64_le();
        let global = h.global();
        let mut tip: Vec<Arc<Context>> = Vec::new();
        loop {
            let next = buf.get_u64_le();
            if next == SENTINEL {
                if tip.is_empty() {
                    break;
                }
                tip.pop();
                continue;
            }
            let scope = if next == ScopeType::Point as u64 {
                let midx = buf.get_u64_le() as usize;
                let offset = buf.get_u64_le();
                let _id = buf.get_u64_le();
                Scope::Point { module: self.modules[midx].clone(), offset }
            } else if next == ScopeType::Placeholder as u64 {
                let v = buf.get_u64_le();
                let _id = buf.get_u64_le();
                Scope::Placeholder(v)
            } else if next == ScopeType::Unknown as u64 {
                let _id = buf.get_u64_le();
                Scope::Unknown
            } else if next == ScopeType::Global as u64 {
                unreachable!("packed global scope below the root")
            } else {
                // Unrepresented scope: keep walking under the same parent.
                let dup = tip.last().cloned().unwrap_or_else(|| global.clone());
                tip.push(dup);
                continue;
            };
            let parent = tip.last().cloned().unwrap_or_else(|| global.clone());
            let (_, c) = h.context(&parent, NestedScope::new(Relation::Call, scope));
            tip.push(c);
        }

        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let tag = buf.get_u64_le();
            debug_assert_eq!(tag, ScopeType::Point as u64, "unexpected flow graph scope");
            let midx = buf.get_u64_le() as usize;
            let offset = buf.get_u64_le();
            h.context_flow_graph(&Scope::Point {
                module: self.modules[midx].clone(),
                offset,
            });
        }
    }

    /// Unpack metric accumulators, merging into the shared Contexts via the
    /// tracked identifiers.
    pub fn unpack_metrics(&self, buf: &mut &[u8], maps: &IdMaps) {
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let ctx = maps
                .contexts
                .get(&buf.get_u64_le())
                .expect("unknown context id in packed metrics")
                .clone();
            let mcnt = buf.get_u64_le();
            for _ in 0..mcnt {
                let m = maps
                    .metrics
                    .get(&buf.get_u64_le())
                    .expect("unknown metric id in packed metrics")
                    .clone();
                let used = MetricScopeSet::from_bits_truncate(buf.get_u8());
                let mut data = ctx.data();
                data.mark_used(&m, used);
                let acc = data.statistics_for(&m);
                for p in 0..m.partials().len().max(1) {
                    for scope in m.scopes().members() {
                        let mut raw = [0.0; 5];
                        for v in raw.iter_mut() {
                            *v = buf.get_f64_le();
                        }
                        let raw = prof_model::AccumulatorRaw::from_array(raw);
                        if !raw.is_zero() {
                            acc.add_raw(p, scope, raw);
                        }
                    }
                }
            }
        }
    }

    /// Unpack the timepoint bounds.
    pub fn unpack_timepoint_bounds(&self, h: &SourceHandle, buf: &mut &[u8]) {
        let min = buf.get_u64_le();
        let max = buf.get_u64_le();
        if (min, max) != (0, 0) {
            h.timepoint_bounds(min, max);
        }
    }
}

/// A Source replaying a packed attributes+references+contexts blob.
pub struct BlobSource {
    handle: Option<SourceHandle>,
    blob: Vec<u8>,
    unpacker: Unpacker,
    done: bool,
}

impl BlobSource {
    pub fn new(blob: Vec<u8>) -> Self {
        BlobSource { handle: None, blob, unpacker: Unpacker::default(), done: false }
    }
}

impl ProfileSource for BlobSource {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }
    fn provides(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::CONTEXTS
    }
    fn finalize_request(&self, requested: DataClass) -> DataClass {
        // The blob is one sequential stream; any of it means all of it.
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
        let mut buf: &[u8] = &self.blob;
        self.unpacker.unpack_attributes(&h, &mut buf);
        self.unpacker.unpack_references(&h, &mut buf);
        self.unpacker.unpack_contexts(&h, &mut buf);
        debug!(target: "source.packed", "replayed packed id blob");
        Ok(())
    }
}

// ---------------------------------------------------------------------------

/// One parsed context-tree node key: how a child is recognized under its
/// parent when replaying identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CtxKey {
    Unknown,
    Placeholder(u64),
    Point(String, u64),
}

struct UnpackedIds {
    global_id: u32,
    contexts: HashMap<(u32, CtxKey), u32>,
    metric_bases: HashMap<String, u32>,
}

/// Finalizer replaying rank 0's dense identifiers from an `IdPacker` blob,
/// and pinning classification so the tree shape stays bitwise identical to
/// what was packed.
pub struct IdUnpacker {
    handle: Option<SourceHandle>,
    blob: Vec<u8>,
    state: OnceLock<UnpackedIds>,
}

impl IdUnpacker {
    pub fn new(blob: Vec<u8>) -> Self {
        IdUnpacker { handle: None, blob, state: OnceLock::new() }
    }

    fn state(&self) -> &UnpackedIds {
        self.state.get_or_init(|| self.parse())
    }

    fn parse(&self) -> UnpackedIds {
        let mut buf: &[u8] = &self.blob;

        // Attributes: only the metric id bases matter here.
        let _job = buf.get_u64_le();
        let _name = get_str(&mut buf);
        let _path = get_str(&mut buf);
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            get_str(&mut buf);
            get_str(&mut buf);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            buf.get_u16_le();
            get_str(&mut buf);
        }
        let mut metric_bases = HashMap::new();
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            let name = get_str(&mut buf);
            let _desc = get_str(&mut buf);
            let _scopes = buf.get_u8();
            let _vis = buf.get_u8();
            let _order = buf.get_u64_le();
            let base = buf.get_u64_le();
            let _nparts = buf.get_u8();
            metric_bases.insert(name, base as u32);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            get_str(&mut buf);
            get_str(&mut buf);
            buf.get_u8();
            skip_expression(&mut buf);
        }

        // References: module paths index the context payloads.
        let mut modules = Vec::new();
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            modules.push(get_str(&mut buf));
            get_str(&mut buf);
        }
        let cnt = buf.get_u64_le();
        for _ in 0..cnt {
            get_str(&mut buf);
        }

        // Contexts: (parent id, key) -> id.
        let global_tag = buf.get_u64_le();
        debug_assert_eq!(global_tag, ScopeType::Global as u64);
        let global_id = buf.get_u64_le() as u32;
        let mut contexts = HashMap::new();
        let mut tip: Vec<u32> = Vec::new();
        loop {
            let next = buf.get_u64_le();
            if next == SENTINEL {
                if tip.is_empty() {
                    break;
                }
                tip.pop();
                continue;
            }
            let (key, id) = if next == ScopeType::Point as u64 {
                let midx = buf.get_u64_le() as usize;
                let offset = buf.get_u64_le();
                (Some(CtxKey::Point(modules[midx].clone(), offset)), buf.get_u64_le() as u32)
            } else if next == ScopeType::Placeholder as u64 {
                let v = buf.get_u64_le();
                (Some(CtxKey::Placeholder(v)), buf.get_u64_le() as u32)
            } else if next == ScopeType::Unknown as u64 {
                (Some(CtxKey::Unknown), buf.get_u64_le() as u32)
            } else {
                (None, *tip.last().unwrap_or(&global_id))
            };
            let parent = *tip.last().unwrap_or(&global_id);
            if let Some(key) = key {
                contexts.insert((parent, key), id);
            }
            tip.push(id);
        }

        debug!(
            target: "source.packed",
            contexts = contexts.len(),
            metrics = metric_bases.len(),
            "replaying remote identifiers"
        );
        UnpackedIds { global_id, contexts, metric_bases }
    }

    fn key_for(scope: &Scope) -> Option<CtxKey> {
        match scope {
            Scope::Unknown => Some(CtxKey::Unknown),
            Scope::Placeholder(v) => Some(CtxKey::Placeholder(*v)),
            Scope::Point { module, offset } => {
                Some(CtxKey::Point(module.path().display().to_string(), *offset))
            }
            _ => None,
        }
    }
}

fn skip_expression(buf: &mut &[u8]) {
    match buf.get_u8() {
        0 => {
            buf.get_f64_le();
        }
        1 => {
            buf.get_u64_le();
        }
        2 => unreachable!("packed expressions carry no subexpression nodes"),
        _ => {
            let argc = buf.get_u8();
            for _ in 0..argc {
                skip_expression(buf);
            }
        }
    }
}

impl ProfileFinalizer for IdUnpacker {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }

    fn provides(&self) -> ExtensionClass {
        ExtensionClass::IDENTIFIER | ExtensionClass::CLASSIFICATION
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn identify_context(&self, c: &Arc<Context>) -> Option<u32> {
        let st = self.state();
        let Some(parent) = c.direct_parent() else {
            return Some(st.global_id);
        };
        let key = Self::key_for(c.scope())?;
        let h = self.handle.as_ref().expect("finalizer not bound");
        let parent_id = h.context_id(&parent);
        st.contexts.get(&(parent_id, key)).copied()
    }

    fn identify_metric(&self, m: &Arc<Metric>) -> Option<MetricIdentifier> {
        let st = self.state();
        let base = *st.metric_bases.get(m.name())?;
        Some(MetricIdentifier::new(base, m.partials().len(), m.scopes()))
    }

    /// The packed format cannot represent classified structure, so pin
    /// every scope flat under its ancestor.
    fn classify(&self, ancestor: &Arc<Context>, _ns: &mut NestedScope) -> Option<Classified> {
        Some(Classified { relation: None, flat_parent: ancestor.clone() })
    }
}
