//! Byte-packing of pipeline state.
//!
//! After packing, a blob can be saved or handed to another rank and read
//! back with the matching `prof-sources` unpacker. All integers are
//! little-endian; strings are NUL-terminated; a 64-bit sentinel closes each
//! context subtree.

use bytes::BufMut;
use prof_model::expression::Node;
use prof_model::{ByPtr, Context, Expression, Metric, Module, Scope, ScopeType};
use prof_pipeline::{ProfileSink, SinkHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use tracing::debug;

/// Closes a context subtree; doubles as the "no job id" marker.
pub const SENTINEL: u64 = 0xFEF1_F0F3u64 << 32;

pub(crate) fn put_str(out: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0));
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

/// Reusable packing state shared by the packing Sink family. The Metric and
/// Module orders established by `pack_attributes`/`pack_references` are what
/// later sections refer to by index.
#[derive(Default)]
pub struct Packer {
    metrics: Vec<Arc<Metric>>,
    module_ids: HashMap<ByPtr<Module>, u64>,
}

impl Packer {
    /// Pack `attributes` data: the profile attributes, metric definitions,
    /// and extra statistics.
    pub fn pack_attributes(&mut self, h: &SinkHandle, out: &mut Vec<u8>) {
        let attrs = h.attributes();
        out.put_u64_le(attrs.job().unwrap_or(SENTINEL));
        put_str(out, attrs.name().unwrap_or(""));
        put_str(out, &attrs.path().map(|p| p.display().to_string()).unwrap_or_default());
        out.put_u64_le(attrs.environment().len() as u64);
        for (k, v) in attrs.environment() {
            put_str(out, k);
            put_str(out, v);
        }
        out.put_u64_le(attrs.idtuple_names().len() as u64);
        for (&kind, name) in attrs.idtuple_names() {
            out.put_u16_le(kind);
            put_str(out, name);
        }

        let mut metrics = h.metrics();
        metrics.sort_by(|a, b| a.name().cmp(b.name()));
        out.put_u64_le(metrics.len() as u64);
        for m in &metrics {
            let s = m.settings();
            put_str(out, &s.name);
            put_str(out, &s.description);
            out.put_u8(s.scopes.bits());
            out.put_u8(s.visibility as u8);
            out.put_u64_le(s.order_id.unwrap_or(u64::MAX));
            out.put_u64_le(h.metric_id(m).base() as u64);
            out.put_u8(m.partials().len() as u8);
        }
        self.metrics = metrics;

        let estats = h.extra_statistics();
        out.put_u64_le(estats.len() as u64);
        for es in &estats {
            put_str(out, &es.name);
            put_str(out, &es.description);
            out.put_u8(es.scopes.bits());
            self.pack_expression(out, &es.formula, es.formula.root(), &es.metrics);
        }
    }

    fn pack_expression(
        &self,
        out: &mut Vec<u8>,
        expr: &Expression,
        node: usize,
        metrics: &[Arc<Metric>],
    ) {
        match expr.node(node) {
            Node::Constant(c) => {
                out.put_u8(0);
                out.put_f64_le(*c);
            }
            Node::Variable(u) => {
                let m = &metrics[*u as usize];
                let idx = self
                    .metrics
                    .iter()
                    .position(|x| Arc::ptr_eq(x, m))
                    .expect("extra statistic references an unpacked metric");
                out.put_u8(1);
                out.put_u64_le(idx as u64);
            }
            // Shared subtrees flatten on the wire.
            Node::SubExpression(inner) => self.pack_expression(out, expr, *inner, metrics),
            Node::Op { kind, args } => {
                out.put_u8(*kind as u8);
                out.put_u8(args.len() as u8);
                for &a in args {
                    self.pack_expression(out, expr, a, metrics);
                }
            }
        }
    }

    /// Pack `references` data, establishing the module order.
    pub fn pack_references(&mut self, h: &SinkHandle, out: &mut Vec<u8>) {
        let mut modules = h.modules();
        modules.sort_by(|a, b| a.path().cmp(b.path()));
        out.put_u64_le(modules.len() as u64);
        for (i, m) in modules.iter().enumerate() {
            put_str(out, &m.path().display().to_string());
            put_str(
                out,
                &m.relative_path().map(|p| p.display().to_string()).unwrap_or_default(),
            );
            self.module_ids.insert(ByPtr::new(m.clone()), i as u64);
        }
        let mut files = h.files();
        files.sort_by(|a, b| a.path().cmp(b.path()));
        out.put_u64_le(files.len() as u64);
        for f in &files {
            put_str(out, &f.path().display().to_string());
        }
    }

    /// Pack the context tree (preorder, sentinel-terminated subtrees) and
    /// the flow-graph scopes.
    pub fn pack_contexts(&self, h: &SinkHandle, out: &mut Vec<u8>) {
        let root = h.contexts();
        out.put_u64_le(ScopeType::Global as u64);
        out.put_u64_le(h.context_id(&root) as u64);
        self.pack_children(h, &root, out);
        out.put_u64_le(SENTINEL);

        let graphs = h.context_flow_graphs();
        let point_graphs: Vec<_> = graphs
            .iter()
            .filter(|g| matches!(g.scope(), Scope::Point { .. }))
            .collect();
        out.put_u64_le(point_graphs.len() as u64);
        for g in point_graphs {
            let Scope::Point { module, offset } = g.scope() else { unreachable!() };
            out.put_u64_le(ScopeType::Point as u64);
            out.put_u64_le(self.module_id(module));
            out.put_u64_le(*offset);
        }
    }

    fn module_id(&self, module: &Arc<Module>) -> u64 {
        *self
            .module_ids
            .get(&ByPtr::new(module.clone()))
            .expect("module missing from packed references")
    }

    fn pack_children(&self, h: &SinkHandle, c: &Arc<Context>, out: &mut Vec<u8>) {
        let mut children = c.children();
        children.sort_by_key(|c| h.context_id(c));
        for child in children {
            match child.scope() {
                Scope::Global => unreachable!("global scope below the root"),
                Scope::Unknown => {
                    out.put_u64_le(ScopeType::Unknown as u64);
                    out.put_u64_le(h.context_id(&child) as u64);
                }
                Scope::Placeholder(v) => {
                    out.put_u64_le(ScopeType::Placeholder as u64);
                    out.put_u64_le(*v);
                    out.put_u64_le(h.context_id(&child) as u64);
                }
                Scope::Point { module, offset } => {
                    out.put_u64_le(ScopeType::Point as u64);
                    out.put_u64_le(self.module_id(module));
                    out.put_u64_le(*offset);
                    out.put_u64_le(h.context_id(&child) as u64);
                }
                // Scopes the format does not represent: tag only, no id;
                // the unpacker re-parents their children.
                Scope::Function(_) => out.put_u64_le(ScopeType::Function as u64),
                Scope::LexicalLoop { .. } => out.put_u64_le(ScopeType::LexicalLoop as u64),
                Scope::BinaryLoop { .. } => out.put_u64_le(ScopeType::BinaryLoop as u64),
                Scope::Line { .. } => out.put_u64_le(ScopeType::Line as u64),
            }
            self.pack_children(h, &child, out);
            out.put_u64_le(SENTINEL);
        }
    }

    /// Pack the statistic accumulators: per context, per metric, the raw
    /// tuples for every (partial, scope).
    pub fn pack_metrics(&self, h: &SinkHandle, out: &mut Vec<u8>) {
        let root = h.contexts();
        let mut entries: Vec<(u64, Vec<u8>)> = Vec::new();
        root.walk_preorder(&mut |c, _| {
            let data = c.data();
            if data.is_empty() {
                return;
            }
            let mut body = Vec::new();
            let mut cnt = 0u64;
            let mut metrics: Vec<_> = data.iter().collect();
            metrics.sort_by(|(a, _), (b, _)| a.name().cmp(b.name()));
            for (m, acc) in metrics {
                body.put_u64_le(h.metric_id(m.inner()).base() as u64);
                body.put_u8(acc.used.bits());
                for p in 0..m.partials().len().max(1) {
                    for scope in m.scopes().members() {
                        for v in acc.get(p, scope).to_array() {
                            body.put_f64_le(v);
                        }
                    }
                }
                cnt += 1;
            }
            let mut block = Vec::new();
            block.put_u64_le(h.context_id(c) as u64);
            block.put_u64_le(cnt);
            block.extend_from_slice(&body);
            entries.push((h.context_id(c) as u64, block));
        });
        entries.sort_by_key(|(id, _)| *id);
        out.put_u64_le(entries.len() as u64);
        for (_, block) in entries {
            out.extend_from_slice(&block);
        }
    }

    /// Pack the timepoint bounds (not the traces themselves).
    pub fn pack_timepoint_bounds(&self, h: &SinkHandle, out: &mut Vec<u8>) {
        let (min, max) = h.timepoint_bounds().unwrap_or((0, 0));
        out.put_u64_le(min);
        out.put_u64_le(max);
    }
}

/// Callback receiving the packed id blob on the rank that produced it.
pub trait PackedHandler: Send + Sync {
    fn notify_packed(&self, data: Vec<u8>);
}

impl<F: Fn(Vec<u8>) + Send + Sync> PackedHandler for F {
    fn notify_packed(&self, data: Vec<u8>) {
        self(data)
    }
}

/// Sink that packs attributes + references + contexts right after the
/// contexts wavefront, so other ranks can replay rank 0's identifiers.
pub struct IdPacker {
    handle: Option<SinkHandle>,
    packer: Mutex<Packer>,
    on_packed: Box<dyn PackedHandler>,
    packed: Once,
}

impl IdPacker {
    pub fn new(on_packed: Box<dyn PackedHandler>) -> Self {
        IdPacker {
            handle: None,
            packer: Mutex::new(Packer::default()),
            on_packed,
            packed: Once::new(),
        }
    }
}

impl ProfileSink for IdPacker {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }

    fn accepts(&self) -> prof_model::DataClass {
        prof_model::DataClass::ATTRIBUTES | prof_model::DataClass::CONTEXTS
    }
    fn wavefronts(&self) -> prof_model::DataClass {
        self.accepts()
    }
    fn requirements(&self) -> prof_model::ExtensionClass {
        prof_model::ExtensionClass::IDENTIFIER
    }

    fn notify_wavefront(&self, delivered: prof_model::DataClass) {
        if !delivered.has_attributes() || !delivered.has_contexts() {
            return;
        }
        self.packed.call_once(|| {
            let h = self.handle.as_ref().expect("sink not bound");
            let mut packer = self.packer.lock().expect("packer poisoned");
            let mut out = Vec::new();
            packer.pack_attributes(h, &mut out);
            packer.pack_references(h, &mut out);
            packer.pack_contexts(h, &mut out);
            debug!(target: "sink.packed", bytes = out.len(), "packed id blob");
            self.on_packed.notify_packed(out);
        });
    }

    fn write(&self) -> std::io::Result<()> {
        Ok(())
    }
}
