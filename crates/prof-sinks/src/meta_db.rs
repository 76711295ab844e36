//! The meta database: the structural half of the output database.
//!
//! `meta.db` holds everything needed to interpret the value data: the
//! profile attributes, a string table, the module/file tables, the metric
//! taxonomy, and the calling-context tree in preorder with dense ids. The
//! layout is versioned and self-describing; all integers little-endian.

use bytes::BufMut;
use prof_model::{Context, DataClass, ExtensionClass, Relation, Scope};
use prof_pipeline::{ProfileSink, SinkHandle};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const MAGIC: &[u8; 8] = b"PROFMETA";
const VERSION: u32 = 1;

#[derive(Default)]
struct StringTable {
    index: HashMap<String, u32>,
    list: Vec<String>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.list.len() as u32;
        self.list.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

struct CtxRecord {
    id: u32,
    parent: u32,
    relation: u8,
    tag: u8,
    name: u32,
    a: u64,
    b: u64,
}

/// Sink writing `meta.db` into the database directory.
pub struct MetaDB {
    dir: PathBuf,
    handle: Option<SinkHandle>,
}

impl MetaDB {
    pub fn new(dir: PathBuf) -> Self {
        MetaDB { dir, handle: None }
    }

    /// Instruction-grain enclosure leaves fold into their parents: the
    /// presentation layer works at line grain.
    fn elide(c: &Context) -> bool {
        c.direct_parent().is_some()
            && c.relation() == Relation::Enclosure
            && matches!(c.scope(), Scope::Point { .. })
    }
}

impl ProfileSink for MetaDB {
    fn bind(&mut self, handle: SinkHandle) {
        self.handle = Some(handle);
    }

    fn accepts(&self) -> DataClass {
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::CONTEXTS | DataClass::METRICS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::CLASSIFICATION | ExtensionClass::IDENTIFIER
    }

    fn write(&self) -> std::io::Result<()> {
        let h = self.handle.as_ref().expect("sink not bound");
        std::fs::create_dir_all(&self.dir)?;

        let mut strings = StringTable::default();
        let mut out: Vec<u8> = Vec::new();

        // Attributes.
        let attrs = h.attributes();
        let name_s = strings.intern(attrs.name().unwrap_or(""));
        let path_s =
            strings.intern(&attrs.path().map(|p| p.display().to_string()).unwrap_or_default());
        out.put_u32_le(name_s);
        out.put_u32_le(path_s);
        out.put_u64_le(attrs.job().unwrap_or(u64::MAX));
        out.put_u32_le(attrs.environment().len() as u32);
        for (k, v) in attrs.environment() {
            let k = strings.intern(k);
            let v = strings.intern(v);
            out.put_u32_le(k);
            out.put_u32_le(v);
        }

        // Modules and files, ordered by dense id.
        let mut modules = h.modules();
        modules.sort_by_key(|m| h.module_id(m));
        out.put_u32_le(modules.len() as u32);
        let mut module_ids: HashMap<*const prof_model::Module, u32> = HashMap::new();
        for m in &modules {
            let id = h.module_id(m);
            module_ids.insert(Arc::as_ptr(m), id);
            let s = strings.intern(&m.path().display().to_string());
            out.put_u32_le(id);
            out.put_u32_le(s);
        }
        let mut files = h.files();
        files.sort_by_key(|f| h.file_id(f));
        out.put_u32_le(files.len() as u32);
        let mut file_ids: HashMap<*const prof_model::File, u32> = HashMap::new();
        for f in &files {
            let id = h.file_id(f);
            file_ids.insert(Arc::as_ptr(f), id);
            let s = strings.intern(&f.path().display().to_string());
            out.put_u32_le(id);
            out.put_u32_le(s);
        }

        // Metric taxonomy.
        let mut metrics = h.metrics();
        metrics.sort_by_key(|m| h.metric_id(m).base());
        out.put_u32_le(metrics.len() as u32);
        for m in &metrics {
            let s = m.settings();
            let name = strings.intern(&s.name);
            let desc = strings.intern(&s.description);
            out.put_u32_le(name);
            out.put_u32_le(desc);
            out.put_u8(s.scopes.bits());
            out.put_u8(s.visibility as u8);
            out.put_u64_le(s.order_id.unwrap_or(u64::MAX));
            out.put_u32_le(h.metric_id(m).base());
            out.put_u8(m.partials().len() as u8);
            out.put_u8(m.statistics().len() as u8);
            for st in m.statistics() {
                let suffix = strings.intern(&st.suffix);
                let formula = st.finalize.render(&|i| format!("$p{i}"));
                let formula = strings.intern(&formula);
                out.put_u32_le(suffix);
                out.put_u8(st.show_percent as u8);
                out.put_u32_le(formula);
            }
        }

        // Context tree, preorder, with instruction-grain leaves elided.
        let mut records: Vec<CtxRecord> = Vec::new();
        let root = h.contexts();
        let root_id = h.context_id(&root);
        records.push(CtxRecord {
            id: root_id,
            parent: u32::MAX,
            relation: Relation::Global as u8,
            tag: prof_model::ScopeType::Global as u8,
            name: strings.intern(""),
            a: 0,
            b: 0,
        });
        fn walk(
            h: &SinkHandle,
            strings: &mut StringTable,
            module_ids: &HashMap<*const prof_model::Module, u32>,
            file_ids: &HashMap<*const prof_model::File, u32>,
            records: &mut Vec<CtxRecord>,
            c: &Arc<Context>,
            effective_parent: u32,
        ) {
            for child in c.children() {
                let parent = if MetaDB::elide(&child) {
                    effective_parent
                } else {
                    let id = h.context_id(&child);
                    let (name, a, b) = match child.scope() {
                        Scope::Global => unreachable!("global below the root"),
                        Scope::Unknown => (strings.intern(""), 0, 0),
                        Scope::Placeholder(v) => (strings.intern(""), *v, 0),
                        Scope::Point { module, offset } => (
                            strings.intern(""),
                            module_ids[&Arc::as_ptr(module)] as u64,
                            *offset,
                        ),
                        Scope::Function(f) => (
                            strings.intern(f.name()),
                            module_ids[&Arc::as_ptr(f.module())] as u64,
                            f.entry().unwrap_or(u64::MAX),
                        ),
                        Scope::LexicalLoop { file, line } => (
                            strings.intern(""),
                            file_ids[&Arc::as_ptr(file)] as u64,
                            *line as u64,
                        ),
                        Scope::BinaryLoop { module, offset, .. } => (
                            strings.intern(""),
                            module_ids[&Arc::as_ptr(module)] as u64,
                            *offset,
                        ),
                        Scope::Line { file, line } => (
                            strings.intern(""),
                            file_ids[&Arc::as_ptr(file)] as u64,
                            *line as u64,
                        ),
                    };
                    records.push(CtxRecord {
                        id,
                        parent: effective_parent,
                        relation: child.relation() as u8,
                        tag: child.scope().scope_type() as u8,
                        name,
                        a,
                        b,
                    });
                    id
                };
                walk(h, strings, module_ids, file_ids, records, &child, parent);
            }
        }
        walk(h, &mut strings, &module_ids, &file_ids, &mut records, &root, root_id);

        out.put_u32_le(records.len() as u32);
        for r in &records {
            out.put_u32_le(r.id);
            out.put_u32_le(r.parent);
            out.put_u8(r.relation);
            out.put_u8(r.tag);
            out.put_u32_le(r.name);
            out.put_u64_le(r.a);
            out.put_u64_le(r.b);
        }

        // Header + string table first, then the body.
        let path = self.dir.join("meta.db");
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        file.write_all(MAGIC)?;
        let mut head: Vec<u8> = Vec::new();
        head.put_u32_le(VERSION);
        head.put_u32_le(strings.list.len() as u32);
        for s in &strings.list {
            head.put_u32_le(s.len() as u32);
            head.put_slice(s.as_bytes());
        }
        file.write_all(&head)?;
        file.write_all(&out)?;
        file.flush()?;
        info!(
            target: "sink.metadb",
            path = %path.display(),
            contexts = records.len(),
            "wrote meta database"
        );
        Ok(())
    }
}
