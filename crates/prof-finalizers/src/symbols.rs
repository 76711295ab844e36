//! Direct classification from binary symbol tables.
//!
//! The fallback classifier when no structure file matches a module: an
//! `nm`-style dump (`<address> <size> <type> <name>` per line) gives
//! function bounds, and point samples classify to an enclosing-function
//! Context with no loop or line detail. The symbol extractor itself is an
//! external collaborator; the dump format is its narrow contract.

use crate::range_map::RangeMap;
use dashmap::DashMap;
use prof_model::{Context, ExtensionClass, Function, Module, NestedScope, Relation, Scope};
use prof_pipeline::{Classified, ProfileFinalizer, SourceHandle};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SymbolsError {
    #[error("failed to read symbol table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct SymTable {
    /// (entry, size, name), sorted by entry.
    syms: Vec<(u64, u64, String)>,
}

struct ModuleSymData {
    funcs: RangeMap<Arc<Function>>,
}

/// Finalizer mapping binaries to their symbol-table dumps.
#[derive(Default)]
pub struct BinarySymbols {
    handle: Option<SourceHandle>,
    tables: Vec<(PathBuf, SymTable)>,
    /// Built per module on first classification, keyed by module identity.
    data: DashMap<usize, Arc<ModuleSymData>>,
}

impl BinarySymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the symbol dump for one binary.
    pub fn load(&mut self, module_path: &Path, dump_path: &Path) -> Result<(), SymbolsError> {
        let text = std::fs::read_to_string(dump_path).map_err(|source| SymbolsError::Io {
            path: dump_path.to_path_buf(),
            source,
        })?;
        let line_re = Regex::new(r"^([0-9a-fA-F]+)\s+([0-9a-fA-F]+)\s+([A-Za-z])\s+(\S+)")
            .expect("static regex");
        let mut syms = Vec::new();
        for line in text.lines() {
            let Some(caps) = line_re.captures(line) else { continue };
            if !matches!(caps[3].chars().next().unwrap_or('?'), 'T' | 't' | 'W' | 'w') {
                continue;
            }
            let (Ok(addr), Ok(size)) = (
                u64::from_str_radix(&caps[1], 16),
                u64::from_str_radix(&caps[2], 16),
            ) else {
                continue;
            };
            if size == 0 {
                continue;
            }
            syms.push((addr, size, caps[4].to_string()));
        }
        syms.sort_by_key(|&(addr, _, _)| addr);
        info!(
            target: "finalizer.symbols",
            module = %module_path.display(),
            dump = %dump_path.display(),
            symbols = syms.len(),
            "loaded symbol table"
        );
        self.tables.push((module_path.to_path_buf(), SymTable { syms }));
        Ok(())
    }

    fn data_for(&self, module: &Arc<Module>) -> Option<Arc<ModuleSymData>> {
        let key = Arc::as_ptr(module) as usize;
        if let Some(d) = self.data.get(&key) {
            return Some(d.clone());
        }
        let table = self
            .tables
            .iter()
            .find(|(p, _)| p == module.path())
            .or_else(|| {
                self.tables
                    .iter()
                    .find(|(p, _)| p.file_name() == module.path().file_name())
            })
            .map(|(_, t)| t)?;
        let mut funcs = RangeMap::new();
        for (addr, size, name) in &table.syms {
            funcs.insert(
                *addr,
                addr + size,
                Arc::new(Function::new(module.clone(), name.clone(), Some(*addr), None)),
            );
        }
        let data = Arc::new(ModuleSymData { funcs });
        Some(self.data.entry(key).or_insert(data).clone())
    }
}

impl ProfileFinalizer for BinarySymbols {
    fn bind(&mut self, handle: SourceHandle) {
        self.handle = Some(handle);
    }

    fn provides(&self) -> ExtensionClass {
        ExtensionClass::CLASSIFICATION
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn classify(&self, ancestor: &Arc<Context>, ns: &mut NestedScope) -> Option<Classified> {
        let Scope::Point { module, offset } = ns.flat().clone() else {
            return None;
        };
        let data = self.data_for(&module)?;
        let func = data.funcs.get(offset)?.clone();
        let h = self.handle.as_ref().expect("finalizer not bound");
        let (_, func_ctx) = h.context(
            ancestor,
            NestedScope::new(ns.relation(), Scope::Function(func)),
        );
        *ns = ns.clone().with_relation(Relation::Enclosure);
        Some(Classified { relation: Some(func_ctx.clone()), flat_parent: func_ctx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_and_lookup() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(
            b"0000000000001000 0000000000000100 T main\n\
              0000000000001100 0000000000000020 t helper\n\
              0000000000002000 0000000000000008 D data\n\
              0000000000003000 0000000000000000 T empty\n",
        )
        .unwrap();
        let mut bs = BinarySymbols::new();
        bs.load(Path::new("/bin/x"), f.path()).unwrap();

        let module = Arc::new(Module::new("/bin/x".into(), None));
        let data = bs.data_for(&module).unwrap();
        assert_eq!(data.funcs.get(0x1050).unwrap().name(), "main");
        assert_eq!(data.funcs.get(0x1110).unwrap().name(), "helper");
        assert!(data.funcs.get(0x2004).is_none(), "data symbols skipped");
        assert!(data.funcs.get(0x3000).is_none(), "zero-sized symbols skipped");

        // Same module resolves to the same cached Functions.
        let again = bs.data_for(&module).unwrap();
        assert!(Arc::ptr_eq(
            data.funcs.get(0x1050).unwrap(),
            again.funcs.get(0x1050).unwrap()
        ));
    }

    #[test]
    fn unknown_module_declines() {
        let bs = BinarySymbols::new();
        let module = Arc::new(Module::new("/bin/other".into(), None));
        assert!(bs.data_for(&module).is_none());
    }
}
