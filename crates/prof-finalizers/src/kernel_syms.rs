//! Classification of kernel-space samples from a kernel symbol map.
//!
//! The map is the usual `kallsyms` shape: one `<address> <type> <name>` line
//! per symbol. Samples landing in a kernel pseudo-module classify to the
//! nearest preceding text symbol.

use dashmap::DashMap;
use prof_model::{Context, ExtensionClass, Function, Module, NestedScope, Scope};
use prof_pipeline::{Classified, ProfileFinalizer, SourceHandle};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KernelSymsError {
    #[error("failed to read kernel symbol map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel symbol map {path} has no text symbols")]
    Empty { path: PathBuf },
}

pub struct KernelSymbols {
    handle: Option<SourceHandle>,
    /// Text symbols sorted by address.
    symbols: Vec<(u64, String)>,
    /// Functions already materialized, per (module, symbol address).
    funcs: DashMap<(usize, u64), Arc<Function>>,
}

impl KernelSymbols {
    pub fn new(path: &Path) -> Result<Self, KernelSymsError> {
        let text = std::fs::read_to_string(path).map_err(|source| KernelSymsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line_re = Regex::new(r"^([0-9a-fA-F]+)\s+([A-Za-z])\s+(\S+)").expect("static regex");
        let mut symbols = Vec::new();
        for line in text.lines() {
            let Some(caps) = line_re.captures(line) else { continue };
            let kind = caps[2].chars().next().unwrap_or('?');
            if !matches!(kind, 'T' | 't' | 'W' | 'w') {
                continue;
            }
            let Ok(addr) = u64::from_str_radix(&caps[1], 16) else { continue };
            symbols.push((addr, caps[3].to_string()));
        }
        if symbols.is_empty() {
            return Err(KernelSymsError::Empty { path: path.to_path_buf() });
        }
        symbols.sort_by_key(|&(addr, _)| addr);
        symbols.dedup_by_key(|&mut (addr, _)| addr);
        Ok(KernelSymbols { handle: None, symbols, funcs: DashMap::new() })
    }

    /// Whether this map applies to the given module.
    fn matches(module: &Module) -> bool {
        let Some(name) = module.path().file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.contains("vmlinux") || name.ends_with(".kallsyms")
    }

    /// The symbol covering `addr`: nearest preceding text symbol.
    fn symbol_at(&self, addr: u64) -> Option<(u64, &str)> {
        let idx = match self.symbols.binary_search_by_key(&addr, |&(a, _)| a) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let (sym_addr, name) = &self.symbols[idx];
        Some((*sym_addr, name))
    }

    fn function_for(&self, module: &Arc<Module>, sym_addr: u64, name: &str) -> Arc<Function> {
        self.funcs
            .entry((Arc::as_ptr(module) as usize, sym_addr))
            .or_insert_with(|| {
                Arc::new(Function::new(module.clone(), name.to_string(), Some(sym_addr), None))
            })
            .clone()
    }
}

impl ProfileFinalizer for KernelSymbols {
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
        if !Self::matches(&module) {
            return None;
        }
        let (sym_addr, name) = self.symbol_at(offset)?;
        let func = self.function_for(&module, sym_addr, name);
        let h = self.handle.as_ref().expect("finalizer not bound");
        let (_, func_ctx) = h.context(
            ancestor,
            NestedScope::new(ns.relation(), Scope::Function(func)),
        );
        *ns = ns.clone().with_relation(prof_model::Relation::Enclosure);
        Some(Classified { relation: Some(func_ctx.clone()), flat_parent: func_ctx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_map(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_text_symbols_only() {
        let f = write_map(
            "ffffffff81000000 T startup_64\n\
             ffffffff81000100 D some_data\n\
             ffffffff81000200 t helper\n\
             bogus line\n",
        );
        let ks = KernelSymbols::new(f.path()).unwrap();
        assert_eq!(ks.symbols.len(), 2);
        assert_eq!(ks.symbol_at(0xffffffff81000250), Some((0xffffffff81000200, "helper")));
        assert_eq!(ks.symbol_at(0xffffffff81000050), Some((0xffffffff81000000, "startup_64")));
        assert_eq!(ks.symbol_at(0x1000), None);
    }

    #[test]
    fn empty_map_is_an_error() {
        let f = write_map("ffffffff81000100 D only_data\n");
        assert!(matches!(
            KernelSymbols::new(f.path()),
            Err(KernelSymsError::Empty { .. })
        ));
    }

    #[test]
    fn module_matching() {
        assert!(KernelSymbols::matches(&Module::new("/boot/vmlinux-6.1".into(), None)));
        assert!(KernelSymbols::matches(&Module::new("/tmp/kernel.kallsyms".into(), None)));
        assert!(!KernelSymbols::matches(&Module::new("/bin/ls".into(), None)));
    }
}
