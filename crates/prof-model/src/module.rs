//! Filesystem references: load modules, source files, and the functions
//! within a module.
//!
//! Modules and Files are interned by path in the pipeline's uniquing stores
//! and handed out as `Arc`s; identity comparisons throughout the engine are
//! by pointer, never by re-hashing the path. Functions are not interned:
//! two functions with the same name are distinguished by entry offset.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// A binary (load module) referenced by the profile.
pub struct Module {
    path: PathBuf,
    /// Path relative to the measurement directory, when one was recorded.
    relative_path: Option<PathBuf>,
    pub(crate) identifier: OnceLock<u32>,
    pub(crate) resolved_path: OnceLock<PathBuf>,
    /// Slot for classifier-attached data (function tables, call graphs).
    classification: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Module {
    pub fn new(path: PathBuf, relative_path: Option<PathBuf>) -> Self {
        Module {
            path,
            relative_path,
            identifier: OnceLock::new(),
            resolved_path: OnceLock::new(),
            classification: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn relative_path(&self) -> Option<&Path> {
        self.relative_path.as_deref()
    }

    /// Lazy slot for the `identifier` extension.
    pub fn identifier_cell(&self) -> &OnceLock<u32> {
        &self.identifier
    }

    /// Lazy slot for the `resolvedPath` extension.
    pub fn resolved_path_cell(&self) -> &OnceLock<PathBuf> {
        &self.resolved_path
    }

    /// Attach classifier data. The first caller wins; later calls return the
    /// value back so the caller can drop it.
    pub fn set_classification<T: Any + Send + Sync>(&self, data: T) -> Result<(), T> {
        let mut holder = Some(data);
        let _ = self
            .classification
            .get_or_init(|| Box::new(holder.take().unwrap()));
        match holder {
            None => Ok(()),
            Some(data) => Err(data),
        }
    }

    pub fn classification<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.classification.get()?.downcast_ref()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("path", &self.path).finish()
    }
}

/// A source file referenced by the profile.
#[derive(Debug)]
pub struct File {
    path: PathBuf,
    pub(crate) identifier: OnceLock<u32>,
    pub(crate) resolved_path: OnceLock<PathBuf>,
}

impl File {
    pub fn new(path: PathBuf) -> Self {
        File {
            path,
            identifier: OnceLock::new(),
            resolved_path: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identifier_cell(&self) -> &OnceLock<u32> {
        &self.identifier
    }

    pub fn resolved_path_cell(&self) -> &OnceLock<PathBuf> {
        &self.resolved_path
    }
}

/// A function within a Module. Belongs to exactly one Module.
#[derive(Debug)]
pub struct Function {
    module: Arc<Module>,
    name: String,
    /// Offset of the entry instruction within the module, when known.
    entry: Option<u64>,
    /// Defining source location, when known.
    source: Option<(Arc<File>, u32)>,
}

impl Function {
    pub fn new(
        module: Arc<Module>,
        name: String,
        entry: Option<u64>,
        source: Option<(Arc<File>, u32)>,
    ) -> Self {
        Function {
            module,
            name,
            entry,
            source,
        }
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn entry(&self) -> Option<u64> {
        self.entry
    }
    pub fn source(&self) -> Option<(&Arc<File>, u32)> {
        self.source.as_ref().map(|(f, l)| (f, *l))
    }
}
