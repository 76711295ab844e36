//! The contract for profile-data producers.

use crate::handles::SourceHandle;
use prof_model::DataClass;
use std::path::PathBuf;

/// Errors a Source can hit while reading its measurement unit. These are
/// recoverable at the pipeline level: the offending Source's remaining
/// contribution is dropped, everything already emitted is kept.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("malformed measurement data: {0}")]
    Parse(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A producer of profile data. One Source reads one measurement unit and
/// emits data-model objects through its bound `SourceHandle`.
///
/// The handle passed to `bind` must not be used until the pipeline runs.
pub trait ProfileSource: Send {
    /// Bind this Source to a pipeline. Called exactly once, before the run.
    fn bind(&mut self, handle: SourceHandle);

    /// The DataClasses this Source can emit. Must be stable.
    fn provides(&self) -> DataClass;

    /// Expand `requested` with whatever else must be read at the same time
    /// to satisfy dependencies internal to this Source's format. Pure.
    fn finalize_request(&self, requested: DataClass) -> DataClass;

    /// Read and emit all data in `needed`. Called under the Source's lock;
    /// `needed` never overlaps previous calls.
    fn read(&mut self, needed: DataClass) -> Result<(), SourceError>;
}
