//! The profile-analysis pipeline orchestrator.
//!
//! Sources push observations in, the pipeline merges and uniquifies them
//! into the shared data model, Finalizers lazily compute extensions on
//! first access, and Sinks pull the merged state and write output
//! artifacts. A staged wavefront schedule lets Sinks prepare output
//! skeletons before all data has arrived.
//!
//! Scheduling is plain blocking threads: a fixed worker team pulls work
//! from dynamic schedules with explicit barriers between the phases.

pub mod finalizer;
pub mod handles;
pub mod pipeline;
pub mod settings;
pub mod sink;
pub mod source;
pub mod work;

pub use finalizer::{Classified, ProfileFinalizer};
pub use handles::{AccumulatorsRef, OrderedGuard, SinkHandle, SourceHandle};
pub use pipeline::{PipelineError, ProfilePipeline, TimepointStatus};
pub use settings::{PipelineBuilder, SinkOptions};
pub use sink::ProfileSink;
pub use source::{ProfileSource, SourceError};
pub use work::{OnceSignal, Workshare, WorkshareResult};
