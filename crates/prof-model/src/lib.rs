//! Shared data model for the profile-analysis pipeline.
//!
//! Everything here is the concurrent, long-lived state the pipeline and its
//! collaborators exchange: the calling-context tree, metrics and their
//! accumulators, flow graphs and reconstructions, thread identities, and the
//! transient per-thread staging used during ingest. The orchestration logic
//! lives in `prof-pipeline`.

pub mod attributes;
pub mod context;
pub mod dataclass;
pub mod expression;
pub mod graph;
pub mod metric;
pub mod module;
pub mod per_thread;
pub mod scope;
pub mod stores;
pub mod timepoints;
pub mod util;

pub use attributes::{IdTuple, IdTupleEntry, ProfileAttributes, Thread, ThreadAttributes};
pub use context::{Context, ContextData, MetricAccumulator};
pub use dataclass::{DataClass, ExtensionClass};
pub use expression::{Expression, OpKind};
pub use graph::{
    ContextFlowGraph, ContextReconstruction, MetricHandler, MetricHandling, Template,
};
pub use metric::{
    AccumulatorRaw, Combinator, ExtraStatistic, Metric, MetricIdentifier, MetricScope,
    MetricScopeSet, MetricSettings, MetricVisibility, Partial, StatsAccess, Statistic,
    StatisticsSpec,
};
pub use module::{File, Function, Module};
pub use per_thread::{MetricValues, PerThreadTemporary, ReconstructionGroup};
pub use scope::{NestedScope, Relation, Scope, ScopeType};
pub use stores::{Registry, UniquedSet};
pub use timepoints::{
    CtxTimepoint, FALLBACK_DISORDER, MetricTimepoint, Ns, STAGING_FLUSH, SortBuf, Timestamped,
    TimepointsData,
};
pub use util::ByPtr;
