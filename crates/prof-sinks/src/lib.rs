//! Output sinks: the on-disk database writers and the byte-packing family
//! used for cross-rank reduction.

pub mod meta_db;
pub mod metrics_yaml;
pub mod packed;
pub mod sparse_db;
pub mod tree;

pub use meta_db::MetaDB;
pub use metrics_yaml::MetricsYaml;
pub use packed::{IdPacker, PackedHandler, Packer};
pub use sparse_db::SparseDB;
pub use tree::{MetricSender, TreeSender};
