//! Input sources: the native measurement reader and the byte-packed
//! replay family used for cross-rank reduction.

pub mod packed;
pub mod sample_file;
pub mod tree;

pub use packed::{BlobSource, IdMaps, IdTracker, IdUnpacker, Unpacker};
pub use sample_file::SampleFile;
pub use tree::{MetricReceiver, Receiver};
