//! Concrete Finalizers: dense identifier allocation and the classification
//! providers (structure files, binary symbol tables, kernel symbol maps).

pub mod dense_ids;
pub mod kernel_syms;
pub mod range_map;
pub mod statistics;
pub mod struct_file;
pub mod symbols;

pub use dense_ids::DenseIds;
pub use kernel_syms::{KernelSymbols, KernelSymsError};
pub use range_map::RangeMap;
pub use statistics::StandardStatistics;
pub use struct_file::{StructFile, StructFileError};
pub use symbols::{BinarySymbols, SymbolsError};
