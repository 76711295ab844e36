//! Bitmask classification of the kinds of data a pipeline moves around.
//!
//! `DataClass` names the raw data families Sources emit and Sinks absorb;
//! `ExtensionClass` names the derived annotations Finalizers can layer on
//! top. Both are small bitsets and are passed around by value everywhere.

use std::fmt;

bitflags::bitflags! {
    /// Classes of raw profile data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DataClass: u8 {
        /// The execution context of the profile itself.
        const ATTRIBUTES = 1 << 0;
        /// Execution contexts for each thread within the profile.
        const THREADS = 1 << 1;
        /// References to the outside filesystem (modules and files).
        const REFERENCES = 1 << 2;
        /// The individual measurement values.
        const METRICS = 1 << 3;
        /// The locations in which data was gathered.
        const CONTEXTS = 1 << 4;
        /// Locations over time.
        const CTX_TIMEPOINTS = 1 << 5;
        /// Measurement values over time.
        const METRIC_TIMEPOINTS = 1 << 6;
    }
}

impl DataClass {
    pub fn has_any(self) -> bool {
        !self.is_empty()
    }
    pub fn has_attributes(self) -> bool {
        self.contains(DataClass::ATTRIBUTES)
    }
    pub fn has_threads(self) -> bool {
        self.contains(DataClass::THREADS)
    }
    pub fn has_references(self) -> bool {
        self.contains(DataClass::REFERENCES)
    }
    pub fn has_metrics(self) -> bool {
        self.contains(DataClass::METRICS)
    }
    pub fn has_contexts(self) -> bool {
        self.contains(DataClass::CONTEXTS)
    }
    pub fn has_ctx_timepoints(self) -> bool {
        self.contains(DataClass::CTX_TIMEPOINTS)
    }
    pub fn has_metric_timepoints(self) -> bool {
        self.contains(DataClass::METRIC_TIMEPOINTS)
    }

    /// True when the intersection with `other` is nonempty.
    pub fn any_of(self, other: DataClass) -> bool {
        self.intersects(other)
    }
    /// True when `other` is a subset of `self`.
    pub fn all_of(self, other: DataClass) -> bool {
        self.contains(other)
    }

    /// The wavefront-capable subset: everything that can be delivered early.
    pub fn waveable() -> DataClass {
        DataClass::ATTRIBUTES | DataClass::REFERENCES | DataClass::THREADS | DataClass::CONTEXTS
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.has_attributes() {
            write!(f, "A")?;
        }
        if self.has_threads() {
            write!(f, "T")?;
        }
        if self.has_references() {
            write!(f, "R")?;
        }
        if self.has_contexts() {
            write!(f, "C")?;
        }
        let front = DataClass::ATTRIBUTES
            | DataClass::THREADS
            | DataClass::REFERENCES
            | DataClass::CONTEXTS;
        let back =
            DataClass::METRICS | DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS;
        if self.any_of(front) && self.any_of(back) {
            write!(f, " ")?;
        }
        if self.has_metrics() {
            write!(f, "m")?;
        }
        if self.has_ctx_timepoints() {
            write!(f, "t")?;
        }
        if self.has_metric_timepoints() {
            write!(f, "v")?;
        }
        write!(f, "]")
    }
}

bitflags::bitflags! {
    /// Classes of derived data Finalizers can extend the raw data with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ExtensionClass: u8 {
        /// Expands point scopes with source-level structure.
        const CLASSIFICATION = 1 << 0;
        /// Unique numerical identifiers for most entities.
        const IDENTIFIER = 1 << 1;
        /// An approximation of the corresponding file on the current
        /// filesystem. Empty when the file is certainly not present;
        /// otherwise absolute but not necessarily existing.
        const RESOLVED_PATH = 1 << 2;
        /// Additional Statistics on Metrics for summary analysis.
        const STATISTICS = 1 << 3;
    }
}

impl ExtensionClass {
    pub fn has_any(self) -> bool {
        !self.is_empty()
    }
    pub fn has_classification(self) -> bool {
        self.contains(ExtensionClass::CLASSIFICATION)
    }
    pub fn has_identifier(self) -> bool {
        self.contains(ExtensionClass::IDENTIFIER)
    }
    pub fn has_resolved_path(self) -> bool {
        self.contains(ExtensionClass::RESOLVED_PATH)
    }
    pub fn has_statistics(self) -> bool {
        self.contains(ExtensionClass::STATISTICS)
    }
    pub fn any_of(self, other: ExtensionClass) -> bool {
        self.intersects(other)
    }
    pub fn all_of(self, other: ExtensionClass) -> bool {
        self.contains(other)
    }
}

impl fmt::Display for ExtensionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.has_identifier() {
            write!(f, "i")?;
        }
        if self.has_statistics() {
            write!(f, "s")?;
        }
        if self.any_of(ExtensionClass::IDENTIFIER | ExtensionClass::STATISTICS)
            && self.any_of(ExtensionClass::CLASSIFICATION | ExtensionClass::RESOLVED_PATH)
        {
            write!(f, " ")?;
        }
        if self.has_classification() {
            write!(f, "c")?;
        }
        if self.has_resolved_path() {
            write!(f, "r")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_algebra() {
        let a = DataClass::ATTRIBUTES | DataClass::THREADS;
        let b = DataClass::THREADS | DataClass::METRICS;
        assert_eq!(a & b, DataClass::THREADS);
        assert_eq!(a - b, DataClass::ATTRIBUTES);
        assert!(a.any_of(b));
        assert!(!a.all_of(b));
        assert!((a | b).all_of(a));
        assert!(!DataClass::empty().has_any());
    }

    #[test]
    fn display_compact() {
        let d = DataClass::ATTRIBUTES | DataClass::CONTEXTS | DataClass::METRICS;
        assert_eq!(format!("{d}"), "[AC m]");
        let e = ExtensionClass::IDENTIFIER | ExtensionClass::CLASSIFICATION;
        assert_eq!(format!("{e}"), "[i c]");
    }

    #[test]
    fn waveable_excludes_late_classes() {
        assert!(!DataClass::waveable().any_of(
            DataClass::METRICS | DataClass::CTX_TIMEPOINTS | DataClass::METRIC_TIMEPOINTS
        ));
    }
}
