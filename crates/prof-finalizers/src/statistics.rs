//! The standard summary statistics, appended to every Metric.

use prof_model::{ExtensionClass, Metric, StatsAccess, StatisticsSpec};
use prof_pipeline::{ProfileFinalizer, SourceHandle};
use std::sync::Arc;

/// Statistics finalizer requesting a fixed set of summaries. Runs on every
/// Metric alongside any other statistics providers.
pub struct StandardStatistics {
    spec: StatisticsSpec,
}

impl StandardStatistics {
    pub fn new(spec: StatisticsSpec) -> Self {
        StandardStatistics { spec }
    }

    /// The usual full set: sum, mean, min, max, stddev, cv.
    pub fn full() -> Self {
        StandardStatistics {
            spec: StatisticsSpec {
                sum: true,
                mean: true,
                min: true,
                max: true,
                stddev: true,
                cv: true,
            },
        }
    }
}

impl ProfileFinalizer for StandardStatistics {
    fn bind(&mut self, _handle: SourceHandle) {}

    fn provides(&self) -> ExtensionClass {
        ExtensionClass::STATISTICS
    }
    fn requirements(&self) -> ExtensionClass {
        ExtensionClass::empty()
    }

    fn append_statistics(&self, _m: &Arc<Metric>, stats: StatsAccess<'_>) {
        stats.request_statistics(self.spec);
    }
}
