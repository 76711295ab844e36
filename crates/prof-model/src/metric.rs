//! Metrics, their stored reductions (Partials), derived summaries
//! (Statistics), and the raw accumulators that back them.
//!
//! A Metric is interned by its full Settings record. Until `freeze` it can
//! grow Partials and Statistics through a `StatsAccess`; after freeze its
//! shape is fixed and Sinks may read it without synchronization.

use crate::expression::{Expression, OpKind};
use std::sync::{Mutex, OnceLock};

bitflags::bitflags! {
    /// The set of scopes a Metric's values are reported at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetricScopeSet: u8 {
        /// The exact instruction/location sampled.
        const POINT = 1 << 0;
        /// Inclusive cost of the enclosing calling context.
        const FUNCTION = 1 << 1;
        /// Inclusive within the lexical nest, exclusive across calls.
        const LEX_AWARE = 1 << 2;
        /// Whole-execution aggregate at the global root.
        const EXECUTION = 1 << 3;
    }
}

/// A single reporting scope. Order here fixes the (partial x scope) identifier
/// enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricScope {
    Point,
    Function,
    LexAware,
    Execution,
}

impl MetricScope {
    pub const ALL: [MetricScope; 4] = [
        MetricScope::Point,
        MetricScope::Function,
        MetricScope::LexAware,
        MetricScope::Execution,
    ];

    pub fn bit(self) -> MetricScopeSet {
        match self {
            MetricScope::Point => MetricScopeSet::POINT,
            MetricScope::Function => MetricScopeSet::FUNCTION,
            MetricScope::LexAware => MetricScopeSet::LEX_AWARE,
            MetricScope::Execution => MetricScopeSet::EXECUTION,
        }
    }

    pub fn index(self) -> usize {
        match self {
            MetricScope::Point => 0,
            MetricScope::Function => 1,
            MetricScope::LexAware => 2,
            MetricScope::Execution => 3,
        }
    }
}

impl MetricScopeSet {
    /// Scopes present, in canonical order.
    pub fn members(self) -> impl Iterator<Item = MetricScope> {
        MetricScope::ALL
            .into_iter()
            .filter(move |s| self.contains(s.bit()))
    }
    /// Position of `scope` within this set's canonical enumeration.
    pub fn position(self, scope: MetricScope) -> Option<usize> {
        self.members().position(|s| s == scope)
    }
}

/// Whether a Metric should be surfaced by presentation tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MetricVisibility {
    #[default]
    Shown = 0,
    HiddenByDefault = 1,
    Invisible = 2,
}

/// The interning key for a Metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricSettings {
    pub name: String,
    pub description: String,
    pub scopes: MetricScopeSet,
    pub visibility: MetricVisibility,
    /// Presentation order; metrics without one sort after those with.
    pub order_id: Option<u64>,
}

impl MetricSettings {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        MetricSettings {
            name: name.into(),
            description: description.into(),
            scopes: MetricScopeSet::POINT | MetricScopeSet::FUNCTION | MetricScopeSet::EXECUTION,
            visibility: MetricVisibility::Shown,
            order_id: None,
        }
    }
}

/// How a Partial's primary value combines across samples and threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Combinator {
    Sum = 0,
    Min = 1,
    Max = 2,
}

/// A stored reduction: the accumulate expression transforms each sample's
/// raw value (as `variable(0)`), then the result feeds a raw accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Partial {
    pub combinator: Combinator,
    pub accumulate: Expression,
}

impl Partial {
    /// Variable uservalue for the sample value in accumulate expressions.
    pub const VAL: u64 = 0;

    pub fn apply(&self, sample: f64) -> f64 {
        self.accumulate.evaluate(&|_| sample)
    }
}

/// A derived summary: the finalize expression reads Partial slots by index
/// (`variable(i)` is Partial i's combined value).
#[derive(Debug, Clone, PartialEq)]
pub struct Statistic {
    /// Label appended to the metric name, e.g. "Sum" or "StdDev".
    pub suffix: String,
    /// Render as a percentage of the whole-execution value.
    pub show_percent: bool,
    pub visible_by_default: bool,
    pub finalize: Expression,
}

/// Raw per-Partial accumulator: the five reductions kept for every
/// (Context, Metric, Partial, scope) tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumulatorRaw {
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    pub count: f64,
}

impl Default for AccumulatorRaw {
    fn default() -> Self {
        AccumulatorRaw {
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0.0,
        }
    }
}

impl AccumulatorRaw {
    pub fn add(&mut self, v: f64) {
        self.sum += v;
        self.sum_sq += v * v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1.0;
    }

    /// Merge another accumulator in; commutative and associative.
    pub fn add_raw(&mut self, o: AccumulatorRaw) {
        self.sum += o.sum;
        self.sum_sq += o.sum_sq;
        self.min = self.min.min(o.min);
        self.max = self.max.max(o.max);
        self.count += o.count;
    }

    pub fn is_zero(&self) -> bool {
        self.count == 0.0
    }

    /// The combined value a Statistic reads for a Partial of the given kind.
    pub fn get(&self, c: Combinator) -> f64 {
        match c {
            Combinator::Sum => self.sum,
            Combinator::Min => self.min,
            Combinator::Max => self.max,
        }
    }

    /// A fractional share of this accumulator: the additive components are
    /// scaled, the order statistics pass through.
    pub fn scaled(mut self, factor: f64) -> Self {
        self.sum *= factor;
        self.sum_sq *= factor;
        self.count *= factor;
        self
    }

    pub fn to_array(self) -> [f64; 5] {
        [self.sum, self.sum_sq, self.min, self.max, self.count]
    }

    pub fn from_array(a: [f64; 5]) -> Self {
        AccumulatorRaw { sum: a[0], sum_sq: a[1], min: a[2], max: a[3], count: a[4] }
    }
}

#[derive(Debug, Default)]
struct MetricBuilder {
    partials: Vec<Partial>,
    statistics: Vec<Statistic>,
}

#[derive(Debug)]
struct FrozenMetric {
    partials: Vec<Partial>,
    statistics: Vec<Statistic>,
}

/// Identifier block for a Metric: `max(|partials|, 1) * |scopes|` consecutive
/// ids so Sinks can enumerate (partial x scope) tuples by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricIdentifier {
    base: u32,
    n_partials: u32,
    scopes: MetricScopeSet,
}

impl MetricIdentifier {
    pub fn new(base: u32, n_partials: usize, scopes: MetricScopeSet) -> Self {
        MetricIdentifier { base, n_partials: n_partials.max(1) as u32, scopes }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn block_size(&self) -> u32 {
        self.n_partials * self.scopes.bits().count_ones()
    }

    /// The id of one (partial, scope) tuple within the block.
    pub fn get(&self, partial: usize, scope: MetricScope) -> Option<u32> {
        let pos = self.scopes.position(scope)? as u32;
        let partial = partial as u32;
        debug_assert!(partial < self.n_partials);
        Some(self.base + partial * self.scopes.bits().count_ones() + pos)
    }
}

/// A measurement kind. Interned by Settings; shape frozen before Sinks see it.
pub struct Metric {
    settings: MetricSettings,
    building: Mutex<MetricBuilder>,
    frozen: OnceLock<FrozenMetric>,
    pub(crate) identifier: OnceLock<MetricIdentifier>,
    /// Accumulations route to the relation Context rather than the flat one.
    relation: bool,
}

impl Metric {
    pub fn new(settings: MetricSettings) -> Self {
        Self::with_relation(settings, false)
    }

    pub fn with_relation(settings: MetricSettings, relation: bool) -> Self {
        Metric {
            settings,
            building: Mutex::new(MetricBuilder::default()),
            frozen: OnceLock::new(),
            identifier: OnceLock::new(),
            relation,
        }
    }

    pub fn settings(&self) -> &MetricSettings {
        &self.settings
    }
    pub fn name(&self) -> &str {
        &self.settings.name
    }
    pub fn scopes(&self) -> MetricScopeSet {
        self.settings.scopes
    }
    pub fn is_relation(&self) -> bool {
        self.relation
    }

    /// Fix the Metric's shape. Returns true for the call that performed the
    /// transition; later calls are no-ops.
    pub fn freeze(&self) -> bool {
        let mut b = self.building.lock().expect("metric builder poisoned");
        if self.frozen.get().is_some() {
            return false;
        }
        let built = std::mem::take(&mut *b);
        self.frozen
            .set(FrozenMetric { partials: built.partials, statistics: built.statistics })
            .is_ok()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    pub fn partials(&self) -> &[Partial] {
        &self.frozen.get().expect("Metric read before freeze").partials
    }

    pub fn statistics(&self) -> &[Statistic] {
        &self.frozen.get().expect("Metric read before freeze").statistics
    }

    /// Mutation handle used by Sources and statistics Finalizers. After
    /// freeze the handle still resolves existing Partials but mutations
    /// become no-ops; the shape is fixed.
    pub fn stats_access(&self) -> StatsAccess<'_> {
        StatsAccess { metric: self }
    }

    /// Lazy slot for the `identifier` extension.
    pub fn identifier_cell(&self) -> &OnceLock<MetricIdentifier> {
        &self.identifier
    }
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.settings.name)
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Which standard statistics a Finalizer wants on a Metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatisticsSpec {
    pub sum: bool,
    pub mean: bool,
    pub min: bool,
    pub max: bool,
    pub stddev: bool,
    pub cv: bool,
}

/// Pre-freeze mutation surface for a Metric.
pub struct StatsAccess<'a> {
    metric: &'a Metric,
}

impl StatsAccess<'_> {
    /// Ensure a Partial exists, returning its slot index.
    pub fn request_partial(&self, combinator: Combinator, accumulate: Expression) -> usize {
        let mut b = self.metric.building.lock().expect("metric builder poisoned");
        if let Some(frozen) = self.metric.frozen.get() {
            // The shape is fixed; resolve against the frozen Partials.
            return frozen
                .partials
                .iter()
                .position(|p| p.combinator == combinator && p.accumulate == accumulate)
                .unwrap_or(0);
        }
        if let Some(i) = b
            .partials
            .iter()
            .position(|p| p.combinator == combinator && p.accumulate == accumulate)
        {
            return i;
        }
        b.partials.push(Partial { combinator, accumulate });
        b.partials.len() - 1
    }

    /// The plain running-sum Partial; the one every consumer needs.
    pub fn request_sum_partial(&self) -> usize {
        self.request_partial(Combinator::Sum, Expression::variable(Partial::VAL))
    }

    pub fn push_statistic(&self, s: Statistic) {
        let mut b = self.metric.building.lock().expect("metric builder poisoned");
        if self.metric.frozen.get().is_some() {
            return;
        }
        if !b.statistics.iter().any(|x| x.suffix == s.suffix) {
            b.statistics.push(s);
        }
    }

    /// Materialize the requested standard statistics, creating the Partials
    /// they depend on.
    pub fn request_statistics(&self, spec: StatisticsSpec) {
        let x = || Expression::variable(Partial::VAL);
        let xx = || Expression::op(OpKind::Prod, vec![x(), x()]);
        let one = || Expression::constant(1.0);

        let p_sum = if spec.sum || spec.mean || spec.stddev || spec.cv {
            Some(self.request_partial(Combinator::Sum, x()))
        } else {
            None
        };
        let p_cnt = if spec.mean || spec.stddev || spec.cv {
            Some(self.request_partial(Combinator::Sum, one()))
        } else {
            None
        };
        let p_sq = if spec.stddev || spec.cv {
            Some(self.request_partial(Combinator::Sum, xx()))
        } else {
            None
        };

        let var = |i: usize| Expression::variable(i as u64);
        let mean_of = |p_sum: usize, p_cnt: usize| {
            Expression::op(OpKind::Div, vec![var(p_sum), var(p_cnt)])
        };
        let stddev_of = |p_sum: usize, p_sq: usize, p_cnt: usize| {
            Expression::op(
                OpKind::Sqrt,
                vec![Expression::op(
                    OpKind::Sub,
                    vec![
                        Expression::op(OpKind::Div, vec![var(p_sq), var(p_cnt)]),
                        Expression::op(
                            OpKind::Pow,
                            vec![mean_of(p_sum, p_cnt), Expression::constant(2.0)],
                        ),
                    ],
                )],
            )
        };

        if spec.sum {
            self.push_statistic(Statistic {
                suffix: "Sum".into(),
                show_percent: true,
                visible_by_default: true,
                finalize: var(p_sum.unwrap()),
            });
        }
        if spec.mean {
            self.push_statistic(Statistic {
                suffix: "Mean".into(),
                show_percent: false,
                visible_by_default: false,
                finalize: mean_of(p_sum.unwrap(), p_cnt.unwrap()),
            });
        }
        if spec.min {
            let p = self.request_partial(Combinator::Min, x());
            self.push_statistic(Statistic {
                suffix: "Min".into(),
                show_percent: false,
                visible_by_default: false,
                finalize: var(p),
            });
        }
        if spec.max {
            let p = self.request_partial(Combinator::Max, x());
            self.push_statistic(Statistic {
                suffix: "Max".into(),
                show_percent: false,
                visible_by_default: false,
                finalize: var(p),
            });
        }
        if spec.stddev {
            self.push_statistic(Statistic {
                suffix: "StdDev".into(),
                show_percent: false,
                visible_by_default: false,
                finalize: stddev_of(p_sum.unwrap(), p_sq.unwrap(), p_cnt.unwrap()),
            });
        }
        if spec.cv {
            self.push_statistic(Statistic {
                suffix: "CfVar".into(),
                show_percent: false,
                visible_by_default: false,
                finalize: Expression::op(
                    OpKind::Div,
                    vec![
                        stddev_of(p_sum.unwrap(), p_sq.unwrap(), p_cnt.unwrap()),
                        mean_of(p_sum.unwrap(), p_cnt.unwrap()),
                    ],
                ),
            });
        }
    }
}

/// A purely derived metric-like value; its formula references Metrics by
/// index into `metrics`. Emitted only through the taxonomy sink.
#[derive(Debug)]
pub struct ExtraStatistic {
    pub name: String,
    pub description: String,
    pub scopes: MetricScopeSet,
    pub show_percent: bool,
    /// Variables are indices into `metrics`.
    pub formula: Expression,
    pub metrics: Vec<std::sync::Arc<Metric>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_is_sticky_and_exclusive() {
        let m = Metric::new(MetricSettings::new("M", ""));
        m.stats_access().request_sum_partial();
        assert!(m.freeze());
        assert!(!m.freeze());
        assert_eq!(m.partials().len(), 1);
    }

    #[test]
    fn partial_dedup() {
        let m = Metric::new(MetricSettings::new("M", ""));
        let a = m.stats_access().request_sum_partial();
        let b = m.stats_access().request_sum_partial();
        assert_eq!(a, b);
        let c = m
            .stats_access()
            .request_partial(Combinator::Min, Expression::variable(Partial::VAL));
        assert_ne!(a, c);
    }

    #[test]
    fn accumulator_merge_matches_direct() {
        let mut direct = AccumulatorRaw::default();
        for v in [1.0, 4.0, 2.0, 2.0] {
            direct.add(v);
        }
        let mut left = AccumulatorRaw::default();
        let mut right = AccumulatorRaw::default();
        left.add(1.0);
        left.add(4.0);
        right.add(2.0);
        right.add(2.0);
        left.add_raw(right);
        assert_eq!(left, direct);
        assert_eq!(direct.get(Combinator::Sum), 9.0);
        assert_eq!(direct.get(Combinator::Min), 1.0);
        assert_eq!(direct.get(Combinator::Max), 4.0);
    }

    #[test]
    fn standard_statistics_compose() {
        let m = Metric::new(MetricSettings::new("M", ""));
        m.stats_access().request_statistics(StatisticsSpec {
            sum: true,
            mean: true,
            stddev: true,
            ..Default::default()
        });
        m.freeze();
        // sum, count, sumsq
        assert_eq!(m.partials().len(), 3);
        assert_eq!(m.statistics().len(), 3);

        let mut acc: Vec<AccumulatorRaw> =
            m.partials().iter().map(|_| AccumulatorRaw::default()).collect();
        for v in [1.0, 1.0, 3.0, 3.0] {
            for (p, a) in m.partials().iter().zip(acc.iter_mut()) {
                a.add(p.apply(v));
            }
        }
        let env = |u: u64| {
            let i = u as usize;
            acc[i].get(m.partials()[i].combinator)
        };
        let by_suffix = |s: &str| {
            m.statistics()
                .iter()
                .find(|st| st.suffix == s)
                .unwrap()
                .finalize
                .evaluate(&env)
        };
        assert_eq!(by_suffix("Sum"), 8.0);
        assert_eq!(by_suffix("Mean"), 2.0);
        assert!((by_suffix("StdDev") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identifier_blocks() {
        let scopes = MetricScopeSet::POINT | MetricScopeSet::EXECUTION;
        let id = MetricIdentifier::new(10, 2, scopes);
        assert_eq!(id.block_size(), 4);
        assert_eq!(id.get(0, MetricScope::Point), Some(10));
        assert_eq!(id.get(0, MetricScope::Execution), Some(11));
        assert_eq!(id.get(1, MetricScope::Point), Some(12));
        assert_eq!(id.get(1, MetricScope::Execution), Some(13));
        assert_eq!(id.get(0, MetricScope::Function), None);
    }
}
