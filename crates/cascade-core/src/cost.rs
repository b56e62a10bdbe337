//! # Cost Model
//!
//! A plan's cost is its local operator cost plus the accumulated costs of its children.
//! The engine calls [`CostModel::compute_cost`] exactly once per cost context, i.e. once
//! per (physical group expression, optimization context) pair, so implementations must be
//! pure and deterministic.
//!
//! `DefaultCostModel` collapses three dimensions into one comparable number:
//!
//! ```text
//! total = cpu_weight * cpu + memory_weight * memory + network_weight * network
//! ```
//!
//! Network is weighted highest (10x) since shuffling dominates distributed execution.

use crate::expr::*;
use crate::properties::PhysicalPropertySet;
use crate::stats::{Statistics, DEFAULT_ROW_COUNT, DEFAULT_ROW_WIDTH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Single comparable plan cost. Lower is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    /// `f64::MAX` means infeasible / not yet costed.
    pub total: f64,
}

impl Cost {
    pub fn zero() -> Self {
        Self { total: 0.0 }
    }

    pub fn new(total: f64) -> Self {
        Self { total }
    }

    pub fn infinite() -> Self {
        Self { total: f64::MAX }
    }

    pub fn is_infinite(&self) -> bool {
        self.total == f64::MAX
    }
}

/// Epsilon-based equality to absorb floating-point noise.
impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        (self.total - other.total).abs() < f64::EPSILON
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total.partial_cmp(&other.total)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("inf")
        } else {
            write!(f, "{:.1}", self.total)
        }
    }
}

/// Pluggable cost model.
///
/// `input_stats` are the statistics of the operator's child groups; for a leaf operator
/// it holds the statistics of the operator's own group instead.
///
/// A returned cost must never be below the sum of `children_costs`. The engine relies on
/// that bound to prune alternatives before costing them.
pub trait CostModel: Send + Sync {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        input_stats: &[&Statistics],
        children_costs: &[Cost],
        required_props: &PhysicalPropertySet,
    ) -> Cost;
}

/// Weighted CPU / memory / network cost model.
pub struct DefaultCostModel {
    pub cpu_weight: f64,
    pub memory_weight: f64,
    pub network_weight: f64,
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self {
            cpu_weight: 1.0,
            memory_weight: 1.0,
            network_weight: 10.0,
        }
    }
}

impl DefaultCostModel {
    fn rows(input_stats: &[&Statistics], idx: usize) -> f64 {
        input_stats.get(idx).map(|s| s.row_count).unwrap_or(DEFAULT_ROW_COUNT)
    }

    fn two_inputs<'a>(input_stats: &[&'a Statistics]) -> Option<(&'a Statistics, &'a Statistics)> {
        Some((*input_stats.first()?, *input_stats.get(1)?))
    }
}

impl CostModel for DefaultCostModel {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        input_stats: &[&Statistics],
        children_costs: &[Cost],
        _required_props: &PhysicalPropertySet,
    ) -> Cost {
        let children_total: f64 = children_costs.iter().map(|c| c.total).sum();
        let rows = Self::rows(input_stats, 0);

        let local_cost = match op {
            PhysicalOp::SeqScan { .. } => self.cpu_weight * rows,
            // one predicate evaluation per input row
            PhysicalOp::Filter { .. } => self.cpu_weight * rows * 0.1,
            PhysicalOp::Projection { exprs, .. } => self.cpu_weight * rows * 0.01 * exprs.len().max(1) as f64,
            PhysicalOp::Limit { offset, count } => self.cpu_weight * rows.min((offset + count) as f64) * 0.01,
            // build: hash + store the build side; probe: one lookup per probe row
            PhysicalOp::HashJoin { build_side, .. } => {
                let Some((left, right)) = Self::two_inputs(input_stats) else {
                    return Cost::new(children_total + DEFAULT_ROW_COUNT);
                };
                let (build, probe) = match build_side {
                    BuildSide::Left => (left, right),
                    BuildSide::Right => (right, left),
                };
                self.cpu_weight * build.row_count
                    + self.memory_weight * build.total_size_bytes
                    + self.cpu_weight * probe.row_count
            }
            PhysicalOp::MergeJoin { .. } => {
                let Some((left, right)) = Self::two_inputs(input_stats) else {
                    return Cost::new(children_total + DEFAULT_ROW_COUNT);
                };
                self.cpu_weight * (left.row_count + right.row_count)
            }
            PhysicalOp::NestedLoopJoin { .. } => {
                let Some((left, right)) = Self::two_inputs(input_stats) else {
                    return Cost::new(children_total + DEFAULT_ROW_COUNT);
                };
                self.cpu_weight * left.row_count * right.row_count
            }
            PhysicalOp::HashAggregate { .. } => {
                self.cpu_weight * rows + self.memory_weight * rows * DEFAULT_ROW_WIDTH
            }
            PhysicalOp::StreamAggregate { .. } => self.cpu_weight * rows,
            PhysicalOp::SortOp { .. } => {
                let n_log_n = if rows > 1.0 { rows * rows.log2() } else { 1.0 };
                self.cpu_weight * n_log_n + self.memory_weight * rows * DEFAULT_ROW_WIDTH
            }
            PhysicalOp::Exchange { .. } => {
                let size = input_stats
                    .first()
                    .map(|s| s.total_size_bytes)
                    .unwrap_or(rows * DEFAULT_ROW_WIDTH);
                self.network_weight * size
            }
            // materialize once, then rescans are cheap
            PhysicalOp::Spool => {
                let size = input_stats
                    .first()
                    .map(|s| s.total_size_bytes)
                    .unwrap_or(rows * DEFAULT_ROW_WIDTH);
                self.cpu_weight * rows + self.memory_weight * size
            }
        };

        Cost::new(children_total + local_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statistics;

    fn hash_join(build_side: BuildSide) -> PhysicalOp {
        PhysicalOp::HashJoin {
            join_type: JoinType::Inner,
            build_side,
            condition: Expr::Literal(ScalarValue::Bool(true)),
        }
    }

    #[test]
    fn test_hash_join_prefers_small_build_side() {
        let model = DefaultCostModel::default();
        let small = Statistics::new(100.0, 10000.0);
        let large = Statistics::new(1_000_000.0, 100_000_000.0);
        let zero = [Cost::zero(), Cost::zero()];
        let any = PhysicalPropertySet::any();

        let small_build = model.compute_cost(&hash_join(BuildSide::Left), &[&small, &large], &zero, &any);
        let large_build = model.compute_cost(&hash_join(BuildSide::Right), &[&small, &large], &zero, &any);
        assert!(small_build < large_build);
    }

    #[test]
    fn test_costs_accumulate_children() {
        let model = DefaultCostModel::default();
        let stats = Statistics::new(10.0, 1000.0);
        let filter = PhysicalOp::Filter {
            predicate: Expr::Literal(ScalarValue::Bool(true)),
        };
        let cost = model.compute_cost(&filter, &[&stats], &[Cost::new(50.0)], &PhysicalPropertySet::any());
        assert!((cost.total - 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_display() {
        assert_eq!(Cost::new(12.345).to_string(), "12.3");
        assert_eq!(Cost::infinite().to_string(), "inf");
    }
}
