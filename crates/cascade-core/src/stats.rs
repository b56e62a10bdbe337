//! # Statistics
//!
//! Cardinality and size estimates attached to memo groups. A group's statistics are
//! derived at most once, from its first logical expression and the statistics of that
//! expression's child groups (see `Group::derive_stats_recursive`). The derivation itself
//! is pluggable through [`StatsDerivation`].
//!
//! ## Formulas used by [`DefaultStatsDerivation`]
//!
//! - **Scan**: catalog statistics, then the pushed-down predicate if any.
//! - **Filter**: `rows = input_rows * selectivity`; column NDVs scale by the same ratio.
//! - **Join**: `rows = |L| * |R| / max(NDV(L.key), NDV(R.key))` per equi-join key pair.
//! - **Aggregate**: product of group-by NDVs, capped by the input row count.
//! - **Limit**: `min(input_rows, count)`.
//! - **Project / Sort**: input statistics unchanged.
//!
//! Selectivity heuristics: equality `1 / NDV`, range `1/3`, conjunction multiplies,
//! disjunction uses inclusion-exclusion, anything else `0.1`.

use crate::catalog::Catalog;
use crate::expr::{BinaryOp, Expr, JoinType, LogicalOp, Operator, ScalarValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Row count used when nothing better is known.
pub const DEFAULT_ROW_COUNT: f64 = 1000.0;
/// Bytes per row used when nothing better is known.
pub const DEFAULT_ROW_WIDTH: f64 = 100.0;

/// Statistics for a relation (or group in the memo).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub row_count: f64,
    pub total_size_bytes: f64,
    pub column_stats: HashMap<String, ColumnStatistics>,
}

impl Statistics {
    pub fn new(row_count: f64, total_size_bytes: f64) -> Self {
        Self {
            row_count,
            total_size_bytes,
            column_stats: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, stats: ColumnStatistics) -> Self {
        self.column_stats.insert(name.into(), stats);
        self
    }

    /// Placeholder for relations without catalog statistics.
    pub fn unknown() -> Self {
        Self::new(DEFAULT_ROW_COUNT, DEFAULT_ROW_COUNT * DEFAULT_ROW_WIDTH)
    }

    pub fn avg_row_width(&self) -> f64 {
        if self.row_count > 0.0 {
            self.total_size_bytes / self.row_count
        } else {
            DEFAULT_ROW_WIDTH
        }
    }
}

/// Per-column statistics, typically gathered by `ANALYZE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    /// Number of distinct values (NDV).
    pub distinct_count: f64,
    /// Fraction of NULLs in [0.0, 1.0].
    pub null_fraction: f64,
    pub min_value: Option<ScalarValue>,
    pub max_value: Option<ScalarValue>,
    pub avg_row_size: f64,
    pub histogram: Option<Histogram>,
}

impl ColumnStatistics {
    pub fn new(distinct_count: f64, null_fraction: f64) -> Self {
        Self {
            distinct_count,
            null_fraction,
            min_value: None,
            max_value: None,
            avg_row_size: 8.0,
            histogram: None,
        }
    }
}

/// Equi-depth histogram: every bucket holds roughly the same number of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    /// Inclusive bounds.
    pub lower: f64,
    pub upper: f64,
    pub count: f64,
    pub distinct: f64,
}

/// Join output statistics for the given equi-join column pairs.
///
/// Multi-column keys multiply their selectivities (independence assumption). A missing
/// NDV falls back to the relation's row count, i.e. all values distinct.
pub fn derive_join_stats(left: &Statistics, right: &Statistics, join_columns: &[(String, String)]) -> Statistics {
    let mut selectivity = 1.0_f64;
    for (left_col, right_col) in join_columns {
        let left_ndv = left
            .column_stats
            .get(left_col)
            .map(|s| s.distinct_count)
            .unwrap_or(left.row_count);
        let right_ndv = right
            .column_stats
            .get(right_col)
            .map(|s| s.distinct_count)
            .unwrap_or(right.row_count);
        selectivity /= left_ndv.max(right_ndv).max(1.0);
    }

    let row_count = (left.row_count * right.row_count * selectivity).max(1.0);
    let total_size_bytes = row_count * (left.avg_row_width() + right.avg_row_width());

    // NDV cannot exceed the output row count
    let column_stats = left
        .column_stats
        .iter()
        .chain(right.column_stats.iter())
        .map(|(name, stats)| {
            let mut cs = stats.clone();
            cs.distinct_count = cs.distinct_count.min(row_count);
            (name.clone(), cs)
        })
        .collect();

    Statistics {
        row_count,
        total_size_bytes,
        column_stats,
    }
}

/// Filter output statistics; column NDVs shrink with the row reduction ratio.
pub fn derive_filter_stats(input: &Statistics, selectivity: f64) -> Statistics {
    let row_count = (input.row_count * selectivity).max(1.0);
    let ratio = if input.row_count > 0.0 {
        row_count / input.row_count
    } else {
        1.0
    };

    let column_stats = input
        .column_stats
        .iter()
        .map(|(name, stats)| {
            let mut cs = stats.clone();
            cs.distinct_count = (cs.distinct_count * ratio).max(1.0).min(row_count);
            (name.clone(), cs)
        })
        .collect();

    Statistics {
        row_count,
        total_size_bytes: input.total_size_bytes * ratio,
        column_stats,
    }
}

/// Aggregate output statistics. A global aggregate yields one row.
pub fn derive_aggregate_stats(input: &Statistics, group_by_cols: &[String]) -> Statistics {
    let row_count = group_by_cols
        .iter()
        .map(|col| {
            input
                .column_stats
                .get(col)
                .map(|s| s.distinct_count)
                .unwrap_or(input.row_count)
        })
        .product::<f64>()
        .min(input.row_count)
        .max(1.0);

    Statistics {
        row_count,
        total_size_bytes: row_count * DEFAULT_ROW_WIDTH,
        column_stats: HashMap::new(),
    }
}

/// Default filter selectivity when we can't determine it.
pub const DEFAULT_FILTER_SELECTIVITY: f64 = 0.1;

/// Selectivity of a range comparison.
pub const RANGE_SELECTIVITY: f64 = 0.33;

/// `1 / NDV`, or the default selectivity without column statistics.
pub fn equality_selectivity(stats: &Statistics, col_name: &str) -> f64 {
    stats
        .column_stats
        .get(col_name)
        .map(|cs| 1.0 / cs.distinct_count.max(1.0))
        .unwrap_or(DEFAULT_FILTER_SELECTIVITY)
}

/// Fraction of input rows in [0, 1] expected to pass `predicate`.
pub fn estimate_selectivity(predicate: &Expr, stats: &Statistics) -> f64 {
    match predicate {
        Expr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Column(c), _) | (_, Expr::Column(c)) => equality_selectivity(stats, &c.name),
            _ => DEFAULT_FILTER_SELECTIVITY,
        },
        Expr::BinaryOp {
            op: BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq,
            ..
        } => RANGE_SELECTIVITY,
        Expr::And(conjuncts) => conjuncts.iter().map(|c| estimate_selectivity(c, stats)).product(),
        Expr::Or(disjuncts) => {
            let miss: f64 = disjuncts
                .iter()
                .map(|d| 1.0 - estimate_selectivity(d, stats))
                .product();
            1.0 - miss
        }
        _ => DEFAULT_FILTER_SELECTIVITY,
    }
}

/// Pluggable statistics derivation, invoked at most once per group.
///
/// `child_stats` holds the statistics of the operator's child groups, in child order.
pub trait StatsDerivation: Send + Sync {
    fn derive_stats(&self, op: &Operator, child_stats: &[&Statistics], catalog: &dyn Catalog) -> Statistics;
}

/// Catalog-backed derivation with the textbook formulas above.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStatsDerivation;

impl StatsDerivation for DefaultStatsDerivation {
    fn derive_stats(&self, op: &Operator, child_stats: &[&Statistics], catalog: &dyn Catalog) -> Statistics {
        let first = || child_stats.first().map(|s| (*s).clone()).unwrap_or_else(Statistics::unknown);
        let Operator::Logical(logical) = op else {
            return first();
        };

        match logical {
            LogicalOp::Scan { table, predicate, .. } => {
                let base = catalog.get_table_stats(table).unwrap_or_else(Statistics::unknown);
                match predicate {
                    Some(p) => derive_filter_stats(&base, estimate_selectivity(p, &base)),
                    None => base,
                }
            }
            LogicalOp::Filter { predicate } => {
                let input = first();
                derive_filter_stats(&input, estimate_selectivity(predicate, &input))
            }
            LogicalOp::Join { join_type, condition } => {
                let (Some(left), Some(right)) = (child_stats.first(), child_stats.get(1)) else {
                    return Statistics::unknown();
                };
                let keys: Vec<(String, String)> = condition
                    .equi_join_columns()
                    .into_iter()
                    .map(|(l, r)| (l.name.clone(), r.name.clone()))
                    .collect();
                let joined = derive_join_stats(left, right, &keys);
                match join_type {
                    JoinType::Semi | JoinType::Anti => {
                        let sel = (joined.row_count / left.row_count.max(1.0)).min(1.0);
                        derive_filter_stats(left, sel)
                    }
                    JoinType::Left if joined.row_count < left.row_count => Statistics {
                        row_count: left.row_count,
                        ..joined
                    },
                    _ => joined,
                }
            }
            LogicalOp::Aggregate { group_by, .. } => {
                let group_cols: Vec<String> = group_by
                    .iter()
                    .filter_map(|e| match e {
                        Expr::Column(c) => Some(c.name.clone()),
                        _ => None,
                    })
                    .collect();
                derive_aggregate_stats(&first(), &group_cols)
            }
            LogicalOp::Limit { count, .. } => {
                let input = first();
                let rows = input.row_count.min(*count as f64).max(1.0);
                derive_filter_stats(&input, rows / input.row_count.max(1.0))
            }
            LogicalOp::Project { .. } | LogicalOp::Sort { .. } => first(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::expr::TableRef;

    #[test]
    fn test_join_cardinality_uses_max_ndv() {
        let left = Statistics::new(1000.0, 100_000.0).with_column("id", ColumnStatistics::new(1000.0, 0.0));
        let right = Statistics::new(10_000.0, 1_000_000.0).with_column("fk", ColumnStatistics::new(500.0, 0.0));
        let out = derive_join_stats(&left, &right, &[("id".into(), "fk".into())]);
        assert!((out.row_count - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_scan_uses_catalog_and_pushed_predicate() {
        let table = TableRef::new("tpch", "nation");
        let mut catalog = InMemoryCatalog::new();
        catalog.add_table(
            &table,
            vec![],
            Statistics::new(25.0, 2500.0).with_column("n_regionkey", ColumnStatistics::new(5.0, 0.0)),
        );
        let derivation = DefaultStatsDerivation;
        let plain = Operator::Logical(LogicalOp::Scan {
            table: table.clone(),
            columns: vec![],
            predicate: None,
        });
        assert_eq!(derivation.derive_stats(&plain, &[], &catalog).row_count, 25.0);

        let filtered = Operator::Logical(LogicalOp::Scan {
            table,
            columns: vec![],
            predicate: Some(Expr::equals(
                Expr::column("nation", "n_regionkey"),
                Expr::literal(ScalarValue::Int64(1)),
            )),
        });
        assert!((derivation.derive_stats(&filtered, &[], &catalog).row_count - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_limit_caps_rows() {
        let input = Statistics::new(1000.0, 100_000.0);
        let op = Operator::Logical(LogicalOp::Limit { offset: 0, count: 10 });
        let out = DefaultStatsDerivation.derive_stats(&op, &[&input], &InMemoryCatalog::new());
        assert!((out.row_count - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_disjunction_selectivity() {
        let stats = Statistics::unknown();
        let range = Expr::binary(BinaryOp::Lt, Expr::column("t", "a"), Expr::literal(ScalarValue::Int64(1)));
        let sel = estimate_selectivity(&Expr::Or(vec![range.clone(), range]), &stats);
        assert!((sel - (1.0 - 0.67 * 0.67)).abs() < 1e-9);
    }
}
