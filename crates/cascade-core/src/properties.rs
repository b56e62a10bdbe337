//! # Physical and Logical Properties
//!
//! ## Logical Properties
//!
//! Shared by every expression of a group: its output columns. Derived once per group
//! (see `Group::derive_properties`). Cardinality is not a logical property here; it
//! comes from the group's statistics (`Group::row_count`), which may be derived later.
//!
//! ## Physical Properties
//!
//! `PhysicalPropertySet` is used in two roles:
//!
//! - **Required**: what a parent asks of a group. Together with a search stage it keys
//!   an `OptimizationContext`.
//! - **Delivered**: what a concrete physical plan actually provides, derived bottom-up
//!   from the operator and its children's best plans (`derive_delivered`).
//!
//! Four properties are tracked:
//! - **Sort order**: required by merge joins, stream aggregates and `ORDER BY`.
//! - **Distribution**: how rows are spread over nodes.
//! - **Rewindability**: whether the output can be re-scanned (e.g. inner side of a
//!   nested loop join executed more than once).
//! - **Partition propagation**: partition selection that must flow through this node to
//!   the scans below. No motion may sit between the requester and those scans.
//!
//! `None` in any slot means "no requirement" (required role) or "nothing guaranteed"
//! (delivered role).

use crate::expr::{ColumnRef, Distribution, Expr, PhysicalOp, SortKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Logical properties are derived from the logical content of a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalProperties {
    /// Output columns of this group.
    pub output_columns: Vec<ColumnRef>,
}

/// Re-scan capability of an operator's output. `MarkRestore` is the stronger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rewindability {
    Rewindable,
    MarkRestore,
}

/// Partition-index ids whose selection has to be propagated to consumers below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionPropagation {
    pub part_index_ids: BTreeSet<u32>,
}

impl PartitionPropagation {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            part_index_ids: ids.into_iter().collect(),
        }
    }

    pub fn is_required(&self) -> bool {
        !self.part_index_ids.is_empty()
    }
}

/// Physical properties of a plan: required by a parent or delivered by a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhysicalPropertySet {
    pub sort_order: Option<Vec<SortKey>>,
    pub distribution: Option<Distribution>,
    pub rewindability: Option<Rewindability>,
    pub partition_propagation: Option<PartitionPropagation>,
}

impl PhysicalPropertySet {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_sort(order: Vec<SortKey>) -> Self {
        Self {
            sort_order: Some(order),
            ..Self::default()
        }
    }

    pub fn with_distribution(dist: Distribution) -> Self {
        Self {
            distribution: Some(dist),
            ..Self::default()
        }
    }

    pub fn with_rewindability(rewindability: Rewindability) -> Self {
        Self {
            rewindability: Some(rewindability),
            ..Self::default()
        }
    }

    /// An empty sort order is no requirement.
    pub fn order_required(&self) -> bool {
        self.sort_order.as_ref().is_some_and(|o| !o.is_empty())
    }

    pub fn distribution_required(&self) -> bool {
        self.distribution.is_some()
    }

    pub fn rewindability_required(&self) -> bool {
        self.rewindability.is_some()
    }

    pub fn partition_propagation_required(&self) -> bool {
        self.partition_propagation
            .as_ref()
            .is_some_and(PartitionPropagation::is_required)
    }

    /// Whether the order required by `self` is provided by `delivered`.
    ///
    /// The required order must be a prefix of the delivered one: output sorted on
    /// `(a, b, c)` satisfies `ORDER BY a, b`.
    pub fn order_satisfied_by(&self, delivered: &PhysicalPropertySet) -> bool {
        match (&self.sort_order, &delivered.sort_order) {
            (None, _) => true,
            (Some(required), _) if required.is_empty() => true,
            (Some(_), None) => false,
            (Some(required), Some(provided)) => {
                required.len() <= provided.len()
                    && required.iter().zip(provided.iter()).all(|(r, p)| r == p)
            }
        }
    }

    pub fn distribution_satisfied_by(&self, delivered: &PhysicalPropertySet) -> bool {
        match (&self.distribution, &delivered.distribution) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(required), Some(provided)) => provided.satisfies(required),
        }
    }

    pub fn rewindability_satisfied_by(&self, delivered: &PhysicalPropertySet) -> bool {
        match (self.rewindability, delivered.rewindability) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(required), Some(provided)) => provided >= required,
        }
    }

    /// Check whether the properties `delivered` by a plan satisfy this requirement.
    ///
    /// Partition propagation is a constraint on plan shape rather than a delivered
    /// property; it is checked during enforcement (see `enforcement`).
    pub fn satisfied_by(&self, delivered: &PhysicalPropertySet) -> bool {
        self.order_satisfied_by(delivered)
            && self.distribution_satisfied_by(delivered)
            && self.rewindability_satisfied_by(delivered)
    }

    fn without_order(&self) -> Self {
        Self {
            sort_order: None,
            ..self.clone()
        }
    }

    fn without_distribution(&self) -> Self {
        Self {
            distribution: None,
            ..self.clone()
        }
    }

    fn without_rewindability(&self) -> Self {
        Self {
            rewindability: None,
            ..self.clone()
        }
    }

    fn only_partition_propagation(&self) -> Self {
        Self {
            partition_propagation: self.partition_propagation.clone(),
            ..Self::default()
        }
    }
}

/// Compute the properties a physical operator requests from each of its children,
/// given the properties required of the operator itself.
///
/// - Pass-through operators (filter, projection, limit) forward the whole requirement.
/// - Enforcers forward the requirement minus the property they enforce; `Exchange`
///   destroys order, so it forwards neither order nor distribution.
/// - Order-based operators (merge join, stream aggregate) request sorted input.
/// - Everything else requests nothing beyond partition propagation.
pub fn child_requirements(
    op: &PhysicalOp,
    required: &PhysicalPropertySet,
    arity: usize,
) -> Vec<PhysicalPropertySet> {
    match op {
        PhysicalOp::SeqScan { .. } => vec![],
        PhysicalOp::Filter { .. } | PhysicalOp::Projection { .. } | PhysicalOp::Limit { .. } => {
            vec![required.clone()]
        }
        PhysicalOp::SortOp { .. } => vec![required.without_order().without_rewindability()],
        PhysicalOp::Exchange { .. } => vec![required.without_distribution().without_order()],
        PhysicalOp::Spool => vec![required.without_rewindability()],
        PhysicalOp::MergeJoin { condition, .. } => {
            let (left_keys, right_keys) = merge_join_sort_keys(condition);
            let mut left = PhysicalPropertySet::with_sort(left_keys);
            let mut right = PhysicalPropertySet::with_sort(right_keys);
            left.partition_propagation = required.partition_propagation.clone();
            right.partition_propagation = required.partition_propagation.clone();
            vec![left, right]
        }
        PhysicalOp::StreamAggregate { group_by, .. } => {
            let keys = group_by.iter().cloned().map(SortKey::asc).collect();
            let mut child = PhysicalPropertySet::with_sort(keys);
            child.partition_propagation = required.partition_propagation.clone();
            vec![child]
        }
        _ => (0..arity).map(|_| required.only_partition_propagation()).collect(),
    }
}

/// Sort keys for both inputs of a merge join: left column of each equi pair for the
/// left input, right column for the right input.
pub fn merge_join_sort_keys(condition: &Expr) -> (Vec<SortKey>, Vec<SortKey>) {
    condition
        .equi_join_columns()
        .into_iter()
        .map(|(l, r)| {
            (
                SortKey::asc(Expr::Column(l.clone())),
                SortKey::asc(Expr::Column(r.clone())),
            )
        })
        .unzip()
}

/// Derive the properties a physical operator delivers from what its children deliver.
pub fn derive_delivered(op: &PhysicalOp, children: &[&PhysicalPropertySet]) -> PhysicalPropertySet {
    let first = children.first().map(|c| (*c).clone()).unwrap_or_default();
    match op {
        PhysicalOp::SeqScan { .. } => PhysicalPropertySet {
            distribution: Some(Distribution::RoundRobin),
            rewindability: Some(Rewindability::Rewindable),
            ..PhysicalPropertySet::default()
        },
        PhysicalOp::Filter { .. } | PhysicalOp::Projection { .. } | PhysicalOp::Limit { .. } => first,
        PhysicalOp::SortOp { order } => PhysicalPropertySet {
            sort_order: Some(order.clone()),
            distribution: first.distribution,
            rewindability: Some(Rewindability::MarkRestore),
            partition_propagation: None,
        },
        PhysicalOp::Exchange { distribution } => PhysicalPropertySet {
            distribution: Some(distribution.clone()),
            ..PhysicalPropertySet::default()
        },
        PhysicalOp::Spool => PhysicalPropertySet {
            rewindability: Some(Rewindability::MarkRestore),
            ..first
        },
        PhysicalOp::MergeJoin { .. } | PhysicalOp::NestedLoopJoin { .. } => PhysicalPropertySet {
            sort_order: first.sort_order,
            distribution: first.distribution,
            ..PhysicalPropertySet::default()
        },
        PhysicalOp::HashJoin { .. } | PhysicalOp::HashAggregate { .. } => PhysicalPropertySet {
            distribution: first.distribution,
            ..PhysicalPropertySet::default()
        },
        PhysicalOp::StreamAggregate { .. } => PhysicalPropertySet {
            sort_order: first.sort_order,
            distribution: first.distribution,
            ..PhysicalPropertySet::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, JoinType};

    fn key(col: &str) -> SortKey {
        SortKey::asc(Expr::column("t", col))
    }

    #[test]
    fn test_sort_prefix_satisfaction() {
        let required = PhysicalPropertySet::with_sort(vec![key("a")]);
        let delivered = PhysicalPropertySet::with_sort(vec![key("a"), key("b")]);
        assert!(required.satisfied_by(&delivered));
        assert!(!delivered.satisfied_by(&required));
        assert!(PhysicalPropertySet::any().satisfied_by(&PhysicalPropertySet::any()));
    }

    #[test]
    fn test_rewindability_ordering() {
        let required = PhysicalPropertySet::with_rewindability(Rewindability::Rewindable);
        let spooled = PhysicalPropertySet::with_rewindability(Rewindability::MarkRestore);
        assert!(required.satisfied_by(&spooled));
        assert!(!spooled.satisfied_by(&required));
    }

    #[test]
    fn test_enforcers_drop_their_property() {
        let required = PhysicalPropertySet {
            sort_order: Some(vec![key("a")]),
            distribution: Some(Distribution::Single),
            rewindability: Some(Rewindability::Rewindable),
            partition_propagation: None,
        };
        let sort = child_requirements(&PhysicalOp::SortOp { order: vec![key("a")] }, &required, 1);
        assert!(!sort[0].order_required());
        assert!(sort[0].distribution_required());

        let exchange = PhysicalOp::Exchange {
            distribution: Distribution::Single,
        };
        let below_exchange = child_requirements(&exchange, &required, 1);
        assert!(!below_exchange[0].distribution_required());
        assert!(!below_exchange[0].order_required());

        let spool = child_requirements(&PhysicalOp::Spool, &required, 1);
        assert!(!spool[0].rewindability_required());
    }

    #[test]
    fn test_merge_join_requests_sorted_inputs() {
        let cond = Expr::binary(BinaryOp::Eq, Expr::column("a", "x"), Expr::column("b", "y"));
        let op = PhysicalOp::MergeJoin {
            join_type: JoinType::Inner,
            condition: cond,
        };
        let reqs = child_requirements(&op, &PhysicalPropertySet::any(), 2);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].sort_order, Some(vec![SortKey::asc(Expr::column("a", "x"))]));
        assert_eq!(reqs[1].sort_order, Some(vec![SortKey::asc(Expr::column("b", "y"))]));
    }

    #[test]
    fn test_filter_passes_child_properties_through() {
        let child = PhysicalPropertySet::with_sort(vec![key("a")]);
        let op = PhysicalOp::Filter {
            predicate: Expr::column("t", "flag"),
        };
        assert_eq!(derive_delivered(&op, &[&child]), child);
    }
}
