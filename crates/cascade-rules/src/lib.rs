//! # Built-in Optimization Rules
//!
//! The default rule set for the Cascades search engine in `cascade-core`. Rules are
//! divided into two categories:
//!
//! ## Transformation Rules (Logical -> Logical)
//!
//! These rules expand the search space by generating equivalent logical alternatives:
//!
//! - **`JoinCommutativityRule`**: Swaps the sides of inner and cross joins
//!   (A JOIN B -> B JOIN A).
//! - **`JoinAssociativityRule`**: Changes join grouping
//!   ((A JOIN B) JOIN C -> A JOIN (B JOIN C)), creating a group for the new inner join.
//! - **`PredicatePushdownRule`**: Merges filter predicates into inner join conditions.
//! - **`ProjectionPushdownRule`**: Narrows the scan below a projection to the columns
//!   the projection reads.
//!
//! ## Implementation Rules (Logical -> Physical)
//!
//! These rules produce physical operator alternatives that the cost model scores:
//!
//! - **`ImplHashJoinRule`**: Hash join, build-left and build-right.
//! - **`ImplMergeJoinRule`**: Merge join (inner equi-joins only).
//! - **`ImplNestedLoopJoinRule`**: Nested loop join (universal fallback).
//! - **`ImplSeqScanRule`**: Sequential table scan.
//! - **`ImplHashAggregateRule`** / **`ImplStreamAggregateRule`**: Aggregation.
//! - **`ImplFilterRule`**, **`ImplProjectRule`**, **`ImplLimitRule`**, **`ImplSortRule`**:
//!   One-to-one mappings of the unary operators.
//!
//! Hash join and hash aggregate produce `High` level alternatives, so group optimization
//! costs them before the rest.

pub mod impl_agg;
pub mod impl_join;
pub mod impl_scan;
pub mod impl_unary;
pub mod join_associativity;
pub mod join_commutativity;
pub mod predicate_pushdown;
pub mod projection_pushdown;

use cascade_core::rule::RuleRegistry;
use std::sync::Arc;

/// Create a default rule registry with all built-in rules.
///
/// Connector-specific rules can be added to the returned registry via
/// `add_source_rule_set()`.
pub fn default_rule_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();

    registry.add_rule(Arc::new(join_commutativity::JoinCommutativityRule));
    registry.add_rule(Arc::new(join_associativity::JoinAssociativityRule));
    registry.add_rule(Arc::new(predicate_pushdown::PredicatePushdownRule));
    registry.add_rule(Arc::new(projection_pushdown::ProjectionPushdownRule));

    registry.add_rule(Arc::new(impl_join::ImplHashJoinRule));
    registry.add_rule(Arc::new(impl_join::ImplMergeJoinRule));
    registry.add_rule(Arc::new(impl_join::ImplNestedLoopJoinRule));
    registry.add_rule(Arc::new(impl_scan::ImplSeqScanRule));
    registry.add_rule(Arc::new(impl_agg::ImplHashAggregateRule));
    registry.add_rule(Arc::new(impl_agg::ImplStreamAggregateRule));
    registry.add_rule(Arc::new(impl_unary::ImplFilterRule));
    registry.add_rule(Arc::new(impl_unary::ImplProjectRule));
    registry.add_rule(Arc::new(impl_unary::ImplLimitRule));
    registry.add_rule(Arc::new(impl_unary::ImplSortRule));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::rule::RuleType;
    use std::collections::HashSet;

    #[test]
    fn test_default_registry_names_are_unique() {
        let registry = default_rule_registry();
        let names: HashSet<String> = registry
            .active_rules(None)
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names.len(), registry.len());
        assert_eq!(registry.transformation_rules(None).len(), 4);
        assert!(registry.contains("ImplFilter"));
        assert!(registry
            .rules_of_type(RuleType::Implementation, None)
            .iter()
            .all(|r| r.name().starts_with("Impl")));
    }
}
