//! # Aggregate Implementation Rules
//!
//! ## Hash Aggregate (`ImplHashAggregateRule`)
//!
//! Uses a hash table keyed by the group-by columns. Works with any input ordering, at
//! the price of memory proportional to the number of groups. Its alternatives are
//! `High` level: the cost model sees them first.
//!
//! ## Stream Aggregate (`ImplStreamAggregateRule`)
//!
//! Processes input rows in a single pass, detecting group boundaries from the sorted
//! order. It requests input sorted on the group-by columns; the engine adds a sort
//! enforcer below it when the input does not deliver that order, so the cost model
//! compares sort + stream aggregate against hash aggregate.

use cascade_core::expr::*;
use cascade_core::group_expression::{GroupExpression, OptimizationLevel};
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Implement logical aggregate as a hash aggregate.
pub struct ImplHashAggregateRule;

impl Rule for ImplHashAggregateRule {
    fn name(&self) -> &str {
        "ImplHashAggregate"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::aggregate()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Aggregate { group_by, aggregates }) = &expr.op else {
            return vec![];
        };

        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::HashAggregate {
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
            }),
            expr.children.clone(),
        )]
    }

    fn optimization_level(&self) -> OptimizationLevel {
        OptimizationLevel::High
    }
}

/// Implement logical aggregate as a stream aggregate (requires sorted input).
///
/// A global aggregate (no group-by keys) needs no order; hash aggregate covers it.
pub struct ImplStreamAggregateRule;

impl Rule for ImplStreamAggregateRule {
    fn name(&self) -> &str {
        "ImplStreamAggregate"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::aggregate()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Aggregate { group_by, aggregates }) = &expr.op else {
            return vec![];
        };
        if group_by.is_empty() {
            return vec![];
        }

        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::StreamAggregate {
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
            }),
            expr.children.clone(),
        )]
    }
}
