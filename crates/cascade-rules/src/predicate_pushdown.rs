//! # Predicate Pushdown Rule
//!
//! When a Filter sits on top of an inner Join, this rule merges the filter predicate into
//! the join condition:
//!
//! ```text
//! Before: Filter(pred, Join(A, B, cond))
//! After:  Join(A, B, cond AND pred)
//! ```
//!
//! The merged join is a new alternative in the Filter's group; the original
//! Filter-over-Join stays in the memo and the cost model picks the cheaper one. A cross
//! join absorbing a predicate becomes an inner join. Outer, semi and anti joins are left
//! alone since a predicate above them does not mean the same thing as one in their
//! condition.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};
use tracing::trace;

/// Push filter predicates into join conditions.
pub struct PredicatePushdownRule;

impl Rule for PredicatePushdownRule {
    fn name(&self) -> &str {
        "PredicatePushdown"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::filter_join()
    }

    fn apply(&self, expr: &GroupExpression, memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Filter { predicate }) = &expr.op else {
            return vec![];
        };
        let Some(&join_group) = expr.children.first() else {
            return vec![];
        };

        memo.group(memo.resolve(join_group))
            .logical_exprs()
            .into_iter()
            .filter_map(|id| {
                let join = memo.expr(id);
                let Operator::Logical(LogicalOp::Join { join_type, condition }) = &join.op else {
                    return None;
                };
                if !matches!(join_type, JoinType::Inner | JoinType::Cross) {
                    return None;
                }
                let mut conjuncts: Vec<Expr> = condition.conjuncts().into_iter().cloned().collect();
                conjuncts.extend(predicate.conjuncts().into_iter().cloned());
                let merged = Expr::from_conjuncts(conjuncts)?;
                trace!(filter = expr.id, join = id, "merged filter into join condition");
                Some(RuleResult::Substitution(
                    Operator::Logical(LogicalOp::Join {
                        join_type: JoinType::Inner,
                        condition: merged,
                    }),
                    join.children.clone(),
                ))
            })
            .collect()
    }
}
