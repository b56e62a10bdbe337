//! # Join Implementation Rules
//!
//! Three implementation rules map a logical Join to physical join operators:
//!
//! ## Hash Join (`ImplHashJoinRule`)
//!
//! Builds a hash table on one side and probes it with the other. Produces two
//! alternatives per join (build-left and build-right) so the cost model can pick the
//! cheaper orientation. Its alternatives are `High` level.
//!
//! **Requires**: at least one equi-join predicate, or a cross join.
//!
//! ## Merge Join (`ImplMergeJoinRule`)
//!
//! Merges two streams sorted on the join keys. The engine requests sorted input from
//! both children and adds sort enforcers where the inputs are not sorted already.
//!
//! **Requires**: inner join with equi-join predicates.
//!
//! ## Nested Loop Join (`ImplNestedLoopJoinRule`)
//!
//! The universal fallback: works with any join condition, O(n * m).

use cascade_core::expr::*;
use cascade_core::group_expression::{GroupExpression, OptimizationLevel};
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};

fn as_join(expr: &GroupExpression) -> Option<(JoinType, &Expr)> {
    match &expr.op {
        Operator::Logical(LogicalOp::Join { join_type, condition }) if expr.children.len() == 2 => {
            Some((*join_type, condition))
        }
        _ => None,
    }
}

/// Implement logical join as a hash join, building on either side.
pub struct ImplHashJoinRule;

impl Rule for ImplHashJoinRule {
    fn name(&self) -> &str {
        "ImplHashJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Some((join_type, condition)) = as_join(expr) else {
            return vec![];
        };
        if !has_equi_predicate(condition) && join_type != JoinType::Cross {
            return vec![];
        }

        [BuildSide::Right, BuildSide::Left]
            .into_iter()
            .map(|build_side| {
                RuleResult::Substitution(
                    Operator::Physical(PhysicalOp::HashJoin {
                        join_type,
                        build_side,
                        condition: condition.clone(),
                    }),
                    expr.children.clone(),
                )
            })
            .collect()
    }

    fn optimization_level(&self) -> OptimizationLevel {
        OptimizationLevel::High
    }
}

/// Implement logical join as a merge join over sorted inputs.
pub struct ImplMergeJoinRule;

impl Rule for ImplMergeJoinRule {
    fn name(&self) -> &str {
        "ImplMergeJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Some((join_type, condition)) = as_join(expr) else {
            return vec![];
        };
        if join_type != JoinType::Inner || !has_equi_predicate(condition) {
            return vec![];
        }

        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::MergeJoin {
                join_type,
                condition: condition.clone(),
            }),
            expr.children.clone(),
        )]
    }
}

/// Implement logical join as a nested loop join.
pub struct ImplNestedLoopJoinRule;

impl Rule for ImplNestedLoopJoinRule {
    fn name(&self) -> &str {
        "ImplNestedLoopJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Some((join_type, condition)) = as_join(expr) else {
            return vec![];
        };

        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::NestedLoopJoin {
                join_type,
                condition: condition.clone(),
            }),
            expr.children.clone(),
        )]
    }
}

/// At least one `column = column` conjunct.
fn has_equi_predicate(expr: &Expr) -> bool {
    !expr.equi_join_columns().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    fn join_expr(memo: &Memo, join_type: JoinType, condition: Expr) -> std::sync::Arc<GroupExpression> {
        let tree = OperatorTree::join(
            join_type,
            condition,
            OperatorTree::scan(TableRef::new("s", "a")),
            OperatorTree::scan(TableRef::new("s", "b")),
        );
        let group = memo.insert_tree(&tree).unwrap();
        memo.expr(memo.group(group).logical_exprs()[0])
    }

    #[test]
    fn test_has_equi_predicate() {
        let equi = Expr::equals(Expr::column("a", "x"), Expr::column("b", "y"));
        assert!(has_equi_predicate(&equi));

        let non_equi = Expr::binary(BinaryOp::Lt, Expr::column("a", "x"), Expr::literal(ScalarValue::Int64(10)));
        assert!(!has_equi_predicate(&non_equi));
        assert!(has_equi_predicate(&Expr::And(vec![non_equi, equi])));
    }

    #[test]
    fn test_non_equi_join_only_has_nested_loop() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let ctx = OptContext { catalog: &catalog };
        let cond = Expr::binary(BinaryOp::Lt, Expr::column("a", "x"), Expr::column("b", "y"));
        let expr = join_expr(&memo, JoinType::Inner, cond);

        assert!(ImplHashJoinRule.apply(&expr, &memo, &ctx).is_empty());
        assert!(ImplMergeJoinRule.apply(&expr, &memo, &ctx).is_empty());
        assert_eq!(ImplNestedLoopJoinRule.apply(&expr, &memo, &ctx).len(), 1);
    }

    #[test]
    fn test_equi_join_alternatives() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let ctx = OptContext { catalog: &catalog };
        let expr = join_expr(
            &memo,
            JoinType::Inner,
            Expr::equals(Expr::column("a", "x"), Expr::column("b", "y")),
        );

        assert_eq!(ImplHashJoinRule.apply(&expr, &memo, &ctx).len(), 2);
        assert_eq!(ImplMergeJoinRule.apply(&expr, &memo, &ctx).len(), 1);
        assert_eq!(ImplHashJoinRule.optimization_level(), OptimizationLevel::High);
    }
}
