//! # Join Commutativity Rule
//!
//! `A JOIN B = B JOIN A` for symmetric join types (inner and cross joins). Left, right,
//! semi and anti joins have fixed left/right semantics and are never commuted.
//!
//! The commuted join lands in the same group as the original. Applying the rule to the
//! commuted join reproduces the original expression, which the memo recognizes as a
//! duplicate, so exploration reaches a fixed point.
//!
//! Equi-join conditions are swapped along with the children (`A.x = B.y` becomes
//! `B.y = A.x`), so the left column of every equality keeps referring to the left input.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Join commutativity: A JOIN B -> B JOIN A.
pub struct JoinCommutativityRule;

impl Rule for JoinCommutativityRule {
    fn name(&self) -> &str {
        "JoinCommutativity"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Join { join_type, condition }) = &expr.op else {
            return vec![];
        };
        if !matches!(join_type, JoinType::Inner | JoinType::Cross) || expr.children.len() != 2 {
            return vec![];
        }

        vec![RuleResult::Substitution(
            Operator::Logical(LogicalOp::Join {
                join_type: *join_type,
                condition: swap_condition_sides(condition),
            }),
            vec![expr.children[1], expr.children[0]],
        )]
    }
}

/// Swap the sides of every equality in an equi-join condition.
fn swap_condition_sides(expr: &Expr) -> Expr {
    match expr {
        Expr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } => Expr::BinaryOp {
            op: BinaryOp::Eq,
            left: right.clone(),
            right: left.clone(),
        },
        Expr::And(conjuncts) => Expr::And(conjuncts.iter().map(swap_condition_sides).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    #[test]
    fn test_swap_condition() {
        let cond = Expr::equals(Expr::column("a", "x"), Expr::column("b", "y"));
        match swap_condition_sides(&cond) {
            Expr::BinaryOp { left, right, .. } => {
                assert!(matches!(left.as_ref(), Expr::Column(c) if c.table.as_deref() == Some("b")));
                assert!(matches!(right.as_ref(), Expr::Column(c) if c.table.as_deref() == Some("a")));
            }
            other => panic!("expected BinaryOp, got {other:?}"),
        }
        assert_eq!(swap_condition_sides(&swap_condition_sides(&cond)), cond);
    }

    #[test]
    fn test_commuting_twice_finds_the_original() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let ctx = OptContext { catalog: &catalog };
        let tree = OperatorTree::join(
            JoinType::Inner,
            Expr::equals(Expr::column("a", "x"), Expr::column("b", "y")),
            OperatorTree::scan(TableRef::new("s", "a")),
            OperatorTree::scan(TableRef::new("s", "b")),
        );
        let group = memo.insert_tree(&tree).unwrap();
        let original = memo.group(group).logical_exprs()[0];

        let Some(RuleResult::Substitution(op, children)) =
            JoinCommutativityRule.apply(&memo.expr(original), &memo, &ctx).pop()
        else {
            panic!("expected a substitution");
        };
        let swapped = memo.insert_expr(op, children, Some(group), Default::default()).unwrap();
        assert!(swapped.inserted);

        let Some(RuleResult::Substitution(op, children)) =
            JoinCommutativityRule.apply(&memo.expr(swapped.expr), &memo, &ctx).pop()
        else {
            panic!("expected a substitution");
        };
        let back = memo.insert_expr(op, children, Some(group), Default::default()).unwrap();
        assert!(!back.inserted);
        assert_eq!(back.expr, original);
    }

    #[test]
    fn test_left_join_is_not_commuted() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let tree = OperatorTree::join(
            JoinType::Left,
            Expr::equals(Expr::column("a", "x"), Expr::column("b", "y")),
            OperatorTree::scan(TableRef::new("s", "a")),
            OperatorTree::scan(TableRef::new("s", "b")),
        );
        let group = memo.insert_tree(&tree).unwrap();
        let expr = memo.expr(memo.group(group).logical_exprs()[0]);
        assert!(JoinCommutativityRule
            .apply(&expr, &memo, &OptContext { catalog: &catalog })
            .is_empty());
    }
}
