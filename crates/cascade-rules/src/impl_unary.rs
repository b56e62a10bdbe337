//! # Unary Operator Implementation Rules
//!
//! One-to-one mappings from the logical unary operators to their physical counterparts:
//! Filter, Project, Limit and Sort. Filter, projection and limit pass the required
//! properties of their parent through to their input.
//!
//! A physical `SortOp` produced from an explicit ORDER BY is an ordinary member of the
//! Sort group. The same operator also serves as the order enforcer the engine adds on
//! top of a group when a parent requires an order its input does not deliver.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Implement logical filter as a physical filter.
pub struct ImplFilterRule;

impl Rule for ImplFilterRule {
    fn name(&self) -> &str {
        "ImplFilter"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::filter()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Filter { predicate }) = &expr.op else {
            return vec![];
        };
        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::Filter {
                predicate: predicate.clone(),
            }),
            expr.children.clone(),
        )]
    }
}

pub struct ImplProjectRule;

impl Rule for ImplProjectRule {
    fn name(&self) -> &str {
        "ImplProject"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::project()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Project { exprs, aliases }) = &expr.op else {
            return vec![];
        };
        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::Projection {
                exprs: exprs.clone(),
                aliases: aliases.clone(),
            }),
            expr.children.clone(),
        )]
    }
}

pub struct ImplLimitRule;

impl Rule for ImplLimitRule {
    fn name(&self) -> &str {
        "ImplLimit"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::limit()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Limit { offset, count }) = &expr.op else {
            return vec![];
        };
        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::Limit {
                offset: *offset,
                count: *count,
            }),
            expr.children.clone(),
        )]
    }
}

/// Implement logical sort (ORDER BY) as a physical sort.
pub struct ImplSortRule;

impl Rule for ImplSortRule {
    fn name(&self) -> &str {
        "ImplSort"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::sort()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Sort { order }) = &expr.op else {
            return vec![];
        };
        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::SortOp { order: order.clone() }),
            expr.children.clone(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    #[test]
    fn test_unary_rules_keep_child_group() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let ctx = OptContext { catalog: &catalog };
        let scan = OperatorTree::scan(TableRef::new("s", "t"));
        let limited = OperatorTree::new(
            Operator::Logical(LogicalOp::Limit { offset: 0, count: 10 }),
            vec![OperatorTree::filter(Expr::column("t", "flag"), scan)],
        );
        let root = memo.insert_tree(&limited).unwrap();
        let limit = memo.expr(memo.group(root).logical_exprs()[0]);
        let filter_group = limit.children[0];
        let filter = memo.expr(memo.group(filter_group).logical_exprs()[0]);

        let limit_results = ImplLimitRule.apply(&limit, &memo, &ctx);
        assert!(matches!(
            &limit_results[..],
            [RuleResult::Substitution(Operator::Physical(PhysicalOp::Limit { count: 10, .. }), children)]
                if children == &vec![filter_group]
        ));
        assert_eq!(ImplFilterRule.apply(&filter, &memo, &ctx).len(), 1);
        assert!(ImplSortRule.apply(&filter, &memo, &ctx).is_empty());
    }
}
