//! # Scan Implementation Rule
//!
//! Maps a logical Scan to a physical SeqScan (sequential/full table scan). A sequential
//! scan reads every row of the table and evaluates any pushed-down predicate. It is the
//! only scan strategy, so every scan group ends up with exactly one physical member.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Implement logical scan as a sequential (full) table scan.
pub struct ImplSeqScanRule;

impl Rule for ImplSeqScanRule {
    fn name(&self) -> &str {
        "ImplSeqScan"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::scan()
    }

    fn apply(&self, expr: &GroupExpression, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Scan {
            table,
            columns,
            predicate,
        }) = &expr.op
        else {
            return vec![];
        };

        vec![RuleResult::Substitution(
            Operator::Physical(PhysicalOp::SeqScan {
                table: table.clone(),
                columns: columns.clone(),
                predicate: predicate.clone(),
            }),
            vec![],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    #[test]
    fn test_scan_keeps_pushed_predicate() {
        let memo = Memo::new();
        let predicate = Expr::equals(Expr::column("t", "a"), Expr::literal(ScalarValue::Int64(1)));
        let scan = Operator::Logical(LogicalOp::Scan {
            table: TableRef::new("s", "t"),
            columns: vec![],
            predicate: Some(predicate.clone()),
        });
        let (_, id) = memo.add_expr(scan, vec![]).unwrap();
        let catalog = InMemoryCatalog::new();
        let results = ImplSeqScanRule.apply(&memo.expr(id), &memo, &OptContext { catalog: &catalog });

        assert_eq!(results.len(), 1);
        match &results[0] {
            RuleResult::Substitution(Operator::Physical(PhysicalOp::SeqScan { predicate: p, .. }), children) => {
                assert_eq!(p.as_ref(), Some(&predicate));
                assert!(children.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
