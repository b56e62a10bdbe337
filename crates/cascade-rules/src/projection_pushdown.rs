//! # Projection Pushdown Rule
//!
//! Column pruning: when a Project reads only some of the columns of the Scan below it,
//! this rule adds `Project(Scan(needed columns))` to the Project's group. Columnar
//! formats skip unread columns, so the narrower scan reads less.
//!
//! Only Project directly over Scan is handled.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::Memo;
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleChild, RuleResult, RuleType};

/// Narrow the scan under a projection to the columns the projection reads.
pub struct ProjectionPushdownRule;

impl Rule for ProjectionPushdownRule {
    fn name(&self) -> &str {
        "ProjectionPushdown"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::project_scan()
    }

    fn apply(&self, expr: &GroupExpression, memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(project @ LogicalOp::Project { exprs, .. }) = &expr.op else {
            return vec![];
        };
        let Some(&child) = expr.children.first() else {
            return vec![];
        };

        let mut needed: Vec<ColumnRef> = Vec::new();
        for column in exprs.iter().flat_map(|e| e.columns()) {
            if !needed.contains(column) {
                needed.push(column.clone());
            }
        }
        if needed.is_empty() {
            return vec![];
        }

        memo.group(memo.resolve(child))
            .logical_exprs()
            .into_iter()
            .filter_map(|id| {
                let scan = memo.expr(id);
                let Operator::Logical(LogicalOp::Scan { table, predicate, .. }) = &scan.op
                else {
                    return None;
                };
                // a pushed predicate may read columns the projection drops
                let mut columns = needed.clone();
                for column in predicate.iter().flat_map(|p| p.columns()) {
                    if !columns.contains(column) {
                        columns.push(column.clone());
                    }
                }
                if scan_columns_cover(&scan.op, &columns) {
                    return None;
                }
                Some(RuleResult::NewChildren(
                    Operator::Logical(project.clone()),
                    vec![RuleChild::NewExpr(
                        Operator::Logical(LogicalOp::Scan {
                            table: table.clone(),
                            columns,
                            predicate: predicate.clone(),
                        }),
                        vec![],
                    )],
                ))
            })
            .collect()
    }
}

/// The scan already reads exactly `columns`.
fn scan_columns_cover(scan: &Operator, columns: &[ColumnRef]) -> bool {
    matches!(scan, Operator::Logical(LogicalOp::Scan { columns: existing, .. }) if existing == columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    fn project_over_scan(memo: &Memo) -> std::sync::Arc<GroupExpression> {
        let tree = OperatorTree::new(
            Operator::Logical(LogicalOp::Project {
                exprs: vec![Expr::column("t", "a"), Expr::column("t", "a")],
                aliases: vec!["a".into(), "a2".into()],
            }),
            vec![OperatorTree::scan(TableRef::new("s", "t"))],
        );
        let root = memo.insert_tree(&tree).unwrap();
        memo.expr(memo.group(root).logical_exprs()[0])
    }

    #[test]
    fn test_project_gets_narrow_scan() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let project = project_over_scan(&memo);

        let results = ProjectionPushdownRule.apply(&project, &memo, &OptContext { catalog: &catalog });
        let [RuleResult::NewChildren(op, children)] = &results[..] else {
            panic!("expected one alternative, got {results:?}");
        };
        assert_eq!(op, &project.op);
        assert!(matches!(
            &children[..],
            [RuleChild::NewExpr(Operator::Logical(LogicalOp::Scan { columns, .. }), _)] if columns.len() == 1
        ));
    }

    #[test]
    fn test_narrow_scan_is_not_narrowed_again() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let ctx = OptContext { catalog: &catalog };
        let project = project_over_scan(&memo);
        let Some(RuleResult::NewChildren(op, children)) = ProjectionPushdownRule.apply(&project, &memo, &ctx).pop()
        else {
            panic!("expected an alternative");
        };
        let RuleChild::NewExpr(scan_op, _) = &children[0] else {
            panic!("expected a new scan");
        };
        let (scan_group, _) = memo.add_expr(scan_op.clone(), vec![]).unwrap();
        let (_, narrowed) = memo.add_expr(op, vec![scan_group]).unwrap();

        assert!(ProjectionPushdownRule.apply(&memo.expr(narrowed), &memo, &ctx).is_empty());
    }
}
