//! # Join Associativity Rule
//!
//! The identity for inner joins: `(A JOIN_1 B) JOIN_2 C = A JOIN_1 (B JOIN_2 C)`.
//!
//! Associativity changes the *shape* of the join tree (left-deep, right-deep, bushy).
//! Together with commutativity it reaches every join order of a connected join graph,
//! which matters for queries with many tables (TPC-H Q5 joins six).
//!
//! ## New Groups
//!
//! The rule returns [`RuleResult::NewChildren`]: the reassociated inner join `B ⋈ C` is a
//! [`RuleChild::NewExpr`]. The engine creates a group for it, or finds the existing group
//! if an equal join was produced before, in which case the groups are merged.
//!
//! ## Condition Handling
//!
//! The outer join's condition is split into:
//!
//! 1. **B-C predicates**: conjuncts whose columns all come from B and C. These move to
//!    the new inner join.
//! 2. **Remaining predicates**: these stay on the new outer join, together with the
//!    original inner condition.
//!
//! The rule only fires if there is at least one B-C predicate, so it never introduces a
//! cross join. Conditions are rebuilt in a canonical conjunct order, so reassociating
//! the same tables along different paths yields equal operators the memo deduplicates.
//!
//! ## Both Orientations
//!
//! - `(A ⋈₁ B) ⋈₂ C → A ⋈ (B ⋈ C)` when `cond₂` connects B and C
//! - `(A ⋈₁ B) ⋈₂ C → B ⋈ (A ⋈ C)` when `cond₂` connects A and C
//!
//! Every inner join of the left child group is a binding, so joins added to that group by
//! earlier rule applications are reassociated too.
//!
//! Only inner joins are reassociated. Outer join associativity has validity constraints
//! this rule does not check.

use cascade_core::expr::*;
use cascade_core::group_expression::GroupExpression;
use cascade_core::memo::{GroupId, Memo};
use cascade_core::pattern::Pattern;
use cascade_core::rule::{OptContext, Rule, RuleChild, RuleResult, RuleType};
use std::collections::HashSet;
use tracing::trace;

/// Join associativity: `(A ⋈₁ B) ⋈₂ C → A ⋈ (B ⋈ C)`.
pub struct JoinAssociativityRule;

impl Rule for JoinAssociativityRule {
    fn name(&self) -> &str {
        "JoinAssociativity"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Transformation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join_join_left()
    }

    fn apply(&self, expr: &GroupExpression, memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let Operator::Logical(LogicalOp::Join {
            join_type: JoinType::Inner,
            condition: outer_cond,
        }) = &expr.op
        else {
            return vec![];
        };
        let [inner_group, c_group] = expr.children[..] else {
            return vec![];
        };
        let inner_group = memo.resolve(inner_group);
        let c_group = memo.resolve(c_group);
        let c_tables = collect_table_names(memo, c_group);

        let mut results = Vec::new();
        for (left_group, right_group, inner_cond) in inner_joins(memo, inner_group) {
            let left_tables = collect_table_names(memo, left_group);
            let right_tables = collect_table_names(memo, right_group);

            // left ⋈ (right ⋈ C)
            results.extend(try_reassociate(
                outer_cond,
                &inner_cond,
                left_group,
                right_group,
                c_group,
                &right_tables,
                &c_tables,
            ));
            // right ⋈ (left ⋈ C)
            results.extend(try_reassociate(
                outer_cond,
                &inner_cond,
                right_group,
                left_group,
                c_group,
                &left_tables,
                &c_tables,
            ));
        }
        trace!(expr = expr.id, alternatives = results.len(), "reassociated join");
        results
    }
}

/// Binary inner joins of `group`: (left, right, condition).
fn inner_joins(memo: &Memo, group: GroupId) -> Vec<(GroupId, GroupId, Expr)> {
    memo.group(group)
        .logical_exprs()
        .into_iter()
        .filter_map(|id| {
            let e = memo.expr(id);
            match (&e.op, &e.children[..]) {
                (
                    Operator::Logical(LogicalOp::Join {
                        join_type: JoinType::Inner,
                        condition,
                    }),
                    [left, right],
                ) => Some((memo.resolve(*left), memo.resolve(*right), condition.clone())),
                _ => None,
            }
        })
        .collect()
}

/// `(stay ⋈_inner_cond moving) ⋈_outer_cond c` → `stay ⋈ (moving ⋈ c)`.
///
/// `None` unless the outer condition has a predicate connecting `moving` with `c`.
fn try_reassociate(
    outer_cond: &Expr,
    inner_cond: &Expr,
    stay_group: GroupId,
    move_group: GroupId,
    c_group: GroupId,
    move_tables: &HashSet<String>,
    c_tables: &HashSet<String>,
) -> Option<RuleResult> {
    let mut new_inner_preds = Vec::new();
    let mut remaining_outer_preds = Vec::new();

    for pred in outer_cond.conjuncts() {
        let tables = referenced_tables(pred);
        let all_in_move_or_c = tables.iter().all(|t| move_tables.contains(t) || c_tables.contains(t));
        let has_move = tables.iter().any(|t| move_tables.contains(t));
        let has_c = tables.iter().any(|t| c_tables.contains(t));

        if all_in_move_or_c && has_move && has_c {
            new_inner_preds.push(pred.clone());
        } else {
            remaining_outer_preds.push(pred.clone());
        }
    }

    let new_inner_cond = make_conjunction(new_inner_preds)?;

    // moving's columns are still visible above the new inner join
    let mut outer_parts: Vec<Expr> = inner_cond.conjuncts().into_iter().cloned().collect();
    outer_parts.extend(remaining_outer_preds);
    let new_outer_cond = make_conjunction(outer_parts)?;

    Some(RuleResult::NewChildren(
        Operator::Logical(LogicalOp::Join {
            join_type: JoinType::Inner,
            condition: new_outer_cond,
        }),
        vec![
            RuleChild::Group(stay_group),
            RuleChild::NewExpr(
                Operator::Logical(LogicalOp::Join {
                    join_type: JoinType::Inner,
                    condition: new_inner_cond,
                }),
                vec![RuleChild::Group(move_group), RuleChild::Group(c_group)],
            ),
        ],
    ))
}

/// AND of `preds` in canonical order without repeats; `None` for no predicates.
fn make_conjunction(mut preds: Vec<Expr>) -> Option<Expr> {
    preds.sort_by_cached_key(|p| p.to_string());
    preds.dedup();
    Expr::from_conjuncts(preds)
}

fn referenced_tables(expr: &Expr) -> HashSet<String> {
    expr.columns().into_iter().filter_map(|c| c.table.clone()).collect()
}

/// Names of the tables scanned below `group_id`.
fn collect_table_names(memo: &Memo, group_id: GroupId) -> HashSet<String> {
    let mut tables = HashSet::new();
    collect_table_names_recursive(memo, group_id, &mut tables, &mut HashSet::new());
    tables
}

fn collect_table_names_recursive(
    memo: &Memo,
    group_id: GroupId,
    tables: &mut HashSet<String>,
    visited: &mut HashSet<GroupId>,
) {
    let group_id = memo.resolve(group_id);
    if !visited.insert(group_id) {
        return;
    }

    for expr_id in memo.group(group_id).logical_exprs() {
        let expr = memo.expr(expr_id);
        match &expr.op {
            Operator::Logical(LogicalOp::Scan { table, .. }) => {
                tables.insert(table.name.clone());
            }
            _ => {
                for &child in &expr.children {
                    collect_table_names_recursive(memo, child, tables, visited);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::catalog::InMemoryCatalog;

    fn eq_cond(left_table: &str, left_col: &str, right_table: &str, right_col: &str) -> Expr {
        Expr::equals(Expr::column(left_table, left_col), Expr::column(right_table, right_col))
    }

    fn scan(name: &str) -> OperatorTree {
        OperatorTree::scan(TableRef::new("s", name))
    }

    #[test]
    fn test_collect_table_names() {
        let memo = Memo::new();
        let g_ab = memo
            .insert_tree(&OperatorTree::join(JoinType::Inner, eq_cond("A", "x", "B", "y"), scan("A"), scan("B")))
            .unwrap();
        let tables = collect_table_names(&memo, g_ab);
        assert_eq!(tables, HashSet::from(["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn test_try_reassociate_valid() {
        // (A ⋈_{A.x=B.y} B) ⋈_{B.z=C.w} C  →  A ⋈_{A.x=B.y} (B ⋈_{B.z=C.w} C)
        let inner_cond = eq_cond("A", "x", "B", "y");
        let outer_cond = eq_cond("B", "z", "C", "w");
        let move_tables = HashSet::from(["B".to_string()]);
        let c_tables = HashSet::from(["C".to_string()]);

        let result = try_reassociate(&outer_cond, &inner_cond, 0, 1, 2, &move_tables, &c_tables);
        let Some(RuleResult::NewChildren(Operator::Logical(LogicalOp::Join { condition, .. }), children)) = result
        else {
            panic!("expected a reassociated join");
        };
        assert_eq!(condition, inner_cond);
        assert!(matches!(&children[0], RuleChild::Group(0)));
        assert!(matches!(
            &children[1],
            RuleChild::NewExpr(Operator::Logical(LogicalOp::Join { condition, .. }), _) if *condition == outer_cond
        ));
    }

    #[test]
    fn test_try_reassociate_needs_connecting_predicate() {
        // the outer condition connects A with C, so B cannot move next to C
        let inner_cond = eq_cond("A", "x", "B", "y");
        let outer_cond = eq_cond("A", "z", "C", "w");
        let b = HashSet::from(["B".to_string()]);
        let a = HashSet::from(["A".to_string()]);
        let c = HashSet::from(["C".to_string()]);

        assert!(try_reassociate(&outer_cond, &inner_cond, 0, 1, 2, &b, &c).is_none());
        assert!(try_reassociate(&outer_cond, &inner_cond, 1, 0, 2, &a, &c).is_some());
    }

    #[test]
    fn test_conjunction_is_canonical() {
        let p1 = eq_cond("A", "x", "B", "y");
        let p2 = eq_cond("A", "z", "C", "w");
        assert_eq!(make_conjunction(vec![p1.clone()]), Some(p1.clone()));
        assert_eq!(
            make_conjunction(vec![p1.clone(), p2.clone()]),
            make_conjunction(vec![p2.clone(), p1.clone(), p2])
        );
        assert_eq!(make_conjunction(vec![]), None);
    }

    #[test]
    fn test_apply_on_left_deep_join() {
        let memo = Memo::new();
        let catalog = InMemoryCatalog::new();
        let tree = OperatorTree::join(
            JoinType::Inner,
            eq_cond("B", "z", "C", "w"),
            OperatorTree::join(JoinType::Inner, eq_cond("A", "x", "B", "y"), scan("A"), scan("B")),
            scan("C"),
        );
        let root = memo.insert_tree(&tree).unwrap();
        let expr = memo.expr(memo.group(root).logical_exprs()[0]);

        let results = JoinAssociativityRule.apply(&expr, &memo, &OptContext { catalog: &catalog });
        assert_eq!(results.len(), 1);
    }
}
