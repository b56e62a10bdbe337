//! # Plan Enumeration
//!
//! Every cost context recorded under an optimization context is one way to build that
//! context's plan, and each of its child contexts again has alternatives of its own. A
//! [`PlanTreeMap`] links them into a tree of choices, counts the distinct plans it
//! describes and rebuilds any of them from its rank.
//!
//! Alternatives of a context are ordered by cost, ties broken by expression id. A rank
//! picks an alternative first and then decodes the remainder as one digit per child,
//! the first child being the least significant. Rank 0 takes the cheapest alternative at
//! every level, which is the plan `Memo::extract_plan` returns.
//!
//! A node rebuilt this way carries the cost of its cost context, which was computed
//! against the best plans of its children, not the alternatives picked for them.

use crate::context::{OcId, OptimizationContext};
use crate::cost::Cost;
use crate::error::{OptimizerError, Result};
use crate::expr::PhysicalOp;
use crate::memo::{ExprId, GroupId, Memo, PlanNode};
use crate::properties::PhysicalPropertySet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct Alternative {
    expr: ExprId,
    op: PhysicalOp,
    cost: Cost,
    delivered: PhysicalPropertySet,
    children: Vec<OcId>,
    count: u64,
}

#[derive(Debug)]
struct ContextNode {
    group: GroupId,
    alternatives: Vec<Alternative>,
    count: u64,
}

#[derive(Debug)]
pub struct PlanTreeMap {
    root: OcId,
    nodes: HashMap<OcId, ContextNode>,
}

impl PlanTreeMap {
    /// Link every valid cost context reachable from `oc`.
    pub fn build(memo: &Memo, oc: &Arc<OptimizationContext>) -> Self {
        let mut map = Self {
            root: oc.id,
            nodes: HashMap::new(),
        };
        let mut visiting = HashSet::new();
        map.visit(memo, oc, &mut visiting);
        debug!(oc = oc.id, contexts = map.nodes.len(), plans = map.plan_count(), "built plan tree map");
        map
    }

    fn visit(&mut self, memo: &Memo, oc: &OptimizationContext, visiting: &mut HashSet<OcId>) -> u64 {
        if let Some(node) = self.nodes.get(&oc.id) {
            return node.count;
        }
        if !visiting.insert(oc.id) {
            // a plan cannot contain itself
            return 0;
        }
        let group = memo.resolve(oc.group);
        let mut alternatives = Vec::new();
        for id in memo.group(group).physical_exprs() {
            let expr = memo.expr(id);
            let Some(cc) = expr.cost_context(oc.id) else {
                continue;
            };
            let Some(op) = expr.op.as_physical() else {
                continue;
            };
            if !cc.is_valid(&oc.required) {
                continue;
            }
            let mut count: u64 = 1;
            for child in &cc.child_contexts {
                count = count.saturating_mul(self.visit(memo, child, visiting));
            }
            if count == 0 {
                continue;
            }
            alternatives.push(Alternative {
                expr: id,
                op: op.clone(),
                cost: cc.cost,
                delivered: cc.delivered.clone(),
                children: cc.child_contexts.iter().map(|child| child.id).collect(),
                count,
            });
        }
        visiting.remove(&oc.id);
        alternatives.sort_by(|a, b| a.cost.total.total_cmp(&b.cost.total).then(a.expr.cmp(&b.expr)));
        let count = alternatives
            .iter()
            .fold(0u64, |total, alternative| total.saturating_add(alternative.count));
        self.nodes.insert(
            oc.id,
            ContextNode {
                group,
                alternatives,
                count,
            },
        );
        count
    }

    /// Number of distinct plans, saturating at `u64::MAX`.
    pub fn plan_count(&self) -> u64 {
        self.nodes.get(&self.root).map_or(0, |node| node.count)
    }

    /// Plan number `rank`, for `rank < plan_count()`.
    pub fn unrank(&self, rank: u64) -> Result<PlanNode> {
        if rank >= self.plan_count() {
            return Err(OptimizerError::NoPlanFound {
                group: self.nodes.get(&self.root).map_or(0, |node| node.group),
            });
        }
        self.unrank_context(self.root, rank)
    }

    fn unrank_context(&self, oc: OcId, mut rank: u64) -> Result<PlanNode> {
        let node = self
            .nodes
            .get(&oc)
            .ok_or_else(|| OptimizerError::MalformedExpression(format!("context {oc} missing from tree map")))?;
        for alternative in &node.alternatives {
            if rank >= alternative.count {
                rank -= alternative.count;
                continue;
            }
            let mut children = Vec::with_capacity(alternative.children.len());
            for child in &alternative.children {
                let child_count = self.nodes.get(child).map_or(0, |node| node.count).max(1);
                children.push(self.unrank_context(*child, rank % child_count)?);
                rank /= child_count;
            }
            return Ok(PlanNode {
                op: alternative.op.clone(),
                children,
                cost: alternative.cost,
                delivered: alternative.delivered.clone(),
                group: node.group,
            });
        }
        Err(OptimizerError::NoPlanFound { group: node.group })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CostContext;
    use crate::expr::{Expr, Operator, OperatorTree, TableRef};
    use crate::group_expression::OptimizationLevel;

    fn physical(memo: &Memo, op: PhysicalOp, children: Vec<GroupId>, group: GroupId) -> ExprId {
        memo.insert_expr(Operator::Physical(op), children, Some(group), OptimizationLevel::High)
            .unwrap()
            .expr
    }

    fn costed(memo: &Memo, expr: ExprId, oc: &OptimizationContext, children: Vec<Arc<OptimizationContext>>, cost: f64) {
        let cc = memo.expr(expr).cost_context_or_insert_with(oc.id, || CostContext {
            expr,
            context: oc.id,
            child_contexts: children,
            cost: Cost::new(cost),
            delivered: PhysicalPropertySet::any(),
        });
        oc.try_update_best(&cc);
    }

    fn seq_scan(table: &TableRef, predicate: Option<Expr>) -> PhysicalOp {
        PhysicalOp::SeqScan {
            table: table.clone(),
            columns: vec![],
            predicate,
        }
    }

    #[test]
    fn test_alternatives_multiply_through_children() {
        let memo = Memo::new();
        let table = TableRef::new("s", "t");
        let top = memo
            .insert_tree(&OperatorTree::filter(Expr::column("t", "x"), OperatorTree::scan(table.clone())))
            .unwrap();
        let leaf = memo.expr(memo.group(top).logical_exprs()[0]).children[0];
        let any = PhysicalPropertySet::any();
        let leaf_oc = memo.insert_context(leaf, &any, 0);
        let top_oc = memo.insert_context(top, &any, 0);

        let plain = physical(&memo, seq_scan(&table, None), vec![], leaf);
        let pushed = physical(&memo, seq_scan(&table, Some(Expr::column("t", "x"))), vec![], leaf);
        costed(&memo, plain, &leaf_oc, vec![], 5.0);
        costed(&memo, pushed, &leaf_oc, vec![], 3.0);
        for (column, cost) in [("x", 10.0), ("y", 12.0)] {
            let filter = physical(&memo, PhysicalOp::Filter { predicate: Expr::column("t", column) }, vec![leaf], top);
            costed(&memo, filter, &top_oc, vec![leaf_oc.clone()], cost);
        }

        let tree = memo.build_tree_map(&top_oc);
        assert_eq!(tree.plan_count(), 4);
        let costs: Vec<(Cost, Cost)> = (0..4)
            .map(|rank| {
                let plan = tree.unrank(rank).unwrap();
                (plan.cost, plan.children[0].cost)
            })
            .collect();
        assert_eq!(
            costs,
            vec![
                (Cost::new(10.0), Cost::new(3.0)),
                (Cost::new(10.0), Cost::new(5.0)),
                (Cost::new(12.0), Cost::new(3.0)),
                (Cost::new(12.0), Cost::new(5.0)),
            ]
        );
        assert_eq!(tree.unrank(0).unwrap().cost, memo.extract_plan(top, &any).unwrap().cost);
        assert!(matches!(tree.unrank(4), Err(OptimizerError::NoPlanFound { .. })));
    }

    #[test]
    fn test_context_without_plans_counts_zero() {
        let memo = Memo::new();
        let group = memo.insert_tree(&OperatorTree::scan(TableRef::new("s", "t"))).unwrap();
        let oc = memo.insert_context(group, &PhysicalPropertySet::any(), 0);
        let tree = memo.build_tree_map(&oc);
        assert_eq!(tree.plan_count(), 0);
        assert!(tree.unrank(0).is_err());
    }
}
