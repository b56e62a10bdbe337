//! # Memo
//!
//! The memo stores every expression the search has discovered, grouped into equivalence
//! classes. Groups and group expressions live in append-only arenas addressed by `u32`
//! ids, so ids stay valid for the lifetime of the memo and can be shared freely between
//! worker threads.
//!
//! ## Deduplication
//!
//! A concurrent table maps `(operator, resolved child groups)` to the expression id.
//! Inserting an expression that already exists returns the existing one. If the caller
//! wanted it in a different group, the two groups are equivalent and get marked as
//! duplicates: the higher id points at the lower one (its *master*).
//!
//! ## Merging
//!
//! [`Memo::mark_duplicates`] folds the duplicate into its master on the spot, whether
//! jobs are running or not: live members move to the master, and the master adopts the
//! duplicate's optimization contexts (or, where it already has one for the same key,
//! takes over the duplicate's best plan). Jobs resolve group ids to their master on
//! access and rescan the master once they notice the move.
//!
//! A merge can make further expressions equal. Finding those needs a rebuilt expression
//! table, so [`Memo::group_merge`] alternates folding and [`Memo::rehash`] until no new
//! duplicate groups appear. It must run while no job touches the memo (the engine calls
//! it once exploration of the root has finished).
//!
//! ## Lock order
//!
//! expression table shard, then the merge lock, then arena locks, then a group's member
//! lock or context map. Arena locks are never held while touching the table. Inserting
//! into a group and registering a context take the merge lock shared; folding takes it
//! exclusively, so nothing lands in a group while it is being folded.

use crate::context::{CostContext, OptimizationContext};
use crate::cost::Cost;
use crate::error::{OptimizerError, Result};
use crate::expr::{Operator, OperatorTree, PhysicalOp};
use crate::group::Group;
use crate::group_expression::{GroupExpression, OptimizationLevel};
use crate::properties::PhysicalPropertySet;
use crate::tree_map::PlanTreeMap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub type GroupId = u32;
pub type ExprId = u32;

type ExprKey = (Operator, Vec<GroupId>);

/// Outcome of [`Memo::insert_expr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    /// Group that holds the expression (resolved to its master).
    pub group: GroupId,
    pub expr: ExprId,
    /// False if an equal expression already existed.
    pub inserted: bool,
}

pub struct Memo {
    groups: RwLock<Vec<Arc<Group>>>,
    exprs: RwLock<Vec<Arc<GroupExpression>>>,
    table: DashMap<ExprKey, ExprId>,
    root: RwLock<Option<GroupId>>,
    merge_lock: RwLock<()>,
    epoch: AtomicU32,
    context_ids: AtomicU32,
    max_groups: usize,
}

impl Default for Memo {
    fn default() -> Self {
        Self::new()
    }
}

impl Memo {
    pub fn new() -> Self {
        Self::with_max_groups(usize::MAX)
    }

    /// Memo that refuses to grow past `max_groups` groups.
    pub fn with_max_groups(max_groups: usize) -> Self {
        Self {
            groups: RwLock::new(Vec::new()),
            exprs: RwLock::new(Vec::new()),
            table: DashMap::new(),
            root: RwLock::new(None),
            merge_lock: RwLock::new(()),
            epoch: AtomicU32::new(0),
            context_ids: AtomicU32::new(0),
            max_groups,
        }
    }

    pub fn group(&self, id: GroupId) -> Arc<Group> {
        self.groups.read()[id as usize].clone()
    }

    pub fn expr(&self, id: ExprId) -> Arc<GroupExpression> {
        self.exprs.read()[id as usize].clone()
    }

    /// Group `id`, or `None` if the memo has no such group.
    pub fn get_group(&self, id: GroupId) -> Option<Arc<Group>> {
        self.groups.read().get(id as usize).cloned()
    }

    fn checked_group(&self, id: GroupId) -> Result<Arc<Group>> {
        self.get_group(id)
            .ok_or_else(|| OptimizerError::MalformedExpression(format!("unknown group {id}")))
    }

    pub fn groups(&self) -> Vec<Arc<Group>> {
        self.groups.read().clone()
    }

    pub fn exprs(&self) -> Vec<Arc<GroupExpression>> {
        self.exprs.read().clone()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.read().len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.read().len()
    }

    /// Root group, resolved to its master.
    pub fn root(&self) -> Option<GroupId> {
        let root = *self.root.read();
        root.map(|r| self.resolve(r))
    }

    pub fn set_root(&self, group: GroupId) {
        *self.root.write() = Some(group);
    }

    pub fn is_root(&self, group: GroupId) -> bool {
        self.root() == Some(self.resolve(group))
    }

    /// Current lifecycle epoch; see `state`.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Restart every group and expression lifecycle for a new search stage.
    pub fn reset_group_states(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for group in self.groups() {
            group.reset_group_state();
        }
        debug!(epoch, "reset group states");
    }

    /// Reopen the per-stage job queues of every group and expression. Quiescent only.
    pub(crate) fn reset_job_queues(&self) {
        for group in self.groups() {
            group.reset_job_queues();
        }
        for expr in self.exprs() {
            expr.reset_job_queues();
        }
    }

    /// Drop parked jobs everywhere after an aborted run.
    pub(crate) fn abandon_job_queues(&self) {
        for group in self.groups() {
            group.abandon_job_queues();
        }
        for expr in self.exprs() {
            expr.abandon_job_queues();
        }
    }

    /// Follow duplicate pointers to the master group.
    pub fn resolve(&self, group: GroupId) -> GroupId {
        let groups = self.groups.read();
        let mut current = group;
        // pointers always go to a lower id, so the chain is bounded
        for _ in 0..groups.len() {
            match groups.get(current as usize).and_then(|g| g.duplicate()) {
                Some(master) if master != current => current = master,
                _ => break,
            }
        }
        current
    }

    fn new_group(&self) -> Result<GroupId> {
        let mut groups = self.groups.write();
        if groups.len() >= self.max_groups {
            return Err(OptimizerError::MemoExhausted { limit: self.max_groups });
        }
        let id = groups.len() as GroupId;
        groups.push(Arc::new(Group::new(id)));
        Ok(id)
    }

    /// Insert `op` over `children`, into `target` or into a fresh group when `None`.
    ///
    /// Idempotent: an equal expression (same operator, same resolved children) is
    /// returned instead of inserted. If it lives in a group other than `target`, the two
    /// groups are marked as duplicates.
    pub fn insert_expr(
        &self,
        op: Operator,
        children: Vec<GroupId>,
        target: Option<GroupId>,
        level: OptimizationLevel,
    ) -> Result<InsertResult> {
        if children.len() != op.arity() {
            return Err(OptimizerError::MalformedExpression(format!(
                "{op} expects {} children, got {}",
                op.arity(),
                children.len()
            )));
        }
        let num_groups = self.num_groups();
        if let Some(bad) = children.iter().chain(target.iter()).find(|g| **g as usize >= num_groups) {
            return Err(OptimizerError::MalformedExpression(format!("unknown group {bad}")));
        }

        let resolved: Vec<GroupId> = children.iter().map(|c| self.resolve(*c)).collect();
        let existing = match self.table.entry((op, resolved)) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let _merging = self.merge_lock.read();
                let group = match target {
                    Some(t) => self.resolve(t),
                    None => self.new_group()?,
                };
                let (op, children) = entry.key().clone();
                let logical = op.is_logical();
                let expr = {
                    let mut exprs = self.exprs.write();
                    let id = exprs.len() as ExprId;
                    exprs.push(Arc::new(GroupExpression::new(id, op, children, group, level)));
                    id
                };
                self.group(group).add_expr(expr, logical);
                entry.insert(expr);
                trace!(group, expr, "inserted group expression");
                return Ok(InsertResult {
                    group,
                    expr,
                    inserted: true,
                });
            }
        };

        let found = self.resolve(self.expr(existing).group());
        if let Some(target) = target {
            self.mark_duplicates(target, found);
        }
        Ok(InsertResult {
            group: self.resolve(found),
            expr: existing,
            inserted: false,
        })
    }

    /// Insert an expression into a new (or existing equal) group.
    pub fn add_expr(&self, op: Operator, children: Vec<GroupId>) -> Result<(GroupId, ExprId)> {
        let r = self.insert_expr(op, children, None, OptimizationLevel::Low)?;
        Ok((r.group, r.expr))
    }

    /// Insert an expression into `group`.
    pub fn add_expr_to_group(&self, group: GroupId, op: Operator, children: Vec<GroupId>) -> Result<ExprId> {
        Ok(self.insert_expr(op, children, Some(group), OptimizationLevel::Low)?.expr)
    }

    /// Insert an operator tree bottom-up, returning the group of its root.
    pub fn insert_tree(&self, tree: &OperatorTree) -> Result<GroupId> {
        let children = tree
            .children
            .iter()
            .map(|child| self.insert_tree(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.add_expr(tree.op.clone(), children)?.0)
    }

    /// Record that groups `a` and `b` are equivalent and fold the higher resolved id into
    /// the lower one, which stays master.
    pub fn mark_duplicates(&self, a: GroupId, b: GroupId) {
        let _merging = self.merge_lock.write();
        let (a, b) = (self.resolve(a), self.resolve(b));
        if a == b {
            return;
        }
        let (master, duplicate) = (a.min(b), a.max(b));
        let duplicate = self.group(duplicate);
        duplicate.set_duplicate(master);
        let moved = self.fold(&duplicate, master);
        debug!(master, duplicate = duplicate.id, moved, "merged duplicate group");
    }

    /// Move the live members and contexts of `duplicate` into `master`. Returns the number
    /// of members moved. Caller holds the merge lock exclusively.
    fn fold(&self, duplicate: &Group, master: GroupId) -> usize {
        let target = self.group(master);
        for (key, oc) in duplicate.take_contexts() {
            target.adopt_context(key, oc);
        }
        let (logical, physical) = duplicate.take_exprs();
        for id in logical.iter().chain(physical.iter()) {
            let expr = self.expr(*id);
            expr.set_group(master);
            target.add_expr(*id, expr.is_logical());
        }
        logical.len() + physical.len()
    }

    /// Rehash and fold until no new duplicate groups appear. Returns the number of groups
    /// found equal along the way. Must not run concurrently with jobs.
    pub fn group_merge(&self) -> usize {
        let before = self.duplicate_group_count();
        while self.rehash() {}
        if let Some(root) = self.root() {
            self.set_root(root);
        }
        let merged = self.duplicate_group_count() - before;
        if merged > 0 {
            debug!(merged, groups = self.num_groups(), "merged duplicate groups");
        }
        merged
    }

    /// Context for `(required, stage)` on the master of `group`, registering a new one if
    /// none exists. At most one context exists per resolved group and key.
    pub fn insert_context(&self, group: GroupId, required: &PhysicalPropertySet, stage: usize) -> Arc<OptimizationContext> {
        let _merging = self.merge_lock.read();
        self.group(self.resolve(group))
            .insert_context(required, stage, &self.context_ids)
    }

    /// Registered context for `(required, stage)` on the master of `group`.
    pub fn lookup_context(&self, group: GroupId, required: &PhysicalPropertySet, stage: usize) -> Option<Arc<OptimizationContext>> {
        let _merging = self.merge_lock.read();
        self.group(self.resolve(group)).lookup_context(required, stage)
    }

    /// Rebuild the expression table from resolved child ids. Expressions that became
    /// equal move to their group's duplicate list; returns true if new duplicate groups
    /// were found. Must not run concurrently with jobs.
    pub fn rehash(&self) -> bool {
        self.table.clear();
        let mut new_duplicates = false;
        for expr in self.exprs() {
            if expr.duplicate_of().is_some() {
                continue;
            }
            let key = (expr.op.clone(), expr.children.iter().map(|c| self.resolve(*c)).collect());
            let found = match self.table.entry(key) {
                Entry::Vacant(entry) => {
                    entry.insert(expr.id);
                    continue;
                }
                Entry::Occupied(entry) => *entry.get(),
            };

            expr.mark_duplicate(found);
            let group = expr.group();
            self.group(group).move_to_duplicates(expr.id);
            let found_group = self.expr(found).group();
            if self.resolve(group) != self.resolve(found_group) {
                self.mark_duplicates(group, found_group);
                new_duplicates = true;
            }
        }
        new_duplicates
    }

    /// Groups that were merged into a master.
    pub fn duplicate_group_count(&self) -> usize {
        self.groups().iter().filter(|g| g.is_duplicate()).count()
    }

    /// Live expressions, excluding those folded into duplicate lists.
    pub fn expression_count(&self) -> usize {
        self.groups().iter().map(|g| g.expr_count()).sum()
    }

    /// Emit the memo contents at trace level.
    pub fn trace(&self) {
        trace!("memo:\n{self}");
    }

    /// Best plan for `group` under `required`, over all stages.
    pub fn extract_plan(&self, group: GroupId, required: &PhysicalPropertySet) -> Result<PlanNode> {
        let oc = self.best_context(group, required)?;
        self.extract_plan_from_context(&oc)
    }

    /// Context holding the cheapest plan for `group` under `required`, over all stages.
    pub fn best_context(&self, group: GroupId, required: &PhysicalPropertySet) -> Result<Arc<OptimizationContext>> {
        let group = self.resolve(group);
        self.checked_group(group)?
            .lookup_best_context(required)
            .ok_or(OptimizerError::NoPlanFound { group })
    }

    /// Every plan alternative recorded under `oc`, ranked from cheapest; see `tree_map`.
    pub fn build_tree_map(&self, oc: &Arc<OptimizationContext>) -> PlanTreeMap {
        PlanTreeMap::build(self, oc)
    }

    /// Plan rooted at the best cost context of `oc`.
    pub fn extract_plan_from_context(&self, oc: &OptimizationContext) -> Result<PlanNode> {
        let no_plan = || OptimizerError::NoPlanFound { group: oc.group };
        let best: Arc<CostContext> = oc.best().ok_or_else(no_plan)?;
        if !best.is_valid(&oc.required) {
            return Err(no_plan());
        }
        let expr = self.expr(best.expr);
        let op = expr
            .op
            .as_physical()
            .cloned()
            .ok_or_else(|| OptimizerError::MalformedExpression(format!("best expression {} is logical", expr.id)))?;
        let children = best
            .child_contexts
            .iter()
            .map(|child| self.extract_plan_from_context(child))
            .collect::<Result<Vec<_>>>()?;
        Ok(PlanNode {
            op,
            children,
            cost: best.cost,
            delivered: best.delivered.clone(),
            group: self.resolve(oc.group),
        })
    }
}

impl fmt::Display for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root();
        for group in self.groups() {
            write!(f, "Group {}", group.id)?;
            if root == Some(group.id) {
                write!(f, " (root)")?;
            }
            if let Some(master) = group.duplicate() {
                write!(f, " (duplicate of {master})")?;
            }
            writeln!(f, ":")?;
            for id in group.logical_exprs().into_iter().chain(group.physical_exprs()) {
                writeln!(f, "  {}", self.expr(id))?;
            }
            for oc in group.contexts() {
                writeln!(
                    f,
                    "  ctx {} stage {} best {:?} cost {}",
                    oc.id,
                    oc.stage,
                    group.best_expression(&oc),
                    oc.best_cost().unwrap_or_else(Cost::infinite)
                )?;
            }
        }
        Ok(())
    }
}

/// A node of an extracted physical plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub op: PhysicalOp,
    pub children: Vec<PlanNode>,
    /// Accumulated cost of the subtree.
    pub cost: Cost,
    pub delivered: PhysicalPropertySet,
    pub group: GroupId,
}

impl PlanNode {
    /// Indented multi-line rendering.
    pub fn display(&self, indent: usize) -> String {
        let mut out = format!("{}{} (cost={})\n", "  ".repeat(indent), self.op, self.cost);
        for child in &self.children {
            out.push_str(&child.display(indent + 1));
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(PlanNode::node_count).sum::<usize>()
    }

    /// Pre-order walk.
    pub fn iter(&self) -> Vec<&PlanNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.iter());
        }
        out
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, JoinType, LogicalOp, TableRef};

    fn scan(name: &str) -> OperatorTree {
        OperatorTree::scan(TableRef::new("s", name))
    }

    fn join(l: OperatorTree, r: OperatorTree) -> OperatorTree {
        OperatorTree::join(JoinType::Inner, Expr::column("a", "x"), l, r)
    }

    #[test]
    fn test_insert_tree_is_idempotent() {
        let memo = Memo::new();
        let tree = join(scan("a"), scan("b"));
        let first = memo.insert_tree(&tree).unwrap();
        let groups = memo.num_groups();
        let second = memo.insert_tree(&tree).unwrap();
        assert_eq!(first, second);
        assert_eq!(memo.num_groups(), groups);
        assert_eq!(memo.num_exprs(), 3);
    }

    #[test]
    fn test_identical_subtrees_share_a_group() {
        let memo = Memo::new();
        let root = memo.insert_tree(&join(scan("a"), scan("a"))).unwrap();
        let expr = memo.expr(memo.group(root).logical_exprs()[0]);
        assert_eq!(expr.children[0], expr.children[1]);
    }

    #[test]
    fn test_insert_into_other_group_marks_duplicates() {
        let memo = Memo::new();
        let a = memo.insert_tree(&scan("a")).unwrap();
        let b = memo.insert_tree(&scan("b")).unwrap();
        let op = memo.expr(memo.group(a).logical_exprs()[0]).op.clone();
        let result = memo.insert_expr(op, vec![], Some(b), OptimizationLevel::Low).unwrap();
        assert!(!result.inserted);
        assert_eq!(memo.resolve(b), a);
        assert!(memo.group(b).is_duplicate_of(a));
    }

    #[test]
    fn test_group_merge_folds_duplicates_to_fixed_point() {
        let memo = Memo::new();
        let a = memo.insert_tree(&scan("a")).unwrap();
        let b = memo.insert_tree(&scan("b")).unwrap();
        let filter = Operator::Logical(LogicalOp::Filter {
            predicate: Expr::column("a", "x"),
        });
        let over_a = memo.add_expr(filter.clone(), vec![a]).unwrap().0;
        let over_b = memo.add_expr(filter, vec![b]).unwrap().0;
        memo.set_root(over_b);

        // a and b become equivalent, which makes the two filters equal as well
        memo.mark_duplicates(a, b);
        memo.group_merge();

        assert_eq!(memo.resolve(over_b), memo.resolve(over_a));
        assert_eq!(memo.root(), Some(over_a));
        assert_eq!(memo.duplicate_group_count(), 2);
        assert_eq!(memo.expression_count(), 3);
    }

    #[test]
    fn test_plan_for_unknown_group_is_an_error() {
        let memo = Memo::new();
        memo.insert_tree(&scan("a")).unwrap();
        let err = memo.extract_plan(42, &PhysicalPropertySet::any()).unwrap_err();
        assert!(matches!(err, OptimizerError::MalformedExpression(_)));
    }

    #[test]
    fn test_memo_exhaustion() {
        let memo = Memo::with_max_groups(2);
        let err = memo.insert_tree(&join(scan("a"), scan("b"))).unwrap_err();
        assert_eq!(err, OptimizerError::MemoExhausted { limit: 2 });
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let memo = Memo::new();
        let filter = Operator::Logical(LogicalOp::Filter {
            predicate: Expr::column("a", "x"),
        });
        assert!(matches!(memo.add_expr(filter, vec![]), Err(OptimizerError::MalformedExpression(_))));
    }

    #[test]
    fn test_epoch_reset() {
        let memo = Memo::new();
        let g = memo.insert_tree(&scan("a")).unwrap();
        memo.group(g).advance(memo.epoch(), crate::state::SearchState::Explored);
        memo.reset_group_states();
        assert_eq!(memo.group(g).state(memo.epoch()), crate::state::SearchState::Unexplored);
    }
}
