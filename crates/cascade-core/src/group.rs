//! # Groups
//!
//! A group is an equivalence class: every member expression produces the same result.
//! Members are split into logical and physical expressions. Expressions found to be
//! exact duplicates during a rehash move to a separate duplicate list and are no longer
//! scheduled.
//!
//! ## Derived data
//!
//! - **Statistics** and **logical properties** are computed at most once per group
//!   (`OnceLock`), from the first logical expression. Concurrent requesters wait for the
//!   single computation instead of repeating it.
//! - **Optimization contexts** live in a concurrent map keyed by
//!   `(required properties, stage)`; `insert_context` returns the existing context when
//!   one is already registered, so at most one exists per key. Callers go through
//!   `Memo::insert_context`, which registers on the master group.
//!
//! ## Duplicates
//!
//! When two groups are found equivalent, the one with the higher id records the other as
//! its master (`duplicate`) and is folded into it right away: its members move to the
//! master and its contexts are adopted by it (see `Memo::mark_duplicates`).

use crate::catalog::Catalog;
use crate::context::{CostContext, OcId, OptimizationContext};
use crate::expr::{ColumnRef, Expr, JoinType, LogicalOp, Operator};
use crate::job_queue::JobQueue;
use crate::memo::{ExprId, GroupId, Memo};
use crate::properties::{LogicalProperties, PhysicalPropertySet};
use crate::state::{SearchState, StateCell};
use crate::stats::{Statistics, StatsDerivation};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::trace;

/// Required properties and search stage of an optimization context.
pub type ContextKey = (PhysicalPropertySet, usize);

#[derive(Debug, Default)]
struct GroupInner {
    logical_exprs: Vec<ExprId>,
    physical_exprs: Vec<ExprId>,
    duplicate_exprs: Vec<ExprId>,
    has_new_logical: bool,
}

pub struct Group {
    pub id: GroupId,
    inner: Mutex<GroupInner>,
    state: StateCell,
    duplicate: Mutex<Option<GroupId>>,
    stats: OnceLock<Statistics>,
    logical_props: OnceLock<LogicalProperties>,
    contexts: DashMap<ContextKey, Arc<OptimizationContext>>,
    pub(crate) exploration_queue: Arc<JobQueue>,
    pub(crate) implementation_queue: Arc<JobQueue>,
}

impl Group {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            inner: Mutex::new(GroupInner::default()),
            state: StateCell::new(),
            duplicate: Mutex::new(None),
            stats: OnceLock::new(),
            logical_props: OnceLock::new(),
            contexts: DashMap::new(),
            exploration_queue: Arc::new(JobQueue::new()),
            implementation_queue: Arc::new(JobQueue::new()),
        }
    }

    pub fn logical_exprs(&self) -> Vec<ExprId> {
        self.inner.lock().logical_exprs.clone()
    }

    pub fn physical_exprs(&self) -> Vec<ExprId> {
        self.inner.lock().physical_exprs.clone()
    }

    pub fn duplicate_exprs(&self) -> Vec<ExprId> {
        self.inner.lock().duplicate_exprs.clone()
    }

    /// Logical expressions at positions `start..`, for jobs that rescan incrementally.
    pub fn logical_exprs_from(&self, start: usize) -> Vec<ExprId> {
        self.inner.lock().logical_exprs.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Physical expressions at positions `start..`.
    pub fn physical_exprs_from(&self, start: usize) -> Vec<ExprId> {
        self.inner.lock().physical_exprs.get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Live (non-duplicate) member count.
    pub fn expr_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.logical_exprs.len() + inner.physical_exprs.len()
    }

    pub(crate) fn add_expr(&self, expr: ExprId, logical: bool) {
        let mut inner = self.inner.lock();
        if logical {
            inner.logical_exprs.push(expr);
            inner.has_new_logical = true;
        } else {
            inner.physical_exprs.push(expr);
        }
    }

    /// Take every live member out of the group, logical first.
    pub(crate) fn take_exprs(&self) -> (Vec<ExprId>, Vec<ExprId>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.logical_exprs),
            std::mem::take(&mut inner.physical_exprs),
        )
    }

    pub(crate) fn move_to_duplicates(&self, expr: ExprId) {
        let mut inner = self.inner.lock();
        inner.logical_exprs.retain(|e| *e != expr);
        inner.physical_exprs.retain(|e| *e != expr);
        inner.duplicate_exprs.push(expr);
    }

    pub fn state(&self, epoch: u32) -> SearchState {
        self.state.get(epoch)
    }

    pub fn advance(&self, epoch: u32, state: SearchState) -> bool {
        self.state.advance(epoch, state)
    }

    /// Logical operators were added since the last stage reset.
    pub fn has_new_logical_operators(&self) -> bool {
        self.inner.lock().has_new_logical
    }

    /// Clear per-stage flags. The lifecycle state itself restarts through the memo epoch.
    pub fn reset_group_state(&self) {
        self.inner.lock().has_new_logical = false;
    }

    pub(crate) fn reset_job_queues(&self) {
        self.exploration_queue.reset();
        self.implementation_queue.reset();
    }

    pub(crate) fn abandon_job_queues(&self) {
        self.exploration_queue.abandon();
        self.implementation_queue.abandon();
        for oc in self.contexts.iter() {
            oc.optimization_queue.abandon();
        }
    }

    /// Master group this one was found equivalent to, if any.
    pub fn duplicate(&self) -> Option<GroupId> {
        *self.duplicate.lock()
    }

    pub(crate) fn set_duplicate(&self, master: GroupId) {
        *self.duplicate.lock() = Some(master);
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate().is_some()
    }

    /// This group directly points at `master`.
    pub fn is_duplicate_of(&self, master: GroupId) -> bool {
        self.duplicate() == Some(master)
    }

    /// Same group, or one directly recorded as the other's duplicate, or both sharing a master.
    /// Transitive chains are resolved by `Memo::resolve`.
    pub fn matches_group(&self, other: &Group) -> bool {
        if self.id == other.id || self.is_duplicate_of(other.id) || other.is_duplicate_of(self.id) {
            return true;
        }
        matches!((self.duplicate(), other.duplicate()), (Some(a), Some(b)) if a == b)
    }

    pub fn stats(&self) -> Option<&Statistics> {
        self.stats.get()
    }

    /// Estimated cardinality, once statistics have been derived.
    pub fn row_count(&self) -> Option<f64> {
        self.stats.get().map(|s| s.row_count)
    }

    /// Statistics of this group, deriving them (and any missing child statistics) first.
    ///
    /// The derivation callback runs at most once per group. A group without logical
    /// expressions yields placeholder statistics that are not cached.
    pub fn derive_stats_recursive(
        &self,
        memo: &Memo,
        derivation: &dyn StatsDerivation,
        catalog: &dyn Catalog,
    ) -> Statistics {
        let mut visiting = HashSet::new();
        self.derive_stats_inner(memo, derivation, catalog, &mut visiting)
    }

    fn derive_stats_inner(
        &self,
        memo: &Memo,
        derivation: &dyn StatsDerivation,
        catalog: &dyn Catalog,
        visiting: &mut HashSet<GroupId>,
    ) -> Statistics {
        if let Some(stats) = self.stats.get() {
            return stats.clone();
        }
        let Some(&first) = self.inner.lock().logical_exprs.first() else {
            return Statistics::unknown();
        };
        if !visiting.insert(self.id) {
            // cyclic through a merged group, cannot be derived from this path
            return Statistics::unknown();
        }

        let expr = memo.expr(first);
        let child_stats: Vec<Statistics> = expr
            .children
            .iter()
            .map(|child| memo.group(memo.resolve(*child)).derive_stats_inner(memo, derivation, catalog, visiting))
            .collect();
        let child_refs: Vec<&Statistics> = child_stats.iter().collect();

        let stats = self
            .stats
            .get_or_init(|| {
                trace!(group = self.id, expr = expr.id, "deriving statistics");
                derivation.derive_stats(&expr.op, &child_refs, catalog)
            })
            .clone();
        visiting.remove(&self.id);
        stats
    }

    pub fn logical_properties(&self) -> Option<&LogicalProperties> {
        self.logical_props.get()
    }

    /// Logical properties from the first logical expression, computed once.
    pub fn derive_properties(&self, memo: &Memo, catalog: &dyn Catalog) -> LogicalProperties {
        let mut visiting = HashSet::new();
        self.derive_properties_inner(memo, catalog, &mut visiting)
    }

    fn derive_properties_inner(
        &self,
        memo: &Memo,
        catalog: &dyn Catalog,
        visiting: &mut HashSet<GroupId>,
    ) -> LogicalProperties {
        if let Some(props) = self.logical_props.get() {
            return props.clone();
        }
        let Some(&first) = self.inner.lock().logical_exprs.first() else {
            return LogicalProperties::default();
        };
        if !visiting.insert(self.id) {
            return LogicalProperties::default();
        }

        let expr = memo.expr(first);
        let children: Vec<LogicalProperties> = expr
            .children
            .iter()
            .map(|child| memo.group(memo.resolve(*child)).derive_properties_inner(memo, catalog, visiting))
            .collect();
        let output_columns = output_columns(&expr.op, &children, catalog);
        let props = self
            .logical_props
            .get_or_init(|| LogicalProperties { output_columns })
            .clone();
        visiting.remove(&self.id);
        props
    }

    pub fn lookup_context(&self, required: &PhysicalPropertySet, stage: usize) -> Option<Arc<OptimizationContext>> {
        self.contexts.get(&(required.clone(), stage)).map(|oc| oc.clone())
    }

    /// Context for `(required, stage)`, registering a new one if none exists.
    pub(crate) fn insert_context(&self, required: &PhysicalPropertySet, stage: usize, ids: &AtomicU32) -> Arc<OptimizationContext> {
        self.contexts
            .entry((required.clone(), stage))
            .or_insert_with(|| {
                let id: OcId = ids.fetch_add(1, Ordering::Relaxed);
                Arc::new(OptimizationContext::new(id, self.id, required.clone(), stage))
            })
            .clone()
    }

    /// Cheapest context for `required` across all stages that produced a plan.
    pub fn lookup_best_context(&self, required: &PhysicalPropertySet) -> Option<Arc<OptimizationContext>> {
        self.contexts
            .iter()
            .filter(|entry| entry.key().0 == *required)
            .filter_map(|entry| entry.value().best().map(|cc| (entry.value().clone(), cc)))
            .min_by(|(_, a), (_, b)| {
                if a.is_better_than(b) {
                    std::cmp::Ordering::Less
                } else if b.is_better_than(a) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .map(|(oc, _)| oc)
    }

    /// Remove every context, for folding this group into its master.
    pub(crate) fn take_contexts(&self) -> Vec<(ContextKey, Arc<OptimizationContext>)> {
        let keys: Vec<ContextKey> = self.contexts.iter().map(|e| e.key().clone()).collect();
        keys.into_iter().filter_map(|key| self.contexts.remove(&key)).collect()
    }

    /// Register a context taken from a folded duplicate. If one already exists for its
    /// key, the duplicate's best plan is offered to it instead.
    pub(crate) fn adopt_context(&self, key: ContextKey, oc: Arc<OptimizationContext>) {
        match self.contexts.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(oc);
            }
            Entry::Occupied(entry) => {
                if let Some(best) = oc.best() {
                    entry.get().try_update_best(&best);
                }
            }
        }
    }

    pub fn contexts(&self) -> Vec<Arc<OptimizationContext>> {
        self.contexts.iter().map(|oc| oc.clone()).collect()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Offer a costed plan to `oc`; true if it became the new best.
    pub fn update_best_cost(&self, oc: &OptimizationContext, candidate: &Arc<CostContext>) -> bool {
        let improved = oc.try_update_best(candidate);
        if improved {
            trace!(group = self.id, oc = oc.id, expr = candidate.expr, cost = %candidate.cost, "new best plan");
        }
        improved
    }

    /// Winning expression of `oc`, if any plan was found.
    pub fn best_expression(&self, oc: &OptimizationContext) -> Option<ExprId> {
        oc.best().map(|cc| cc.expr)
    }
}

fn output_columns(op: &Operator, children: &[LogicalProperties], catalog: &dyn Catalog) -> Vec<ColumnRef> {
    let child = |i: usize| children.get(i).map(|p| p.output_columns.clone()).unwrap_or_default();
    let Operator::Logical(logical) = op else {
        return child(0);
    };
    match logical {
        LogicalOp::Scan { table, columns, .. } => {
            if columns.is_empty() {
                catalog.get_table_columns(table).unwrap_or_default()
            } else {
                columns.clone()
            }
        }
        LogicalOp::Filter { .. } | LogicalOp::Sort { .. } | LogicalOp::Limit { .. } => child(0),
        LogicalOp::Project { aliases, .. } => aliases
            .iter()
            .enumerate()
            .map(|(i, alias)| ColumnRef {
                table: None,
                name: alias.clone(),
                index: i as u32,
            })
            .collect(),
        LogicalOp::Join { join_type, .. } => match join_type {
            JoinType::Semi | JoinType::Anti => child(0),
            _ => {
                let mut cols = child(0);
                cols.extend(child(1));
                cols
            }
        },
        LogicalOp::Aggregate { group_by, aggregates } => {
            let mut cols: Vec<ColumnRef> = group_by
                .iter()
                .filter_map(|e| match e {
                    Expr::Column(c) => Some(c.clone()),
                    _ => None,
                })
                .collect();
            let base = cols.len();
            cols.extend(aggregates.iter().enumerate().map(|(i, agg)| ColumnRef {
                table: None,
                name: format!("{:?}_{}", agg.func, i).to_lowercase(),
                index: (base + i) as u32,
            }));
            cols
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("logical_exprs", &inner.logical_exprs)
            .field("physical_exprs", &inner.physical_exprs)
            .field("duplicate_exprs", &inner.duplicate_exprs)
            .field("duplicate", &*self.duplicate.lock())
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Distribution, SortKey};

    #[test]
    fn test_insert_context_is_unique_per_key() {
        let group = Group::new(0);
        let ids = AtomicU32::new(0);
        let any = PhysicalPropertySet::any();
        let a = group.insert_context(&any, 0, &ids);
        let b = group.insert_context(&any, 0, &ids);
        let c = group.insert_context(&any, 1, &ids);
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.id, c.id);
        assert_eq!(group.context_count(), 2);
        assert!(group.lookup_context(&PhysicalPropertySet::with_distribution(Distribution::Single), 0).is_none());
    }

    #[test]
    fn test_lookup_best_context_across_stages() {
        let group = Group::new(0);
        let ids = AtomicU32::new(0);
        let sorted = PhysicalPropertySet::with_sort(vec![SortKey::asc(Expr::column("t", "a"))]);
        let first = group.insert_context(&sorted, 0, &ids);
        let second = group.insert_context(&sorted, 1, &ids);
        let plan = |expr, cost| {
            Arc::new(CostContext {
                expr,
                context: 0,
                child_contexts: vec![],
                cost: crate::cost::Cost::new(cost),
                delivered: sorted.clone(),
            })
        };
        assert!(group.update_best_cost(&first, &plan(1, 30.0)));
        assert!(group.update_best_cost(&second, &plan(2, 20.0)));
        let best = group.lookup_best_context(&sorted).map(|oc| oc.id);
        assert_eq!(best, Some(second.id));
        assert_eq!(group.best_expression(&second), Some(2));
    }

    #[test]
    fn test_row_count_follows_late_statistics() {
        use crate::catalog::InMemoryCatalog;
        use crate::expr::{ColumnRef, OperatorTree, TableRef};
        use crate::stats::DefaultStatsDerivation;

        let table = TableRef::new("s", "t");
        let mut catalog = InMemoryCatalog::new();
        catalog.add_table(&table, vec![ColumnRef::new("t", "a", 0)], Statistics::new(42.0, 4200.0));
        let memo = Memo::new();
        let group = memo.group(memo.insert_tree(&OperatorTree::scan(table)).unwrap());

        let props = group.derive_properties(&memo, &catalog);
        assert_eq!(props.output_columns.len(), 1);
        assert_eq!(group.row_count(), None);

        group.derive_stats_recursive(&memo, &DefaultStatsDerivation, &catalog);
        assert_eq!(group.row_count(), Some(42.0));
        assert_eq!(group.logical_properties(), Some(&props));
    }

    #[test]
    fn test_adopting_a_context_keeps_the_cheaper_plan() {
        let master = Group::new(0);
        let dup = Group::new(1);
        let ids = AtomicU32::new(0);
        let any = PhysicalPropertySet::any();
        let kept = master.insert_context(&any, 0, &ids);
        let folded = dup.insert_context(&any, 0, &ids);
        let plan = |expr, cost| {
            Arc::new(CostContext {
                expr,
                context: 0,
                child_contexts: vec![],
                cost: crate::cost::Cost::new(cost),
                delivered: PhysicalPropertySet::any(),
            })
        };
        kept.try_update_best(&plan(1, 50.0));
        folded.try_update_best(&plan(2, 20.0));

        for (key, oc) in dup.take_contexts() {
            master.adopt_context(key, oc);
        }
        assert_eq!(dup.context_count(), 0);
        assert_eq!(master.context_count(), 1);
        let registered = master.lookup_context(&any, 0).unwrap();
        assert!(Arc::ptr_eq(&registered, &kept));
        assert_eq!(master.best_expression(&registered), Some(2));
    }

    #[test]
    fn test_duplicate_matching() {
        let master = Group::new(1);
        let dup = Group::new(4);
        let other = Group::new(6);
        dup.set_duplicate(1);
        other.set_duplicate(1);
        assert!(dup.is_duplicate_of(1));
        assert!(master.matches_group(&dup));
        assert!(dup.matches_group(&other));
        assert!(!master.matches_group(&Group::new(2)));
    }
}
