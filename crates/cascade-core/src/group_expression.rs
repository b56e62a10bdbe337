//! # Group Expressions
//!
//! A group expression is one operator whose inputs are groups, not expressions. Child
//! group ids are stored as inserted; they may later resolve to a different master group
//! after a merge (see `Memo::resolve`).
//!
//! Besides the operator, each group expression tracks:
//! - its lifecycle state (epoch tagged, see `state`),
//! - the rules already applied to it, so a rule fires at most once per expression
//!   across all search stages,
//! - one cost context per optimization context it was optimized for,
//! - the job queues that deduplicate exploration, implementation and optimization jobs.

use crate::context::{CostContext, OcId};
use crate::expr::Operator;
use crate::job_queue::JobQueue;
use crate::memo::{ExprId, GroupId};
use crate::state::{SearchState, StateCell};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Priority of a group expression during optimization.
///
/// Group optimization costs `High` expressions first and only then damps down to `Low`.
/// Every expression inherits the level of the rule that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OptimizationLevel {
    #[default]
    Low,
    High,
}

impl OptimizationLevel {
    /// Next lower level, `None` below `Low`.
    pub fn damp(self) -> Option<Self> {
        match self {
            OptimizationLevel::High => Some(OptimizationLevel::Low),
            OptimizationLevel::Low => None,
        }
    }
}

pub struct GroupExpression {
    pub id: ExprId,
    pub op: Operator,
    pub children: Vec<GroupId>,
    pub level: OptimizationLevel,
    group: AtomicU32,
    state: StateCell,
    duplicate_of: OnceLock<ExprId>,
    applied_rules: Mutex<HashSet<u64>>,
    cost_contexts: DashMap<OcId, Arc<CostContext>>,
    pub(crate) exploration_queue: Arc<JobQueue>,
    pub(crate) implementation_queue: Arc<JobQueue>,
    optimization_queues: DashMap<OcId, Arc<JobQueue>>,
}

impl GroupExpression {
    pub fn new(id: ExprId, op: Operator, children: Vec<GroupId>, group: GroupId, level: OptimizationLevel) -> Self {
        Self {
            id,
            op,
            children,
            level,
            group: AtomicU32::new(group),
            state: StateCell::new(),
            duplicate_of: OnceLock::new(),
            applied_rules: Mutex::new(HashSet::new()),
            cost_contexts: DashMap::new(),
            exploration_queue: Arc::new(JobQueue::new()),
            implementation_queue: Arc::new(JobQueue::new()),
            optimization_queues: DashMap::new(),
        }
    }

    /// Owning group. Changes when a duplicate group is merged into its master.
    pub fn group(&self) -> GroupId {
        self.group.load(Ordering::Acquire)
    }

    pub(crate) fn set_group(&self, group: GroupId) {
        self.group.store(group, Ordering::Release);
    }

    pub fn state(&self, epoch: u32) -> SearchState {
        self.state.get(epoch)
    }

    pub fn advance(&self, epoch: u32, state: SearchState) -> bool {
        self.state.advance(epoch, state)
    }

    pub fn is_logical(&self) -> bool {
        self.op.is_logical()
    }

    pub fn is_physical(&self) -> bool {
        self.op.is_physical()
    }

    pub fn arity(&self) -> usize {
        self.children.len()
    }

    /// Expression this one was found equal to during a rehash.
    pub fn duplicate_of(&self) -> Option<ExprId> {
        self.duplicate_of.get().copied()
    }

    pub(crate) fn mark_duplicate(&self, of: ExprId) {
        let _ = self.duplicate_of.set(of);
    }

    /// Claim rule `hash` for this expression. True only for the first caller.
    pub fn try_mark_rule(&self, hash: u64) -> bool {
        self.applied_rules.lock().insert(hash)
    }

    pub fn rule_applied(&self, hash: u64) -> bool {
        self.applied_rules.lock().contains(&hash)
    }

    pub fn applied_rule_count(&self) -> usize {
        self.applied_rules.lock().len()
    }

    pub fn cost_context(&self, oc: OcId) -> Option<Arc<CostContext>> {
        self.cost_contexts.get(&oc).map(|cc| cc.clone())
    }

    /// Cost context for `oc`, built by `compute` the first time it is asked for.
    pub fn cost_context_or_insert_with(&self, oc: OcId, compute: impl FnOnce() -> CostContext) -> Arc<CostContext> {
        self.cost_contexts
            .entry(oc)
            .or_insert_with(|| Arc::new(compute()))
            .clone()
    }

    pub fn cost_context_count(&self) -> usize {
        self.cost_contexts.len()
    }

    /// Queue deduplicating optimization of this expression under `oc`.
    pub(crate) fn optimization_queue(&self, oc: OcId) -> Arc<JobQueue> {
        self.optimization_queues
            .entry(oc)
            .or_insert_with(|| Arc::new(JobQueue::new()))
            .clone()
    }

    pub(crate) fn reset_job_queues(&self) {
        self.exploration_queue.reset();
        self.implementation_queue.reset();
    }

    pub(crate) fn abandon_job_queues(&self) {
        self.exploration_queue.abandon();
        self.implementation_queue.abandon();
        self.optimization_queues.iter().for_each(|q| q.abandon());
    }
}

impl fmt::Debug for GroupExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupExpression")
            .field("id", &self.id)
            .field("group", &self.group())
            .field("op", &self.op)
            .field("children", &self.children)
            .field("level", &self.level)
            .finish()
    }
}

impl fmt::Display for GroupExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.op)?;
        if !self.children.is_empty() {
            let children: Vec<String> = self.children.iter().map(|c| c.to_string()).collect();
            write!(f, " [{}]", children.join(" "))?;
        }
        Ok(())
    }
}
