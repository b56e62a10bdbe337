//! # Optimization and Cost Contexts
//!
//! An [`OptimizationContext`] is one optimization request: a group, the physical
//! properties its parent requires, and the search stage. At most one exists per
//! (group, required properties, stage); see `Memo::insert_context`.
//!
//! A [`CostContext`] is the result of optimizing one physical group expression under one
//! optimization context: the child contexts it was optimized against, the properties the
//! resulting plan delivers, and its cost. Each optimization context keeps the cheapest
//! cost context seen so far as its best plan.

use crate::cost::Cost;
use crate::job_queue::JobQueue;
use crate::memo::{ExprId, GroupId};
use crate::properties::PhysicalPropertySet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub type OcId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextState {
    Unoptimized = 0,
    Optimizing = 1,
    Optimized = 2,
}

pub struct OptimizationContext {
    pub id: OcId,
    pub group: GroupId,
    pub required: PhysicalPropertySet,
    pub stage: usize,
    best: Mutex<Option<Arc<CostContext>>>,
    state: AtomicU8,
    /// Deduplicates group optimization jobs for this context.
    pub(crate) optimization_queue: Arc<JobQueue>,
}

impl OptimizationContext {
    pub fn new(id: OcId, group: GroupId, required: PhysicalPropertySet, stage: usize) -> Self {
        Self {
            id,
            group,
            required,
            stage,
            best: Mutex::new(None),
            state: AtomicU8::new(ContextState::Unoptimized as u8),
            optimization_queue: Arc::new(JobQueue::new()),
        }
    }

    pub fn state(&self) -> ContextState {
        match self.state.load(Ordering::Acquire) {
            0 => ContextState::Unoptimized,
            1 => ContextState::Optimizing,
            _ => ContextState::Optimized,
        }
    }

    /// Monotonic.
    pub fn advance(&self, state: ContextState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub fn best(&self) -> Option<Arc<CostContext>> {
        self.best.lock().clone()
    }

    pub fn best_cost(&self) -> Option<Cost> {
        self.best.lock().as_ref().map(|cc| cc.cost)
    }

    /// Install `candidate` as the best plan if it beats the current one.
    /// Equal costs are broken by the lower expression id so the winner is deterministic.
    pub fn try_update_best(&self, candidate: &Arc<CostContext>) -> bool {
        let mut best = self.best.lock();
        let better = match best.as_ref() {
            None => true,
            Some(current) => candidate.is_better_than(current),
        };
        if better {
            *best = Some(candidate.clone());
        }
        better
    }
}

impl fmt::Debug for OptimizationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationContext")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("required", &self.required)
            .field("stage", &self.stage)
            .field("state", &self.state())
            .field("best", &self.best_cost())
            .finish()
    }
}

/// Costed plan alternative for one (group expression, optimization context) pair.
#[derive(Debug)]
pub struct CostContext {
    pub expr: ExprId,
    pub context: OcId,
    /// One per child, in child order.
    pub child_contexts: Vec<Arc<OptimizationContext>>,
    pub cost: Cost,
    pub delivered: PhysicalPropertySet,
}

impl CostContext {
    pub fn is_better_than(&self, other: &CostContext) -> bool {
        self.cost < other.cost || (self.cost == other.cost && self.expr < other.expr)
    }

    /// Delivers what `required` asks for at a finite cost.
    pub fn is_valid(&self, required: &PhysicalPropertySet) -> bool {
        !self.cost.is_infinite() && required.satisfied_by(&self.delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(expr: ExprId, cost: f64) -> Arc<CostContext> {
        Arc::new(CostContext {
            expr,
            context: 0,
            child_contexts: vec![],
            cost: Cost::new(cost),
            delivered: PhysicalPropertySet::any(),
        })
    }

    #[test]
    fn test_best_cost_ties_prefer_lower_expr() {
        let oc = OptimizationContext::new(0, 0, PhysicalPropertySet::any(), 0);
        assert!(oc.try_update_best(&cc(7, 10.0)));
        assert!(!oc.try_update_best(&cc(9, 10.0)));
        assert!(oc.try_update_best(&cc(3, 10.0)));
        assert!(oc.try_update_best(&cc(8, 5.0)));
        assert_eq!(oc.best().map(|b| b.expr), Some(8));
    }

    #[test]
    fn test_context_state_is_monotonic() {
        let oc = OptimizationContext::new(0, 0, PhysicalPropertySet::any(), 0);
        oc.advance(ContextState::Optimized);
        oc.advance(ContextState::Optimizing);
        assert_eq!(oc.state(), ContextState::Optimized);
    }
}
