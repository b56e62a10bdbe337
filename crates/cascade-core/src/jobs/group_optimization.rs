//! Find the cheapest plan of a group for one optimization context.
//!
//! ```text
//! Initialized --Implemented--> OptimizingChildren --OptimizedCurrentLevel--> DampingOptimizationLevel
//!   ^   |                          ^   |                                         |          |
//!   +---+ Implementing             +---+ Optimizing            Optimizing        |          | Optimized
//!                                  +-------------------------------------------+          v
//!                                                                                      Completed
//! ```
//!
//! Physical members are optimized level by level: all `High` members first, then the
//! level is damped to `Low` and the remaining members (including any enforcers added in
//! the meantime) are optimized. The context is `Optimized` once the lowest level is done.
//!
//! If the group is folded into another one meanwhile, the job continues on the master.
//! When it completes, a better plan it found is handed to the context the master has
//! registered for the same request.

use super::expr_optimization::GroupExpressionOptimizationJob;
use super::group_implementation::GroupImplementationJob;
use super::state_machine::JobStateMachine;
use super::{Job, JobFactory, JobTask, MemberCursor};
use crate::context::{ContextState, OptimizationContext};
use crate::error::Result;
use crate::group::Group;
use crate::group_expression::OptimizationLevel;
use crate::scheduler::SchedulerContext;
use crate::state::SearchState;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationState {
    Initialized,
    OptimizingChildren,
    DampingOptimizationLevel,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationEvent {
    Implementing,
    Implemented,
    Optimizing,
    OptimizedCurrentLevel,
    Optimized,
}

#[derive(Debug)]
pub struct GroupOptimizationJob {
    oc: Arc<OptimizationContext>,
    level: OptimizationLevel,
    cursor: MemberCursor,
    state: OptimizationState,
}

impl GroupOptimizationJob {
    fn new(oc: Arc<OptimizationContext>) -> Self {
        Self {
            cursor: MemberCursor::new(oc.group),
            oc,
            level: OptimizationLevel::High,
            state: OptimizationState::Initialized,
        }
    }

    /// Job optimizing `oc`, deduplicated through the context's queue.
    pub(crate) fn create(factory: &JobFactory, oc: Arc<OptimizationContext>) -> Arc<Job> {
        let queue = oc.optimization_queue.clone();
        factory.create(JobTask::GroupOptimization(Self::new(oc)), Some(queue))
    }

    /// Schedule optimization of `oc` under `parent` unless it is optimized already.
    pub(crate) fn schedule(ctx: &SchedulerContext<'_>, oc: &Arc<OptimizationContext>, parent: &Arc<Job>) -> bool {
        if oc.state() == ContextState::Optimized {
            return false;
        }
        ctx.scheduler.add(Self::create(ctx.factory, oc.clone()), Some(parent));
        true
    }

    fn start(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> OptimizationEvent {
        let memo = ctx.engine.memo();
        let group = self.cursor.resolve(memo);
        if !memo.group(group).state(memo.epoch()).is_implemented() && GroupImplementationJob::schedule(ctx, group, job) {
            return OptimizationEvent::Implementing;
        }
        memo.group(group).advance(memo.epoch(), SearchState::Optimizing);
        self.oc.advance(ContextState::Optimizing);
        OptimizationEvent::Implemented
    }

    fn optimize_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> OptimizationEvent {
        let memo = ctx.engine.memo();
        let mut scheduled = 0;
        loop {
            let exprs = self.cursor.next_batch(memo, Group::physical_exprs_from);
            if exprs.is_empty() {
                break;
            }
            scheduled += exprs
                .into_iter()
                .filter(|id| memo.expr(*id).level == self.level)
                .filter(|id| GroupExpressionOptimizationJob::schedule(ctx, *id, &self.oc, job))
                .count();
            if scheduled > 0 {
                return OptimizationEvent::Optimizing;
            }
        }
        OptimizationEvent::OptimizedCurrentLevel
    }

    fn damp(&mut self, ctx: &SchedulerContext<'_>) -> OptimizationEvent {
        if let Some(level) = ctx.engine.damp_level(self.level) {
            self.level = level;
            self.cursor.restart();
            return OptimizationEvent::Optimizing;
        }
        let memo = ctx.engine.memo();
        let group = memo.group(self.cursor.resolve(memo));
        if let Some(registered) = memo.lookup_context(group.id, &self.oc.required, self.oc.stage) {
            if !Arc::ptr_eq(&registered, &self.oc) {
                if let Some(best) = self.oc.best() {
                    group.update_best_cost(&registered, &best);
                }
            }
        }
        self.oc.advance(ContextState::Optimized);
        group.advance(memo.epoch(), SearchState::Optimized);
        trace!(group = group.id, oc = self.oc.id, cost = ?self.oc.best_cost(), "context optimized");
        OptimizationEvent::Optimized
    }
}

impl JobStateMachine for GroupOptimizationJob {
    type State = OptimizationState;
    type Event = OptimizationEvent;

    const NAME: &'static str = "GroupOptimization";
    const COMPLETED: OptimizationState = OptimizationState::Completed;
    const TRANSITIONS: &'static [(OptimizationState, OptimizationEvent, OptimizationState)] = &[
        (
            OptimizationState::Initialized,
            OptimizationEvent::Implementing,
            OptimizationState::Initialized,
        ),
        (
            OptimizationState::Initialized,
            OptimizationEvent::Implemented,
            OptimizationState::OptimizingChildren,
        ),
        (
            OptimizationState::OptimizingChildren,
            OptimizationEvent::Optimizing,
            OptimizationState::OptimizingChildren,
        ),
        (
            OptimizationState::OptimizingChildren,
            OptimizationEvent::OptimizedCurrentLevel,
            OptimizationState::DampingOptimizationLevel,
        ),
        (
            OptimizationState::DampingOptimizationLevel,
            OptimizationEvent::Optimizing,
            OptimizationState::OptimizingChildren,
        ),
        (
            OptimizationState::DampingOptimizationLevel,
            OptimizationEvent::Optimized,
            OptimizationState::Completed,
        ),
    ];

    fn state(&self) -> OptimizationState {
        self.state
    }

    fn set_state(&mut self, state: OptimizationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<OptimizationEvent> {
        Ok(match self.state {
            OptimizationState::Initialized => self.start(job, ctx),
            OptimizationState::OptimizingChildren => self.optimize_children(job, ctx),
            OptimizationState::DampingOptimizationLevel => self.damp(ctx),
            OptimizationState::Completed => unreachable!("completed jobs are not executed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::state_machine::transition;
    use super::*;

    #[test]
    fn test_damping_returns_to_optimizing_children() {
        let next = transition::<GroupOptimizationJob>(
            OptimizationState::DampingOptimizationLevel,
            OptimizationEvent::Optimizing,
        );
        assert_eq!(next.ok(), Some(OptimizationState::OptimizingChildren));
        let done = transition::<GroupOptimizationJob>(
            OptimizationState::DampingOptimizationLevel,
            OptimizationEvent::Optimized,
        );
        assert_eq!(done.ok(), Some(OptimizationState::Completed));
    }
}
