//! Implement every logical member of a group.
//!
//! ```text
//!        +--Exploring (suspend)--+
//!        v                       |
//! Initialized -------------------+
//!     | StartedImplementation
//!     v
//! ImplementingChildren --Implemented--> Completed
//!     |        ^
//!     +--------+ Implementing (suspend)
//! ```
//!
//! A group is explored before it is implemented. Groups created by a rule after their
//! parent was explored are explored here on demand.

use super::expr_implementation::GroupExpressionImplementationJob;
use super::group_exploration::GroupExplorationJob;
use super::state_machine::JobStateMachine;
use super::{Job, JobTask, MemberCursor};
use crate::error::Result;
use crate::group::Group;
use crate::memo::GroupId;
use crate::scheduler::SchedulerContext;
use crate::state::SearchState;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplementationState {
    Initialized,
    ImplementingChildren,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplementationEvent {
    Exploring,
    StartedImplementation,
    Implementing,
    Implemented,
}

#[derive(Debug)]
pub struct GroupImplementationJob {
    cursor: MemberCursor,
    state: ImplementationState,
}

impl GroupImplementationJob {
    fn new(group: GroupId) -> Self {
        Self {
            cursor: MemberCursor::new(group),
            state: ImplementationState::Initialized,
        }
    }

    /// Schedule implementation of `group` under `parent` unless it is implemented already.
    pub(crate) fn schedule(ctx: &SchedulerContext<'_>, group: GroupId, parent: &Arc<Job>) -> bool {
        let memo = ctx.engine.memo();
        let group = memo.group(memo.resolve(group));
        if group.state(memo.epoch()).is_implemented() {
            return false;
        }
        let job = ctx.factory.create(
            JobTask::GroupImplementation(Self::new(group.id)),
            Some(group.implementation_queue.clone()),
        );
        ctx.scheduler.add(job, Some(parent));
        true
    }

    fn start(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ImplementationEvent {
        let memo = ctx.engine.memo();
        let group = memo.group(self.cursor.resolve(memo));
        if !group.state(memo.epoch()).is_explored() && GroupExplorationJob::schedule(ctx, group.id, job) {
            return ImplementationEvent::Exploring;
        }
        group.advance(memo.epoch(), SearchState::Implementing);
        ImplementationEvent::StartedImplementation
    }

    fn implement_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ImplementationEvent {
        let memo = ctx.engine.memo();
        loop {
            let exprs = self.cursor.next_batch(memo, Group::logical_exprs_from);
            if exprs.is_empty() {
                break;
            }
            let scheduled = exprs
                .into_iter()
                .filter(|expr| GroupExpressionImplementationJob::schedule(ctx, *expr, job))
                .count();
            if scheduled > 0 {
                return ImplementationEvent::Implementing;
            }
        }

        let group = memo.group(self.cursor.group);
        group.advance(memo.epoch(), SearchState::Implemented);
        trace!(group = group.id, physical = group.physical_exprs().len(), "group implemented");
        if memo.is_root(group.id) {
            ctx.engine.finalize_implementation();
        }
        ImplementationEvent::Implemented
    }
}

impl JobStateMachine for GroupImplementationJob {
    type State = ImplementationState;
    type Event = ImplementationEvent;

    const NAME: &'static str = "GroupImplementation";
    const COMPLETED: ImplementationState = ImplementationState::Completed;
    const TRANSITIONS: &'static [(ImplementationState, ImplementationEvent, ImplementationState)] = &[
        (
            ImplementationState::Initialized,
            ImplementationEvent::Exploring,
            ImplementationState::Initialized,
        ),
        (
            ImplementationState::Initialized,
            ImplementationEvent::StartedImplementation,
            ImplementationState::ImplementingChildren,
        ),
        (
            ImplementationState::ImplementingChildren,
            ImplementationEvent::Implementing,
            ImplementationState::ImplementingChildren,
        ),
        (
            ImplementationState::ImplementingChildren,
            ImplementationEvent::Implemented,
            ImplementationState::Completed,
        ),
    ];

    fn state(&self) -> ImplementationState {
        self.state
    }

    fn set_state(&mut self, state: ImplementationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ImplementationEvent> {
        Ok(match self.state {
            ImplementationState::Initialized => self.start(job, ctx),
            ImplementationState::ImplementingChildren => self.implement_children(job, ctx),
            ImplementationState::Completed => unreachable!("completed jobs are not executed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::state_machine::transition;
    use super::*;

    #[test]
    fn test_exploring_suspends_in_place() {
        assert_eq!(
            transition::<GroupImplementationJob>(ImplementationState::Initialized, ImplementationEvent::Exploring).ok(),
            Some(ImplementationState::Initialized)
        );
        assert_eq!(
            transition::<GroupImplementationJob>(
                ImplementationState::ImplementingChildren,
                ImplementationEvent::Implemented
            )
            .ok(),
            Some(ImplementationState::Completed)
        );
    }
}
