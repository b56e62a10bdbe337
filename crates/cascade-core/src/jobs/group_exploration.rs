//! Explore every logical member of a group.
//!
//! ```text
//! Initialized --StartedExploration--> ExploringChildren --Explored--> Completed
//!                                      |        ^
//!                                      +--------+ NewChildren (suspend)
//! ```
//!
//! Members added while the job runs are picked up by rescanning from the last position,
//! so the group only becomes `Explored` once no unexplored member is left.

use super::expr_exploration::GroupExpressionExplorationJob;
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
pub enum ExplorationState {
    Initialized,
    ExploringChildren,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorationEvent {
    StartedExploration,
    NewChildren,
    Explored,
}

#[derive(Debug)]
pub struct GroupExplorationJob {
    cursor: MemberCursor,
    state: ExplorationState,
}

impl GroupExplorationJob {
    fn new(group: GroupId) -> Self {
        Self {
            cursor: MemberCursor::new(group),
            state: ExplorationState::Initialized,
        }
    }

    /// Schedule exploration of `group` under `parent` unless it is explored already.
    pub(crate) fn schedule(ctx: &SchedulerContext<'_>, group: GroupId, parent: &Arc<Job>) -> bool {
        let memo = ctx.engine.memo();
        let group = memo.group(memo.resolve(group));
        if group.state(memo.epoch()).is_explored() {
            return false;
        }
        let job = ctx.factory.create(
            JobTask::GroupExploration(Self::new(group.id)),
            Some(group.exploration_queue.clone()),
        );
        ctx.scheduler.add(job, Some(parent));
        true
    }

    fn explore_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ExplorationEvent> {
        let memo = ctx.engine.memo();
        loop {
            let exprs = self.cursor.next_batch(memo, Group::logical_exprs_from);
            if exprs.is_empty() {
                break;
            }
            let scheduled = exprs
                .into_iter()
                .filter(|expr| GroupExpressionExplorationJob::schedule(ctx, *expr, job))
                .count();
            if scheduled > 0 {
                return Ok(ExplorationEvent::NewChildren);
            }
        }

        let group = memo.group(self.cursor.group);
        group.advance(memo.epoch(), SearchState::Explored);
        trace!(group = group.id, "group explored");
        if memo.is_root(group.id) {
            ctx.engine.finalize_exploration();
        }
        Ok(ExplorationEvent::Explored)
    }
}

impl JobStateMachine for GroupExplorationJob {
    type State = ExplorationState;
    type Event = ExplorationEvent;

    const NAME: &'static str = "GroupExploration";
    const COMPLETED: ExplorationState = ExplorationState::Completed;
    const TRANSITIONS: &'static [(ExplorationState, ExplorationEvent, ExplorationState)] = &[
        (
            ExplorationState::Initialized,
            ExplorationEvent::StartedExploration,
            ExplorationState::ExploringChildren,
        ),
        (
            ExplorationState::ExploringChildren,
            ExplorationEvent::NewChildren,
            ExplorationState::ExploringChildren,
        ),
        (
            ExplorationState::ExploringChildren,
            ExplorationEvent::Explored,
            ExplorationState::Completed,
        ),
    ];

    fn state(&self) -> ExplorationState {
        self.state
    }

    fn set_state(&mut self, state: ExplorationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ExplorationEvent> {
        match self.state {
            ExplorationState::Initialized => {
                let memo = ctx.engine.memo();
                let group = self.cursor.resolve(memo);
                memo.group(group).advance(memo.epoch(), SearchState::Exploring);
                Ok(ExplorationEvent::StartedExploration)
            }
            ExplorationState::ExploringChildren => self.explore_children(job, ctx),
            ExplorationState::Completed => unreachable!("completed jobs are not executed"),
        }
    }
}
