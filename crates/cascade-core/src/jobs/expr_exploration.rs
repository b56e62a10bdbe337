//! Explore one logical group expression: first its child groups, then the expression
//! itself by applying every applicable transformation rule.
//!
//! ```text
//! Initialized --ChildrenExplored--> ChildrenExplored --SelfExplored--> SelfExplored --Finalized--> Completed
//!   ^   |                             ^   |
//!   +---+ ExploringChildren           +---+ ExploringSelf
//! ```

use super::group_exploration::GroupExplorationJob;
use super::state_machine::JobStateMachine;
use super::transformation::TransformationJob;
use super::{Job, JobTask};
use crate::error::Result;
use crate::memo::ExprId;
use crate::rule::RuleType;
use crate::scheduler::SchedulerContext;
use crate::state::SearchState;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprExplorationState {
    Initialized,
    ChildrenExplored,
    SelfExplored,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprExplorationEvent {
    ExploringChildren,
    ChildrenExplored,
    ExploringSelf,
    SelfExplored,
    Finalized,
}

#[derive(Debug)]
pub struct GroupExpressionExplorationJob {
    expr: ExprId,
    children_scheduled: bool,
    self_scheduled: bool,
    state: ExprExplorationState,
}

impl GroupExpressionExplorationJob {
    fn new(expr: ExprId) -> Self {
        Self {
            expr,
            children_scheduled: false,
            self_scheduled: false,
            state: ExprExplorationState::Initialized,
        }
    }

    /// Schedule exploration of `expr` under `parent` unless it is explored already or
    /// was folded into a duplicate list.
    pub(crate) fn schedule(ctx: &SchedulerContext<'_>, expr: ExprId, parent: &Arc<Job>) -> bool {
        let memo = ctx.engine.memo();
        let gexpr = memo.expr(expr);
        if gexpr.duplicate_of().is_some() || gexpr.state(memo.epoch()).is_explored() {
            return false;
        }
        let job = ctx.factory.create(
            JobTask::GroupExpressionExploration(Self::new(expr)),
            Some(gexpr.exploration_queue.clone()),
        );
        ctx.scheduler.add(job, Some(parent));
        true
    }

    fn explore_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ExprExplorationEvent {
        if self.children_scheduled {
            return ExprExplorationEvent::ChildrenExplored;
        }
        self.children_scheduled = true;
        let memo = ctx.engine.memo();
        let gexpr = memo.expr(self.expr);
        gexpr.advance(memo.epoch(), SearchState::Exploring);

        let own = memo.resolve(gexpr.group());
        let mut scheduled = 0;
        for child in &gexpr.children {
            let child = memo.resolve(*child);
            if child != own && GroupExplorationJob::schedule(ctx, child, job) {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            ExprExplorationEvent::ExploringChildren
        } else {
            ExprExplorationEvent::ChildrenExplored
        }
    }

    fn explore_self(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ExprExplorationEvent {
        if self.self_scheduled {
            return ExprExplorationEvent::SelfExplored;
        }
        self.self_scheduled = true;
        let gexpr = ctx.engine.memo().expr(self.expr);
        if TransformationJob::schedule_applicable(ctx, &gexpr, RuleType::Transformation, job) > 0 {
            ExprExplorationEvent::ExploringSelf
        } else {
            ExprExplorationEvent::SelfExplored
        }
    }
}

impl JobStateMachine for GroupExpressionExplorationJob {
    type State = ExprExplorationState;
    type Event = ExprExplorationEvent;

    const NAME: &'static str = "GroupExpressionExploration";
    const COMPLETED: ExprExplorationState = ExprExplorationState::Completed;
    const TRANSITIONS: &'static [(ExprExplorationState, ExprExplorationEvent, ExprExplorationState)] = &[
        (
            ExprExplorationState::Initialized,
            ExprExplorationEvent::ExploringChildren,
            ExprExplorationState::Initialized,
        ),
        (
            ExprExplorationState::Initialized,
            ExprExplorationEvent::ChildrenExplored,
            ExprExplorationState::ChildrenExplored,
        ),
        (
            ExprExplorationState::ChildrenExplored,
            ExprExplorationEvent::ExploringSelf,
            ExprExplorationState::ChildrenExplored,
        ),
        (
            ExprExplorationState::ChildrenExplored,
            ExprExplorationEvent::SelfExplored,
            ExprExplorationState::SelfExplored,
        ),
        (
            ExprExplorationState::SelfExplored,
            ExprExplorationEvent::Finalized,
            ExprExplorationState::Completed,
        ),
    ];

    fn state(&self) -> ExprExplorationState {
        self.state
    }

    fn set_state(&mut self, state: ExprExplorationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ExprExplorationEvent> {
        Ok(match self.state {
            ExprExplorationState::Initialized => self.explore_children(job, ctx),
            ExprExplorationState::ChildrenExplored => self.explore_self(job, ctx),
            ExprExplorationState::SelfExplored => {
                let memo = ctx.engine.memo();
                memo.expr(self.expr).advance(memo.epoch(), SearchState::Explored);
                ExprExplorationEvent::Finalized
            }
            ExprExplorationState::Completed => unreachable!("completed jobs are not executed"),
        })
    }
}
