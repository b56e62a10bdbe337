//! Implement one logical group expression: first its child groups, then the expression
//! itself by applying every applicable implementation rule.
//!
//! ```text
//! Initialized --ChildrenImplemented--> ChildrenImplemented --SelfImplemented--> SelfImplemented --Finalized--> Completed
//!   ^   |                                ^   |
//!   +---+ ImplementingChildren           +---+ ImplementingSelf
//! ```

use super::group_implementation::GroupImplementationJob;
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
pub enum ExprImplementationState {
    Initialized,
    ChildrenImplemented,
    SelfImplemented,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprImplementationEvent {
    ImplementingChildren,
    ChildrenImplemented,
    ImplementingSelf,
    SelfImplemented,
    Finalized,
}

#[derive(Debug)]
pub struct GroupExpressionImplementationJob {
    expr: ExprId,
    children_scheduled: bool,
    self_scheduled: bool,
    state: ExprImplementationState,
}

impl GroupExpressionImplementationJob {
    fn new(expr: ExprId) -> Self {
        Self {
            expr,
            children_scheduled: false,
            self_scheduled: false,
            state: ExprImplementationState::Initialized,
        }
    }

    /// Schedule implementation of `expr` under `parent` unless it is implemented already
    /// or was folded into a duplicate list.
    pub(crate) fn schedule(ctx: &SchedulerContext<'_>, expr: ExprId, parent: &Arc<Job>) -> bool {
        let memo = ctx.engine.memo();
        let gexpr = memo.expr(expr);
        if gexpr.duplicate_of().is_some() || gexpr.state(memo.epoch()).is_implemented() {
            return false;
        }
        let job = ctx.factory.create(
            JobTask::GroupExpressionImplementation(Self::new(expr)),
            Some(gexpr.implementation_queue.clone()),
        );
        ctx.scheduler.add(job, Some(parent));
        true
    }

    fn implement_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ExprImplementationEvent {
        if self.children_scheduled {
            return ExprImplementationEvent::ChildrenImplemented;
        }
        self.children_scheduled = true;
        let memo = ctx.engine.memo();
        let gexpr = memo.expr(self.expr);
        gexpr.advance(memo.epoch(), SearchState::Implementing);

        let own = memo.resolve(gexpr.group());
        let mut scheduled = 0;
        for child in &gexpr.children {
            let child = memo.resolve(*child);
            if child != own && GroupImplementationJob::schedule(ctx, child, job) {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            ExprImplementationEvent::ImplementingChildren
        } else {
            ExprImplementationEvent::ChildrenImplemented
        }
    }

    fn implement_self(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ExprImplementationEvent {
        if self.self_scheduled {
            return ExprImplementationEvent::SelfImplemented;
        }
        self.self_scheduled = true;
        let gexpr = ctx.engine.memo().expr(self.expr);
        if TransformationJob::schedule_applicable(ctx, &gexpr, RuleType::Implementation, job) > 0 {
            ExprImplementationEvent::ImplementingSelf
        } else {
            ExprImplementationEvent::SelfImplemented
        }
    }
}

impl JobStateMachine for GroupExpressionImplementationJob {
    type State = ExprImplementationState;
    type Event = ExprImplementationEvent;

    const NAME: &'static str = "GroupExpressionImplementation";
    const COMPLETED: ExprImplementationState = ExprImplementationState::Completed;
    const TRANSITIONS: &'static [(ExprImplementationState, ExprImplementationEvent, ExprImplementationState)] = &[
        (
            ExprImplementationState::Initialized,
            ExprImplementationEvent::ImplementingChildren,
            ExprImplementationState::Initialized,
        ),
        (
            ExprImplementationState::Initialized,
            ExprImplementationEvent::ChildrenImplemented,
            ExprImplementationState::ChildrenImplemented,
        ),
        (
            ExprImplementationState::ChildrenImplemented,
            ExprImplementationEvent::ImplementingSelf,
            ExprImplementationState::ChildrenImplemented,
        ),
        (
            ExprImplementationState::ChildrenImplemented,
            ExprImplementationEvent::SelfImplemented,
            ExprImplementationState::SelfImplemented,
        ),
        (
            ExprImplementationState::SelfImplemented,
            ExprImplementationEvent::Finalized,
            ExprImplementationState::Completed,
        ),
    ];

    fn state(&self) -> ExprImplementationState {
        self.state
    }

    fn set_state(&mut self, state: ExprImplementationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ExprImplementationEvent> {
        Ok(match self.state {
            ExprImplementationState::Initialized => self.implement_children(job, ctx),
            ExprImplementationState::ChildrenImplemented => self.implement_self(job, ctx),
            ExprImplementationState::SelfImplemented => {
                let memo = ctx.engine.memo();
                memo.expr(self.expr).advance(memo.epoch(), SearchState::Implemented);
                ExprImplementationEvent::Finalized
            }
            ExprImplementationState::Completed => unreachable!("completed jobs are not executed"),
        })
    }
}
