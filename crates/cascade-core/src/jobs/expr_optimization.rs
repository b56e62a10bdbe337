//! Optimize one physical group expression for one optimization context.
//!
//! ```text
//! Initialized --ChildrenOptimized--> ChildrenOptimized --EnforcedPropsChecked--> EnforcedPropsChecked
//!   ^   |   |                            |                                           |
//!   +---+   | OptimizingChildren         | Finalized                                 | Finalized
//!           | Finalized                  v                                           v
//!           +--------------------------> Completed <---------------------------------+
//! ```
//!
//! 1. Reject the expression if it cannot serve the context at all (an enforcer whose
//!    property is not required), then request the child contexts and optimize them one
//!    at a time. Each pass through `OptimizingChildren` schedules the next child.
//! 2. Once every child has a plan, derive the delivered properties, add the enforcers
//!    the context asks for and decide whether the expression itself is viable.
//! 3. Cost the expression exactly once and offer the result as the context's best plan.
//!
//! A missing child plan is not an error: the expression simply yields no cost context.
//! Neither is pruning: before each remaining child and again before costing, the
//! expression is dropped once the children optimized so far already cost more than the
//! context's best plan (`Engine::safe_to_prune`).

use super::group_optimization::GroupOptimizationJob;
use super::state_machine::JobStateMachine;
use super::{Job, JobTask};
use crate::context::OptimizationContext;
use crate::error::Result;
use crate::memo::ExprId;
use crate::properties::{child_requirements, derive_delivered, PhysicalPropertySet};
use crate::scheduler::SchedulerContext;
use crate::state::SearchState;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOptimizationState {
    Initialized,
    ChildrenOptimized,
    EnforcedPropsChecked,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOptimizationEvent {
    OptimizingChildren,
    ChildrenOptimized,
    EnforcedPropsChecked,
    Finalized,
}

#[derive(Debug)]
pub struct GroupExpressionOptimizationJob {
    expr: ExprId,
    oc: Arc<OptimizationContext>,
    child_ocs: Vec<Arc<OptimizationContext>>,
    delivered: Option<PhysicalPropertySet>,
    /// `None` until the child contexts are requested.
    next_child: Option<usize>,
    state: ExprOptimizationState,
}

impl GroupExpressionOptimizationJob {
    fn new(expr: ExprId, oc: Arc<OptimizationContext>) -> Self {
        Self {
            expr,
            oc,
            child_ocs: Vec::new(),
            delivered: None,
            next_child: None,
            state: ExprOptimizationState::Initialized,
        }
    }

    /// Schedule optimization of `expr` for `oc` under `parent` unless it was costed for
    /// that context already.
    pub(crate) fn schedule(
        ctx: &SchedulerContext<'_>,
        expr: ExprId,
        oc: &Arc<OptimizationContext>,
        parent: &Arc<Job>,
    ) -> bool {
        let gexpr = ctx.engine.memo().expr(expr);
        if gexpr.duplicate_of().is_some() || gexpr.cost_context(oc.id).is_some() {
            return false;
        }
        let job = ctx.factory.create(
            JobTask::GroupExpressionOptimization(Self::new(expr, oc.clone())),
            Some(gexpr.optimization_queue(oc.id)),
        );
        ctx.scheduler.add(job, Some(parent));
        true
    }

    fn request_child_contexts(&mut self, ctx: &SchedulerContext<'_>) -> bool {
        let engine = ctx.engine;
        let memo = engine.memo();
        let gexpr = memo.expr(self.expr);
        let Some(op) = gexpr.op.as_physical() else {
            return false;
        };
        if !engine.check_required_props(&gexpr, &self.oc.required) {
            return false;
        }
        gexpr.advance(memo.epoch(), SearchState::Optimizing);

        let requirements = child_requirements(op, &self.oc.required, gexpr.arity());
        for (child, required) in gexpr.children.iter().zip(&requirements) {
            let child_oc = memo.insert_context(*child, required, self.oc.stage);
            if child_oc.id == self.oc.id {
                // would wait on its own context
                self.child_ocs.clear();
                return false;
            }
            self.child_ocs.push(child_oc);
        }
        true
    }

    fn optimize_children(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> ExprOptimizationEvent {
        let mut next = match self.next_child {
            Some(next) => next,
            None => {
                if !self.request_child_contexts(ctx) {
                    return ExprOptimizationEvent::Finalized;
                }
                0
            }
        };
        // children before `next` are optimized
        while next < self.child_ocs.len() {
            if ctx.engine.safe_to_prune(&self.oc, &self.child_ocs[..next]) {
                trace!(expr = self.expr, oc = self.oc.id, next, "pruned before optimizing child");
                return ExprOptimizationEvent::Finalized;
            }
            let scheduled = GroupOptimizationJob::schedule(ctx, &self.child_ocs[next], job);
            next += 1;
            if scheduled {
                self.next_child = Some(next);
                return ExprOptimizationEvent::OptimizingChildren;
            }
        }
        self.next_child = Some(next);
        ExprOptimizationEvent::ChildrenOptimized
    }

    fn check_enforced_props(&mut self, ctx: &SchedulerContext<'_>) -> Result<ExprOptimizationEvent> {
        let engine = ctx.engine;
        let gexpr = engine.memo().expr(self.expr);
        let Some(op) = gexpr.op.as_physical() else {
            return Ok(ExprOptimizationEvent::Finalized);
        };

        let mut child_delivered = Vec::with_capacity(self.child_ocs.len());
        for child_oc in &self.child_ocs {
            match child_oc.best() {
                Some(best) if best.is_valid(&child_oc.required) => child_delivered.push(best.delivered.clone()),
                _ => {
                    trace!(expr = self.expr, child_oc = child_oc.id, "no plan for child context");
                    return Ok(ExprOptimizationEvent::Finalized);
                }
            }
        }
        let refs: Vec<&PhysicalPropertySet> = child_delivered.iter().collect();
        let delivered = derive_delivered(op, &refs);

        let enforcement = engine.check_enforced_props(op, &self.oc.required, &delivered);
        engine.add_enforcers(gexpr.group(), &self.oc.required, &enforcement)?;
        if !enforcement.is_viable() {
            return Ok(ExprOptimizationEvent::Finalized);
        }
        self.delivered = Some(delivered);
        Ok(ExprOptimizationEvent::EnforcedPropsChecked)
    }

    fn cost(&mut self, ctx: &SchedulerContext<'_>) -> ExprOptimizationEvent {
        let engine = ctx.engine;
        let memo = engine.memo();
        let gexpr = memo.expr(self.expr);
        if engine.safe_to_prune(&self.oc, &self.child_ocs) {
            trace!(expr = self.expr, oc = self.oc.id, "pruned before costing");
            return ExprOptimizationEvent::Finalized;
        }
        let delivered = self.delivered.take().unwrap_or_default();
        let cost_context = gexpr.cost_context_or_insert_with(self.oc.id, || {
            engine.compute_cost_context(&gexpr, &self.oc, self.child_ocs.clone(), delivered)
        });
        memo.group(memo.resolve(gexpr.group())).update_best_cost(&self.oc, &cost_context);
        gexpr.advance(memo.epoch(), SearchState::Optimized);
        ExprOptimizationEvent::Finalized
    }
}

impl JobStateMachine for GroupExpressionOptimizationJob {
    type State = ExprOptimizationState;
    type Event = ExprOptimizationEvent;

    const NAME: &'static str = "GroupExpressionOptimization";
    const COMPLETED: ExprOptimizationState = ExprOptimizationState::Completed;
    const TRANSITIONS: &'static [(ExprOptimizationState, ExprOptimizationEvent, ExprOptimizationState)] = &[
        (
            ExprOptimizationState::Initialized,
            ExprOptimizationEvent::OptimizingChildren,
            ExprOptimizationState::Initialized,
        ),
        (
            ExprOptimizationState::Initialized,
            ExprOptimizationEvent::ChildrenOptimized,
            ExprOptimizationState::ChildrenOptimized,
        ),
        (
            ExprOptimizationState::Initialized,
            ExprOptimizationEvent::Finalized,
            ExprOptimizationState::Completed,
        ),
        (
            ExprOptimizationState::ChildrenOptimized,
            ExprOptimizationEvent::EnforcedPropsChecked,
            ExprOptimizationState::EnforcedPropsChecked,
        ),
        (
            ExprOptimizationState::ChildrenOptimized,
            ExprOptimizationEvent::Finalized,
            ExprOptimizationState::Completed,
        ),
        (
            ExprOptimizationState::EnforcedPropsChecked,
            ExprOptimizationEvent::Finalized,
            ExprOptimizationState::Completed,
        ),
    ];

    fn state(&self) -> ExprOptimizationState {
        self.state
    }

    fn set_state(&mut self, state: ExprOptimizationState) {
        self.state = state;
    }

    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<ExprOptimizationEvent> {
        match self.state {
            ExprOptimizationState::Initialized => Ok(self.optimize_children(job, ctx)),
            ExprOptimizationState::ChildrenOptimized => self.check_enforced_props(ctx),
            ExprOptimizationState::EnforcedPropsChecked => Ok(self.cost(ctx)),
            ExprOptimizationState::Completed => unreachable!("completed jobs are not executed"),
        }
    }
}
