//! Apply one rule to one group expression and insert the results into the memo.
//!
//! ```text
//! Initialized --Completed--> Completed
//! ```

use super::state_machine::JobStateMachine;
use super::{Job, JobTask};
use crate::error::Result;
use crate::group_expression::GroupExpression;
use crate::memo::ExprId;
use crate::rule::{OptContext, Rule, RuleType};
use crate::scheduler::SchedulerContext;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationState {
    Initialized,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationEvent {
    Completed,
}

pub struct TransformationJob {
    expr: ExprId,
    rule: Arc<dyn Rule>,
    state: TransformationState,
}

impl std::fmt::Debug for TransformationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformationJob")
            .field("expr", &self.expr)
            .field("rule", &self.rule.name())
            .field("state", &self.state)
            .finish()
    }
}

impl TransformationJob {
    /// Schedule a transformation job for every rule of `rule_type` the engine allows on
    /// `expr` right now. Each rule is claimed on the expression, so it is scheduled at
    /// most once per expression. Returns the number of jobs scheduled.
    pub(crate) fn schedule_applicable(
        ctx: &SchedulerContext<'_>,
        expr: &GroupExpression,
        rule_type: RuleType,
        parent: &Arc<Job>,
    ) -> usize {
        let rules = ctx.engine.applicable_xforms(expr, rule_type);
        for rule in &rules {
            let job = ctx.factory.create(
                JobTask::Transformation(Self {
                    expr: expr.id,
                    rule: rule.clone(),
                    state: TransformationState::Initialized,
                }),
                None,
            );
            ctx.scheduler.add(job, Some(parent));
        }
        rules.len()
    }
}

impl JobStateMachine for TransformationJob {
    type State = TransformationState;
    type Event = TransformationEvent;

    const NAME: &'static str = "Transformation";
    const COMPLETED: TransformationState = TransformationState::Completed;
    const TRANSITIONS: &'static [(TransformationState, TransformationEvent, TransformationState)] = &[(
        TransformationState::Initialized,
        TransformationEvent::Completed,
        TransformationState::Completed,
    )];

    fn state(&self) -> TransformationState {
        self.state
    }

    fn set_state(&mut self, state: TransformationState) {
        self.state = state;
    }

    fn act(&mut self, _job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<TransformationEvent> {
        let engine = ctx.engine;
        let expr = engine.memo().expr(self.expr);
        let started = Instant::now();
        let opt_ctx = OptContext {
            catalog: engine.catalog(),
        };
        let results = self.rule.apply(&expr, engine.memo(), &opt_ctx);
        trace!(rule = self.rule.name(), expr = self.expr, results = results.len(), "applied rule");
        engine.insert_xform_result(&expr, self.rule.as_ref(), results, started)?;
        Ok(TransformationEvent::Completed)
    }
}
