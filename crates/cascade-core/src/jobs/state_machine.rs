//! Table-driven job state machines.
//!
//! A job kind lists its transitions as `(state, event, next state)` triples and supplies
//! one action per state. [`run`] repeatedly performs the action of the current state and
//! follows the transition for the returned event:
//!
//! - a transition to a *different* state continues immediately,
//! - a transition back to the *same* state suspends the job until its children finish,
//! - reaching the completed state finishes the job.
//!
//! An event without a transition is an internal error.

use super::{Job, JobResult};
use crate::error::{OptimizerError, Result};
use crate::scheduler::SchedulerContext;
use std::fmt::Debug;
use std::sync::Arc;

pub(crate) trait JobStateMachine {
    type State: Copy + Eq + Debug + 'static;
    type Event: Copy + Eq + Debug + 'static;

    const NAME: &'static str;
    const COMPLETED: Self::State;
    const TRANSITIONS: &'static [(Self::State, Self::Event, Self::State)];

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    /// Action of the current state.
    fn act(&mut self, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<Self::Event>;
}

/// Next state for `event` in `state`.
pub(crate) fn transition<M: JobStateMachine>(state: M::State, event: M::Event) -> Result<M::State> {
    M::TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| {
            debug_assert!(false, "{} job: no transition for {:?} in {:?}", M::NAME, event, state);
            OptimizerError::InvalidTransition {
                job: M::NAME,
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            }
        })
}

/// Drive `machine` until it suspends or completes.
pub(crate) fn run<M: JobStateMachine>(machine: &mut M, job: &Arc<Job>, ctx: &SchedulerContext<'_>) -> Result<JobResult> {
    loop {
        let current = machine.state();
        if current == M::COMPLETED {
            return Ok(JobResult::Completed);
        }
        let event = machine.act(job, ctx)?;
        let next = transition::<M>(current, event)?;
        machine.set_state(next);
        if next == current {
            return Ok(JobResult::Suspended);
        }
    }
}
