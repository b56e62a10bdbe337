//! # Optimizer Errors
//!
//! Only conditions that abort an optimization are errors. A group that has no plan
//! under some required properties is *not* an error: its optimization context simply
//! has no best cost context, and callers check for that explicitly. The single
//! exception is plan extraction at the root, where a missing plan becomes
//! [`OptimizerError::NoPlanFound`].
//!
//! `OptimizerError` is `Clone` because a failing job's error is handed to every job
//! that was waiting on the same job queue.

use crate::memo::GroupId;

/// Errors that terminate an optimization run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptimizerError {
    /// The memo reached `SearchConfig::max_memo_groups`.
    #[error("memo exhausted: group limit of {limit} reached")]
    MemoExhausted { limit: usize },

    /// No physical plan satisfies the required properties of the root group.
    #[error("no plan found for group {group} under the required properties")]
    NoPlanFound { group: GroupId },

    /// A job state machine received an event with no transition from its state.
    #[error("invalid transition in {job} job: event {event} in state {state}")]
    InvalidTransition {
        job: &'static str,
        state: String,
        event: String,
    },

    /// `Engine::optimize` or `Engine::extract_plan` was called before `Engine::init`.
    #[error("engine is not initialized with a query context")]
    NotInitialized,

    /// An operator tree or rule result was malformed (e.g. wrong child count).
    #[error("malformed expression: {0}")]
    MalformedExpression(String),

    /// Jobs remain but none can run: they wait on each other.
    #[error("search stalled with {pending} jobs waiting on each other")]
    Stalled { pending: usize },

    /// A search stage names a rule that is not registered.
    #[error("unknown rule '{0}' in search stage")]
    UnknownRule(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OptimizerError>;
