//! # Job Queues
//!
//! A job queue guards one unit of work, such as exploring a group or optimizing a
//! group expression under a context. The first job to arrive becomes the *main* job and
//! does the work. Jobs arriving while it runs are parked as waiters and never occupy a
//! worker. When the main job finishes, [`JobQueue::notify_completed`] hands the outcome
//! to every waiter, and later arrivals see the recorded outcome immediately.
//!
//! A failed main job completes the queue too: its error is the outcome every waiter
//! observes. The outcome is recorded once per [`JobQueue::reset`].

use crate::error::Result;
use crate::jobs::{Job, JobId};
use parking_lot::Mutex;
use std::sync::Arc;

/// What happened to a job that tried to enter a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobQueueResult {
    /// The job owns the work (first arrival, or the main job re-entering after a suspend).
    Main,
    /// Another job owns the work; this one was parked until it finishes.
    Queued,
    /// The work finished already with this outcome.
    Completed(Result<()>),
}

#[derive(Debug)]
struct QueueInner<W> {
    main: Option<JobId>,
    outcome: Option<Result<()>>,
    waiters: Vec<W>,
}

/// Deduplication gate for one unit of work. `W` is the handle kept for parked jobs.
#[derive(Debug)]
pub struct JobQueue<W = Arc<Job>> {
    inner: Mutex<QueueInner<W>>,
}

impl<W> Default for JobQueue<W> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                main: None,
                outcome: None,
                waiters: Vec::new(),
            }),
        }
    }
}

impl<W> JobQueue<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the queue as job `id`; `waiter` is kept only when the result is `Queued`.
    pub fn enqueue(&self, id: JobId, waiter: W) -> JobQueueResult {
        let mut inner = self.inner.lock();
        if let Some(outcome) = &inner.outcome {
            return JobQueueResult::Completed(outcome.clone());
        }
        match inner.main {
            None => {
                inner.main = Some(id);
                JobQueueResult::Main
            }
            Some(main) if main == id => JobQueueResult::Main,
            Some(_) => {
                inner.waiters.push(waiter);
                JobQueueResult::Queued
            }
        }
    }

    /// Record the main job's outcome and take the parked waiters.
    pub fn notify_completed(&self, outcome: Result<()>) -> Vec<W> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.outcome.is_none(), "job queue completed twice");
        inner.outcome = Some(outcome);
        std::mem::take(&mut inner.waiters)
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn main_job(&self) -> Option<JobId> {
        self.inner.lock().main
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Make the queue reusable. Only valid while no job is parked on it.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.waiters.is_empty(), "job queue reset with parked waiters");
        inner.main = None;
        inner.outcome = None;
    }

    /// Drop every parked waiter and clear the queue. Used after an aborted run.
    pub fn abandon(&self) {
        let mut inner = self.inner.lock();
        inner.waiters.clear();
        inner.main = None;
        inner.outcome = None;
    }
}
