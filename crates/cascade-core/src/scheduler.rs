//! # Job Scheduler
//!
//! The scheduler owns the waiting list of runnable jobs and drives a bounded pool of
//! worker threads over it. Workers run inside a `std::thread::scope`, so jobs can borrow
//! the engine without reference counting it.
//!
//! ## Job lifecycle
//!
//! - [`Scheduler::add`] links the job to its parent (bumping the parent's reference
//!   count) and pushes it on the waiting list.
//! - A worker pops a job and runs it through its job queue, if it has one:
//!   - `Main`: the job runs. When it finishes (successfully or not), every job parked on
//!     the queue is completed with the same outcome.
//!   - `Queued`: the job is parked on the queue and the worker moves on.
//!   - `Completed`: the work is done already; the job completes with that outcome.
//! - A completed job releases one reference of its parent. A suspended job releases its
//!   own reference. Whoever drops a parent's count to zero puts it back on the waiting
//!   list, so a suspended job never occupies a worker.
//!
//! The run ends when every added job has completed, or at the first error. A run where
//! jobs remain but none is runnable or running cannot make progress and is aborted.
//!
//! ## Adaptive concurrency
//!
//! Runs start with `initial_workers` threads. A worker spawns another one whenever the
//! backlog exceeds ten jobs per active worker, up to `max_workers`.

use crate::engine::Engine;
use crate::error::{OptimizerError, Result};
use crate::jobs::{Job, JobFactory, JobResult};
use crate::job_queue::JobQueueResult;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Spawn another worker when the backlog per active worker exceeds this.
const JOBS_PER_WORKER: usize = 10;
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Everything a running job can reach.
pub struct SchedulerContext<'a> {
    pub scheduler: &'a Scheduler,
    pub engine: &'a Engine,
    pub factory: &'a JobFactory,
}

/// Job counters of one scheduler, accumulated over all its runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Jobs added.
    pub queued: u64,
    /// Jobs popped from the waiting list (first runs and resumptions).
    pub dequeued: u64,
    pub suspended: u64,
    pub completed: u64,
    /// Jobs completed through a job queue without running.
    pub completed_queued: u64,
    /// Suspended jobs put back on the waiting list.
    pub resumed: u64,
    /// Jobs parked behind another job's work.
    pub parked: u64,
    /// Most worker threads alive at once.
    pub max_workers: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dequeued: AtomicU64,
    suspended: AtomicU64,
    completed: AtomicU64,
    completed_queued: AtomicU64,
    resumed: AtomicU64,
    parked: AtomicU64,
    max_workers: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            completed_queued: self.completed_queued.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            max_workers: self.max_workers.load(Ordering::Relaxed),
        }
    }
}

pub struct Scheduler {
    waiting: Mutex<VecDeque<Arc<Job>>>,
    ready: Condvar,
    /// Jobs added and not yet completed, including suspended and parked ones.
    pending: AtomicUsize,
    /// Jobs currently executing. Only changed while holding `waiting`.
    running: AtomicUsize,
    workers: AtomicUsize,
    aborted: AtomicBool,
    error: Mutex<Option<OptimizerError>>,
    max_workers: usize,
    initial_workers: usize,
    counters: Counters,
}

impl Scheduler {
    pub fn new(max_workers: usize, initial_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            waiting: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            pending: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            workers: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            max_workers,
            initial_workers: initial_workers.clamp(1, max_workers),
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot()
    }

    /// Jobs added and not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Add `job` as a child of `parent` (or as a root job) and make it runnable.
    pub fn add(&self, job: Arc<Job>, parent: Option<&Arc<Job>>) {
        if let Some(parent) = parent {
            job.set_parent(parent.clone());
            parent.add_ref();
        }
        Counters::bump(&self.counters.queued);
        self.pending.fetch_add(1, Ordering::AcqRel);
        trace!(job = job.id, kind = ?job.job_type, parent = ?parent.map(|p| p.id), "job added");
        self.push(job);
    }

    fn push(&self, job: Arc<Job>) {
        self.waiting.lock().push_back(job);
        self.ready.notify_one();
    }

    /// Run jobs until none is left. Returns the first error any job raised.
    pub fn run(&self, engine: &Engine, factory: &JobFactory) -> Result<()> {
        self.aborted.store(false, Ordering::Release);
        let ctx = SchedulerContext {
            scheduler: self,
            engine,
            factory,
        };
        thread::scope(|scope| {
            for _ in 0..self.initial_workers {
                self.workers.fetch_add(1, Ordering::AcqRel);
                spawn_worker(scope, &ctx);
            }
        });

        if self.aborted.load(Ordering::Acquire) {
            self.waiting.lock().clear();
            self.pending.store(0, Ordering::Release);
            if let Some(error) = self.error.lock().take() {
                return Err(error);
            }
        }
        debug!(stats = ?self.stats(), "scheduler run finished");
        Ok(())
    }

    fn next_job(&self) -> Option<Arc<Job>> {
        let mut waiting = self.waiting.lock();
        loop {
            if self.aborted.load(Ordering::Acquire) || self.pending() == 0 {
                return None;
            }
            if let Some(job) = waiting.pop_front() {
                self.running.fetch_add(1, Ordering::AcqRel);
                return Some(job);
            }
            if self.running.load(Ordering::Acquire) == 0 {
                // nothing runnable, nothing running, yet jobs remain
                let pending = self.pending();
                drop(waiting);
                self.abort(OptimizerError::Stalled { pending });
                return None;
            }
            self.ready.wait_for(&mut waiting, IDLE_WAIT);
        }
    }

    fn finished_running(&self) {
        let _waiting = self.waiting.lock();
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    fn backlog(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Reserve a worker slot if the backlog calls for another worker.
    fn claim_worker_slot(&self) -> bool {
        let backlog = self.backlog();
        let mut workers = self.workers.load(Ordering::Acquire);
        loop {
            if workers >= self.max_workers || backlog / (workers + 1) <= JOBS_PER_WORKER {
                return false;
            }
            match self
                .workers
                .compare_exchange(workers, workers + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => workers = current,
            }
        }
    }

    fn execute(&self, job: Arc<Job>, ctx: &SchedulerContext<'_>) {
        Counters::bump(&self.counters.dequeued);
        let result = match job.queue() {
            None => job.execute(ctx),
            Some(queue) => match queue.enqueue(job.id, job.clone()) {
                JobQueueResult::Main => {
                    let result = job.execute(ctx);
                    if !matches!(result, Ok(JobResult::Suspended)) {
                        let outcome = result.clone().map(|_| ());
                        for waiter in queue.notify_completed(outcome.clone()) {
                            Counters::bump(&self.counters.completed_queued);
                            self.finish(&waiter, outcome.clone());
                        }
                    }
                    result
                }
                JobQueueResult::Queued => {
                    Counters::bump(&self.counters.parked);
                    trace!(job = job.id, kind = ?job.job_type, "job parked");
                    return;
                }
                JobQueueResult::Completed(outcome) => {
                    Counters::bump(&self.counters.completed_queued);
                    outcome.map(|_| JobResult::Completed)
                }
            },
        };

        match result {
            Ok(JobResult::Suspended) => {
                Counters::bump(&self.counters.suspended);
                if job.release() {
                    self.resume(job);
                }
            }
            Ok(JobResult::Completed) => self.finish(&job, Ok(())),
            Err(error) => self.finish(&job, Err(error)),
        }
    }

    fn resume(&self, job: Arc<Job>) {
        Counters::bump(&self.counters.resumed);
        self.push(job);
    }

    /// Complete `job`, waking its parent if it was the last outstanding child.
    fn finish(&self, job: &Arc<Job>, outcome: Result<()>) {
        if let Err(error) = outcome {
            self.abort(error);
        }
        Counters::bump(&self.counters.completed);
        if let Some(parent) = job.parent() {
            if parent.release() {
                self.resume(parent.clone());
            }
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.ready.notify_all();
        }
    }

    fn abort(&self, error: OptimizerError) {
        let mut first = self.error.lock();
        if first.is_none() {
            warn!(%error, "aborting optimization");
            *first = Some(error);
        }
        self.aborted.store(true, Ordering::Release);
        self.ready.notify_all();
    }
}

fn spawn_worker<'scope, 'env>(scope: &'scope thread::Scope<'scope, 'env>, ctx: &'env SchedulerContext<'env>) {
    let scheduler = ctx.scheduler;
    let alive = scheduler.workers.load(Ordering::Acquire) as u64;
    scheduler.counters.max_workers.fetch_max(alive, Ordering::Relaxed);
    scope.spawn(move || worker_loop(scope, ctx));
}

fn worker_loop<'scope, 'env>(scope: &'scope thread::Scope<'scope, 'env>, ctx: &'env SchedulerContext<'env>) {
    let scheduler = ctx.scheduler;
    while let Some(job) = scheduler.next_job() {
        if scheduler.claim_worker_slot() {
            spawn_worker(scope, ctx);
        }
        scheduler.execute(job, ctx);
        scheduler.finished_running();
    }
    scheduler.workers.fetch_sub(1, Ordering::AcqRel);
}
