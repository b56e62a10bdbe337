//! # Optimization Jobs
//!
//! All search work is split into jobs run by the [`Scheduler`](crate::scheduler::Scheduler):
//!
//! | job                             | works on                    | purpose                                  |
//! |---------------------------------|-----------------------------|------------------------------------------|
//! | `GroupExploration`              | group                       | explore every logical member             |
//! | `GroupImplementation`           | group                       | implement every logical member           |
//! | `GroupOptimization`             | optimization context        | find the best plan for the context       |
//! | `GroupExpressionExploration`    | group expression            | explore children, then apply xforms      |
//! | `GroupExpressionImplementation` | group expression            | implement children, then apply xforms    |
//! | `GroupExpressionOptimization`   | (group expr, context) pair  | optimize children, enforce, cost         |
//! | `Transformation`                | (group expr, rule) pair     | apply one rule, insert its results       |
//!
//! Every kind is a state machine (see `state_machine`). A job never blocks: when it needs
//! results from other jobs it schedules them as children and suspends. Each job tracks a
//! reference count of `1 + outstanding children`. The last of the job itself (on suspend)
//! and its children (on completion) to drop the count to zero puts the job back on the
//! waiting list.
//!
//! Most jobs are attached to a [`JobQueue`] so that concurrent requests for the same
//! work collapse into a single execution.
//!
//! A group can be folded into another one while its jobs are suspended or running. The
//! group jobs scan members through a [`MemberCursor`], which moves to the master and
//! rescans it from the start whenever that happens.

pub(crate) mod state_machine;

pub mod expr_exploration;
pub mod expr_implementation;
pub mod expr_optimization;
pub mod group_exploration;
pub mod group_implementation;
pub mod group_optimization;
pub mod transformation;

use crate::error::Result;
use crate::group::Group;
use crate::job_queue::JobQueue;
use crate::memo::{ExprId, GroupId, Memo};
use crate::scheduler::SchedulerContext;
use expr_exploration::GroupExpressionExplorationJob;
use expr_implementation::GroupExpressionImplementationJob;
use expr_optimization::GroupExpressionOptimizationJob;
use group_exploration::GroupExplorationJob;
use group_implementation::GroupImplementationJob;
use group_optimization::GroupOptimizationJob;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use transformation::TransformationJob;

pub type JobId = u64;

/// Position of a group job in its group's member list.
#[derive(Debug)]
pub(crate) struct MemberCursor {
    pub(crate) group: GroupId,
    last_index: usize,
}

impl MemberCursor {
    pub(crate) fn new(group: GroupId) -> Self {
        Self { group, last_index: 0 }
    }

    pub(crate) fn restart(&mut self) {
        self.last_index = 0;
    }

    /// Follow the group to its master, restarting the scan if it moved.
    pub(crate) fn resolve(&mut self, memo: &Memo) -> GroupId {
        let master = memo.resolve(self.group);
        if master != self.group {
            self.group = master;
            self.last_index = 0;
        }
        master
    }

    /// Members not seen yet, as read by `members`. Empty only once the group has no
    /// unseen members and was not folded meanwhile.
    pub(crate) fn next_batch(&mut self, memo: &Memo, members: impl Fn(&Group, usize) -> Vec<ExprId>) -> Vec<ExprId> {
        loop {
            let group = self.resolve(memo);
            let batch = members(memo.group(group).as_ref(), self.last_index);
            if !batch.is_empty() {
                self.last_index += batch.len();
                return batch;
            }
            if memo.resolve(group) == group {
                return batch;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobType {
    GroupExploration,
    GroupImplementation,
    GroupOptimization,
    GroupExpressionExploration,
    GroupExpressionImplementation,
    GroupExpressionOptimization,
    Transformation,
}

/// Result of one execution step of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Completed,
    /// Waiting for child jobs; the scheduler resumes it once they are done.
    Suspended,
}

pub(crate) enum JobTask {
    GroupExploration(GroupExplorationJob),
    GroupImplementation(GroupImplementationJob),
    GroupOptimization(GroupOptimizationJob),
    GroupExpressionExploration(GroupExpressionExplorationJob),
    GroupExpressionImplementation(GroupExpressionImplementationJob),
    GroupExpressionOptimization(GroupExpressionOptimizationJob),
    Transformation(TransformationJob),
}

impl JobTask {
    fn job_type(&self) -> JobType {
        match self {
            JobTask::GroupExploration(_) => JobType::GroupExploration,
            JobTask::GroupImplementation(_) => JobType::GroupImplementation,
            JobTask::GroupOptimization(_) => JobType::GroupOptimization,
            JobTask::GroupExpressionExploration(_) => JobType::GroupExpressionExploration,
            JobTask::GroupExpressionImplementation(_) => JobType::GroupExpressionImplementation,
            JobTask::GroupExpressionOptimization(_) => JobType::GroupExpressionOptimization,
            JobTask::Transformation(_) => JobType::Transformation,
        }
    }
}

pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    parent: OnceLock<Arc<Job>>,
    refs: AtomicUsize,
    queue: Option<Arc<JobQueue>>,
    task: Mutex<JobTask>,
}

impl Job {
    pub fn parent(&self) -> Option<&Arc<Job>> {
        self.parent.get()
    }

    pub(crate) fn set_parent(&self, parent: Arc<Job>) {
        debug_assert!(self.parent.get().is_none(), "job {} already has a parent", self.id);
        let _ = self.parent.set(parent);
    }

    pub(crate) fn queue(&self) -> Option<&Arc<JobQueue>> {
        self.queue.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. True if it was the last one; the reference is then restored
    /// for the caller, who must reschedule the job.
    pub(crate) fn release(&self) -> bool {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.refs.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Run the job's state machine until it suspends or completes.
    pub(crate) fn execute(self: &Arc<Self>, ctx: &SchedulerContext<'_>) -> Result<JobResult> {
        let mut task = self.task.lock();
        match &mut *task {
            JobTask::GroupExploration(m) => state_machine::run(m, self, ctx),
            JobTask::GroupImplementation(m) => state_machine::run(m, self, ctx),
            JobTask::GroupOptimization(m) => state_machine::run(m, self, ctx),
            JobTask::GroupExpressionExploration(m) => state_machine::run(m, self, ctx),
            JobTask::GroupExpressionImplementation(m) => state_machine::run(m, self, ctx),
            JobTask::GroupExpressionOptimization(m) => state_machine::run(m, self, ctx),
            JobTask::Transformation(m) => state_machine::run(m, self, ctx),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("type", &self.job_type)
            .field("parent", &self.parent().map(|p| p.id))
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Per-run job id generator.
#[derive(Debug, Default)]
pub struct JobFactory {
    next_id: AtomicU64,
}

impl JobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&self, task: JobTask, queue: Option<Arc<JobQueue>>) -> Arc<Job> {
        Arc::new(Job {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            job_type: task.job_type(),
            parent: OnceLock::new(),
            refs: AtomicUsize::new(1),
            queue,
            task: Mutex::new(task),
        })
    }

    pub fn jobs_created(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}
