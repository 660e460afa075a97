// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use log::debug;
use smallvec::SmallVec;

use crate::error::SchedulerError;
use crate::job_engine::category::Category;
use crate::job_engine::closure_job::{ClosureJob, Payload};

/// Identifies a job within one scheduler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque reference to a job. Owns exactly one reference count.
///
/// A handle cannot be cloned; use `retain` to obtain a second one. Giving it
/// back with `release` consumes it, so it cannot be released twice.
#[must_use = "a dropped handle keeps its job alive until shutdown; release it"]
#[derive(Debug, PartialEq, Eq)]
pub struct JobHandle {
    id: JobId,
}

impl JobHandle {
    pub(crate) fn new(id: JobId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> JobId {
        self.id
    }
}

/// Lifecycle of a job. Transitions only move forward.
#[derive(Clone, Debug, Copy, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    /// Linked as a dependent; dispatches itself once every dependency finished.
    PendingDependency,
    /// Visible in its category's queue.
    Dispatched,
    Running,
    Finished,
}

/// Why a job's callback did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("callback returned an error: {0}")]
    Error(String),
    #[error("callback panicked: {0}")]
    Panic(String),
}

#[derive(Debug)]
struct JobCore {
    state: JobState,
    abandoned: bool,
    /// Set after the dependents were resolved; waiters wake on it.
    completed: bool,
    /// Unresolved dependency links.
    pending: usize,
    /// Linked while still `Created`; stays out of its queue until it is
    /// dispatched or one of its dependencies finishes.
    held: bool,
    /// A builder is still linking dependencies.
    submitting: bool,
    /// `dispatch` was called once.
    dispatch_requested: bool,
    work: Option<ClosureJob>,
    payload: Option<Payload>,
    dependents: SmallVec<[JobId; 4]>,
    failure: Option<JobFailure>,
    completions: Vec<oneshot::Sender<()>>,
}

/// A unit of work owned by the job table.
#[derive(Debug)]
pub(crate) struct Job {
    pub id: JobId,
    pub category: Category,
    pub desc: String,
    sync_state: Mutex<JobCore>,
    finished: Condvar,
    refs: AtomicUsize,
}

impl Job {
    pub fn new(
        id: JobId,
        category: Category,
        desc: Option<String>,
        work: ClosureJob,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            category,
            desc: desc.unwrap_or_else(|| format!("{category} job {id}")),
            sync_state: Mutex::new(JobCore {
                state: JobState::Created,
                abandoned: false,
                completed: false,
                pending: 0,
                held: false,
                submitting: false,
                dispatch_requested: false,
                work: Some(work),
                payload: Some(payload),
                dependents: SmallVec::new(),
                failure: None,
                completions: Vec::new(),
            }),
            finished: Condvar::new(),
            // the creator's handle
            refs: AtomicUsize::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobCore> {
        self.sync_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. Returns true when it was the last one.
    pub fn release(&self) -> bool {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                debug_assert!(false, "job {} released more often than retained", self.id);
                false
            }
        }
    }

    /// Handles an explicit dispatch. Returns true if the job must be pushed
    /// into its queue now.
    ///
    /// A linked job only loses its holds here; it becomes ready once its last
    /// dependency finished. A linked job that its dependencies already moved
    /// forward is left alone.
    pub fn mark_dispatched(&self) -> Result<bool, SchedulerError> {
        let mut core = self.lock();
        if core.abandoned || core.dispatch_requested {
            return Err(SchedulerError::AlreadyDispatched(self.id));
        }
        core.dispatch_requested = true;
        match core.state {
            JobState::Created => {
                core.state = JobState::Dispatched;
                Ok(true)
            }
            JobState::PendingDependency => {
                core.held = false;
                core.submitting = false;
                Ok(Self::become_ready(&mut core))
            }
            // only dependency links move a job past `Created` without a dispatch
            JobState::Dispatched | JobState::Running | JobState::Finished => Ok(false),
        }
    }

    fn linkable(&self, core: &JobCore) -> Result<(), SchedulerError> {
        match core.state {
            JobState::Created | JobState::PendingDependency
                if !core.abandoned && !core.dispatch_requested =>
            {
                Ok(())
            }
            _ => Err(SchedulerError::AlreadyDispatched(self.id)),
        }
    }

    /// Registers one more unresolved dependency. Only valid before the job
    /// was dispatched. A job linked while `Created` is held back until it is
    /// dispatched or a dependency finishes.
    pub fn add_pending(&self) -> Result<(), SchedulerError> {
        let mut core = self.lock();
        self.linkable(&core)?;
        if core.state == JobState::Created {
            core.held = true;
            core.state = JobState::PendingDependency;
        }
        core.pending += 1;
        Ok(())
    }

    /// Keeps the job out of its queue until `mark_dispatched`, whatever its
    /// dependencies do meanwhile.
    pub fn begin_submit(&self) -> Result<(), SchedulerError> {
        let mut core = self.lock();
        self.linkable(&core)?;
        core.submitting = true;
        core.state = JobState::PendingDependency;
        Ok(())
    }

    /// Resolves one dependency link. `finished` is true when the dependency
    /// just ran, which also lifts the hold of a directly linked job; a link
    /// to a job that had finished before does not.
    ///
    /// Returns true exactly once: for the call that leaves the job with no
    /// pending link and no hold, which moves it to `Dispatched`.
    pub fn resolve_one(&self, finished: bool) -> bool {
        let mut core = self.lock();
        if core.state != JobState::PendingDependency || core.pending == 0 {
            return false;
        }
        core.pending -= 1;
        if finished {
            core.held = false;
        }
        Self::become_ready(&mut core)
    }

    fn become_ready(core: &mut JobCore) -> bool {
        if core.state == JobState::PendingDependency
            && core.pending == 0
            && !core.held
            && !core.submitting
            && !core.abandoned
        {
            core.state = JobState::Dispatched;
            return true;
        }
        false
    }

    /// Records `dependent` to be resolved when this job finishes. Returns
    /// false if this job already finished, in which case nothing is recorded.
    pub fn add_dependent(&self, dependent: JobId) -> bool {
        let mut core = self.lock();
        if core.state == JobState::Finished {
            return false;
        }
        core.dependents.push(dependent);
        true
    }

    /// Runs the callback on the calling thread.
    pub fn execute(&self) -> Option<JobFailure> {
        let (work, mut payload) = {
            let mut core = self.lock();
            core.state = JobState::Running;
            (core.work.take(), core.payload.take())
        };

        let result = match (work, payload.as_mut()) {
            (Some(work), Some(payload)) => work.run(&mut **payload),
            _ => Err(JobFailure::Error(format!(
                "job {} has no work left to execute",
                self.id
            ))),
        };

        let mut core = self.lock();
        core.payload = payload;
        match result {
            Ok(()) => None,
            Err(failure) => {
                core.failure = Some(failure.clone());
                Some(failure)
            }
        }
    }

    /// Marks the job finished and hands back the dependents recorded so
    /// far. A dependent linked afterwards sees its dependency as done.
    pub fn mark_finished(&self) -> SmallVec<[JobId; 4]> {
        let mut core = self.lock();
        core.state = JobState::Finished;
        std::mem::take(&mut core.dependents)
    }

    /// Wakes every waiter. Called once the dependents were taken care of.
    pub fn complete(&self) {
        {
            let mut core = self.lock();
            core.completed = true;
            for completion in core.completions.drain(..) {
                let _ = completion.send(());
            }
        }
        self.finished.notify_all();
    }

    /// Gives up on a job that will never run. Waiters wake with an error.
    pub fn abandon(&self) {
        {
            let mut core = self.lock();
            if core.completed {
                return;
            }
            core.abandoned = true;
            core.work = None;
            core.dependents.clear();
            // dropping the senders cancels the completion futures
            core.completions.clear();
        }
        debug!("job {} ({}) abandoned", self.id, self.desc);
        self.finished.notify_all();
    }

    /// Blocks until the job finished or was abandoned.
    pub fn wait(&self) -> Result<(), SchedulerError> {
        // pattern is described on https://doc.rust-lang.org/stable/std/sync/struct.Condvar.html
        let mut core = self.lock();
        while !core.completed && !core.abandoned {
            core = self
                .finished
                .wait(core)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if core.completed {
            Ok(())
        } else {
            Err(SchedulerError::JobAbandoned(self.id))
        }
    }

    pub fn completion(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut core = self.lock();
        if core.completed {
            let _ = tx.send(());
        } else if !core.abandoned {
            core.completions.push(tx);
        }
        rx
    }

    pub fn failure(&self) -> Option<JobFailure> {
        self.lock().failure.clone()
    }

    /// Moves the payload out of a finished job. `Ok(None)` while the job has
    /// not finished or once the payload was taken.
    pub fn take_payload<P: Any>(&self) -> Result<Option<P>, SchedulerError> {
        let mut core = self.lock();
        if core.state != JobState::Finished {
            return Ok(None);
        }
        match core.payload.take() {
            None => Ok(None),
            Some(payload) => match payload.downcast::<P>() {
                Ok(value) => Ok(Some(*value)),
                Err(payload) => {
                    core.payload = Some(payload);
                    Err(SchedulerError::PayloadType(self.id))
                }
            },
        }
    }
}
