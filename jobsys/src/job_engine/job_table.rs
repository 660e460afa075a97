// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::error::SchedulerError;
use crate::job_engine::job::{Job, JobId};

/// Owns every live job of one scheduler. Callers only ever see a `JobId`
/// (wrapped in a handle); the table is the one place where a job is freed.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    next_id: AtomicU64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Inserts the job unless `open` was cleared. The flag is checked under
    /// the write lock, so an insert never slips past a concurrent `drain`.
    pub fn insert_while(&self, job: Job, open: &AtomicBool) -> Result<Arc<Job>, SchedulerError> {
        let job = Arc::new(job);
        let mut jobs = self.write();
        if !open.load(Ordering::Acquire) {
            return Err(SchedulerError::Stopped);
        }
        let previous = jobs.insert(job.id, job.clone());
        debug_assert!(previous.is_none(), "job id {} reused", job.id);
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<Arc<Job>, SchedulerError> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::UnknownJob(id))
    }

    pub fn retain(&self, id: JobId) -> Result<(), SchedulerError> {
        self.get(id)?.retain();
        Ok(())
    }

    /// Drops one reference and frees the job when it was the last one.
    /// Returns whether the job was freed.
    pub fn release(&self, id: JobId) -> Result<bool, SchedulerError> {
        let job = self.get(id)?;
        if !job.release() {
            return Ok(false);
        }
        // nobody holds a reference any more, so nobody can retain it again
        self.write().remove(&id);
        job.abandon();
        debug!("job {} ({}) freed", id, job.desc);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Removes every job, used on shutdown.
    pub fn drain(&self) -> Vec<Arc<Job>> {
        self.write().drain().map(|(_, job)| job).collect()
    }
}
