// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use log::debug;
use smallvec::SmallVec;

use crate::error::SchedulerError;
use crate::job_engine::category::Category;
use crate::job_engine::closure_job::{ClosureJob, Payload};
use crate::job_engine::job::{JobHandle, JobId};
use crate::job_engine::scheduler::SchedulerCore;

/// Declares a job and all of its dependencies, then submits it in one step.
///
/// While linking, the job carries a submission hold that only the final
/// dispatch lifts. A dependency that finishes in the middle of `submit` can
/// therefore never dispatch the job before the last dependency is linked.
///
/// ```ignore
/// let upload = scheduler
///     .job(Category::RENDER, |mesh: &mut Mesh| upload(mesh), mesh)
///     .after(&load)
///     .after(&decode)
///     .desc("upload mesh")
///     .submit()?;
/// ```
#[must_use = "a job builder does nothing until submitted"]
pub struct JobBuilder {
    core: Arc<SchedulerCore>,
    category: Category,
    desc: Option<String>,
    work: ClosureJob,
    payload: Payload,
    after: SmallVec<[JobId; 4]>,
}

impl JobBuilder {
    pub(crate) fn new(
        core: Arc<SchedulerCore>,
        category: Category,
        work: ClosureJob,
        payload: Payload,
    ) -> Self {
        Self {
            core,
            category,
            desc: None,
            work,
            payload,
            after: SmallVec::new(),
        }
    }

    /// Free-form description, used for logging
    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Runs the job only after `dependency` finished.
    pub fn after(mut self, dependency: &JobHandle) -> Self {
        if !self.after.contains(&dependency.id()) {
            self.after.push(dependency.id());
        }
        self
    }

    /// Creates the job, links every dependency and dispatches it as soon as
    /// all of them finished (immediately if there are none left).
    ///
    /// If a dependency cannot be linked, the job is discarded without ever
    /// running and the error is returned.
    pub fn submit(self) -> Result<JobHandle, SchedulerError> {
        let handle = self
            .core
            .create(self.category, self.desc, self.work, self.payload)?;
        let id = handle.id();
        let job = self.core.job(id)?;

        if self.after.is_empty() {
            if let Err(e) = self.core.dispatch(id) {
                self.core.discard(handle);
                return Err(e);
            }
            return Ok(handle);
        }

        if let Err(e) = job.begin_submit() {
            self.core.discard(handle);
            return Err(e);
        }
        for dependency in &self.after {
            if let Err(e) = self.core.depends_on(id, *dependency) {
                debug!("discarding job {} ({}): {e}", id, job.desc);
                self.core.discard(handle);
                return Err(e);
            }
        }
        // lifts the submission hold
        if let Err(e) = self.core.dispatch(id) {
            self.core.discard(handle);
            return Err(e);
        }
        Ok(handle)
    }
}

impl std::fmt::Debug for JobBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBuilder")
            .field("category", &self.category)
            .field("desc", &self.desc)
            .field("after", &self.after)
            .finish()
    }
}
