// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;

use crate::job_engine::category::Category;
use crate::job_engine::job::JobId;

/// Errors surfaced by the scheduler API.
///
/// Initialization errors are fatal for the caller. Everything else is a
/// misuse of the API and leaves the scheduler in a consistent state.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("category count must be between 1 and {max}, got {count}")]
    InvalidCategoryCount { count: usize, max: usize },

    #[error("main category {main} is out of range for {count} categories")]
    InvalidMainCategory { main: Category, count: usize },

    #[error("unknown category {0}")]
    UnknownCategory(Category),

    #[error("failed to spawn worker thread for {category}")]
    WorkerSpawn {
        category: Category,
        #[source]
        source: io::Error,
    },

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    /// The job is already visible in its queue (or past it).
    #[error("job {0} has already been dispatched")]
    AlreadyDispatched(JobId),

    #[error("job {0} cannot depend on itself")]
    SelfDependency(JobId),

    #[error("scheduler has been shut down")]
    Stopped,

    /// The scheduler shut down before the job could finish.
    #[error("job {0} was abandoned during shutdown")]
    JobAbandoned(JobId),

    #[error("payload of job {0} has a different type")]
    PayloadType(JobId),

    #[error("configuration error: {0}")]
    Config(String),
}
