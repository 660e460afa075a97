// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Category-based job scheduler for a frame-driven engine.
//!
//! Work is submitted as jobs into categories (generic, logging, I/O, render,
//! main). Background categories are drained by worker threads, the main
//! category by the owning thread once per frame. Jobs may depend on other
//! jobs; a dependent is dispatched automatically once its last dependency
//! finished.
//!
//! ```no_run
//! use jobsys::{Category, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::initialize(SchedulerConfig::default())?;
//! let load = scheduler.run(Category::IO, |bytes: &mut Vec<u8>| {
//!     bytes.extend_from_slice(b"level data");
//!     Ok(())
//! }, Vec::new())?;
//! let apply = scheduler
//!     .job(Category::MAIN, |_: &mut ()| Ok(()), ())
//!     .after(&load)
//!     .submit()?;
//!
//! scheduler.wait(&load)?;
//! scheduler.begin_frame();
//! scheduler.release(load)?;
//! scheduler.wait_and_release(apply)?;
//! scheduler.shutdown();
//! # Ok::<(), jobsys::SchedulerError>(())
//! ```

pub mod error;
pub mod global_config;
pub mod job_engine;

pub use error::SchedulerError;
pub use global_config::{DrainPolicy, SchedulerConfig};
pub use job_engine::category::Category;
pub use job_engine::consumer::Consumer;
pub use job_engine::job::{JobFailure, JobHandle, JobId, JobState};
pub use job_engine::job_builder::JobBuilder;
pub use job_engine::queue::Queue;
pub use job_engine::scheduler::{
    JobCompletion, JobSpawner, Scheduler, SchedulerState, SchedulerStats,
};
