// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Category-Based Job Scheduler
//!
//! ## Overview
//! A thread pool organised by category, with dependencies between jobs.
//!
//! - Every category owns one FIFO queue (a lane) and, unless it is the main
//!   category, a wake signal that its worker threads park on.
//! - Producers on any thread create a job, optionally link it to jobs it
//!   depends on, and dispatch it into its lane.
//! - Workers wake, drain their lane through a `Consumer` and, when a job
//!   finishes, resolve its dependents; a dependent whose last dependency
//!   finished is dispatched into its own lane.
//! - The main lane is never touched by workers. The owning thread drains it
//!   once per frame with `begin_frame`.
//! - Jobs live in a table owned by the scheduler. Callers hold handles; a job
//!   is freed when the last handle, queue entry and dependency link is gone.
//!
//!
//!    producers --create/dispatch--> +-------------------------------+
//!                                   |           Scheduler           |
//!                                   |  job table   lanes + signals  |
//!                                   +---+--------+--------+-----+---+
//!                                       |        |        |     |
//!                                       v        v        v     v
//!                                   +-------+ +-----+ +------+ +------+
//!                                   |generic| | io  | |render| | main |
//!                                   +---+---+ +--+--+ +--+---+ +--+---+
//!                                       |        |       |        |
//!                                   workers  workers  workers  begin_frame()
//!                                       \________|_______/     (owning thread)
//!                                                |
//!                                    on finish: resolve dependents

pub mod category;
pub mod closure_job;
pub mod consumer;
pub mod job;
pub mod job_builder;
pub(crate) mod job_table;
pub mod queue;
pub mod scheduler;
