// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use smallvec::SmallVec;

use crate::job_engine::category::Category;
use crate::job_engine::scheduler::SchedulerCore;

/// Pulls ready jobs from one or more categories and runs them on the
/// calling thread.
///
/// Subscribed lanes are polled in subscription order, so the first
/// subscription is drained before later ones are looked at.
#[derive(Debug)]
pub struct Consumer {
    core: Arc<SchedulerCore>,
    subscriptions: SmallVec<[Category; 4]>,
}

impl Consumer {
    pub(crate) fn new(core: Arc<SchedulerCore>) -> Self {
        Self {
            core,
            subscriptions: SmallVec::new(),
        }
    }

    /// Watches another category. Unknown or already watched categories are ignored.
    pub fn subscribe(&mut self, category: Category) {
        if self.core.lane(category).is_err() {
            debug!("ignoring subscription to unknown {category}");
            return;
        }
        if !self.subscriptions.contains(&category) {
            self.subscriptions.push(category);
        }
    }

    pub fn subscriptions(&self) -> &[Category] {
        &self.subscriptions
    }

    /// Executes at most one ready job. Returns whether one ran.
    pub fn consume_one(&self) -> bool {
        for category in &self.subscriptions {
            let Ok(lane) = self.core.lane(*category) else {
                continue;
            };
            if let Some(id) = lane.queue.pop() {
                self.core.run_job(id);
                return true;
            }
        }
        false
    }

    /// Runs jobs until every subscribed lane is empty, including jobs that
    /// become ready while draining.
    pub fn consume_all(&self) -> usize {
        self.consume_while(|| true)
    }

    /// Like [`Consumer::consume_all`], but checks `keep_going` before each job.
    pub fn consume_while<F>(&self, keep_going: F) -> usize
    where
        F: Fn() -> bool,
    {
        let mut executed = 0;
        while keep_going() && self.consume_one() {
            executed += 1;
        }
        executed
    }

    /// Runs the jobs that are ready right now until `budget` is used up.
    ///
    /// Jobs queued while draining are left for the next call. The budget is
    /// checked after each job, so one ready job always runs; the call never
    /// blocks.
    pub fn consume_for(&self, budget: Duration) -> usize {
        let deadline = Instant::now() + budget;
        let mut ready: SmallVec<[(Category, usize); 4]> = self
            .subscriptions
            .iter()
            .filter_map(|c| self.core.lane(*c).ok().map(|lane| (*c, lane.queue.len())))
            .collect();

        let mut executed = 0;
        while let Some((category, remaining)) = ready.iter_mut().find(|(_, n)| *n > 0) {
            *remaining -= 1;
            let Some(id) = self
                .core
                .lane(*category)
                .ok()
                .and_then(|lane| lane.queue.pop())
            else {
                // someone else drained this lane meanwhile
                *remaining = 0;
                continue;
            };
            self.core.run_job(id);
            executed += 1;
            if Instant::now() >= deadline {
                break;
            }
        }
        executed
    }

    /// Whether any subscribed lane has a ready job. Never blocks on work.
    pub fn has_work(&self) -> bool {
        self.subscriptions.iter().any(|c| {
            self.core
                .lane(*c)
                .map(|lane| !lane.queue.is_empty())
                .unwrap_or(false)
        })
    }
}
