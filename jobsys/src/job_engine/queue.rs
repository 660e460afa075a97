// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::job_engine::category::Category;
use crate::job_engine::job::JobId;

/// Mutex-guarded FIFO. Every operation holds the lock for its whole duration.
///
/// The queue never blocks by itself. Blocking is layered on top by pairing
/// it with a `Condvar` (see [`Queue::wait_for_items`]), which parks on the
/// same mutex that guards the items, so a push can never slip in between
/// the emptiness check and the wait.
#[derive(Debug)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // items stay consistent even if a holder panicked
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every remaining item and hands them back to the caller.
    pub fn clear(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Parks on `signal` while the queue is empty and `keep_waiting` holds.
    /// Returns whether items are available.
    pub fn wait_for_items<F>(&self, signal: &Condvar, keep_waiting: F) -> bool
    where
        F: Fn() -> bool,
    {
        let mut items = self.lock();
        while items.is_empty() && keep_waiting() {
            items = signal.wait(items).unwrap_or_else(PoisonError::into_inner);
        }
        !items.is_empty()
    }

    /// Wakes every waiter on `signal`. The lock is taken first, so a waiter
    /// that already checked its predicate is guaranteed to be parked.
    pub fn notify_all(&self, signal: &Condvar) {
        let _items = self.lock();
        signal.notify_all();
    }
}

impl<T: Clone> Queue<T> {
    pub fn peek_front(&self) -> Option<T> {
        self.lock().front().cloned()
    }

    pub fn peek_back(&self) -> Option<T> {
        self.lock().back().cloned()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.lock().clear();
    }
}

/// The queue of one category plus its wake signal.
///
/// The main lane has no signal; it is drained by the owning thread.
#[derive(Debug)]
pub(crate) struct Lane {
    pub category: Category,
    pub queue: Queue<JobId>,
    pub signal: Option<Condvar>,
}

impl Lane {
    pub fn new(category: Category, with_signal: bool) -> Self {
        Self {
            category,
            queue: Queue::new(),
            signal: with_signal.then(Condvar::new),
        }
    }

    /// Makes the job visible in this lane and wakes one worker.
    pub fn push(&self, id: JobId) {
        self.queue.push(id);
        if let Some(signal) = &self.signal {
            signal.notify_one();
        }
    }

    pub fn wake_all(&self) {
        if let Some(signal) = &self.signal {
            self.queue.notify_all(signal);
        }
    }
}
