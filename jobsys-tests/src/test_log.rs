// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// One executed job as seen from inside its callback.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggedJob {
    pub name: String,

    pub category: u8,

    /// Name of the executing thread, e.g. `jobsys-io-1`
    pub thread: String,

    /// Global execution order, starting at 0
    pub sequence: u64,

    pub started_nsec: u64,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct TestLog {
    pub events: Vec<LoggedJob>,
}

impl TestLog {
    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name == name).count()
    }

    pub fn position(&self, name: &str) -> Option<u64> {
        self.events
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.sequence)
    }

    /// Whether `first` executed before `second`. False if either is missing.
    pub fn ran_before(&self, first: &str, second: &str) -> bool {
        match (self.position(first), self.position(second)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Names of the jobs of one category in execution order.
    pub fn order_in(&self, category: u8) -> Vec<&str> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.category == category)
            .collect();
        events.sort_by_key(|e| e.sequence);
        events.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn threads_of(&self, category: u8) -> Vec<&str> {
        let mut threads: Vec<&str> = self
            .events
            .iter()
            .filter(|e| e.category == category)
            .map(|e| e.thread.as_str())
            .collect();
        threads.sort_unstable();
        threads.dedup();
        threads
    }
}

/// Thread-safe recorder shared with job callbacks.
#[derive(Debug, Clone)]
pub struct Recorder {
    start: Instant,
    sequence: Arc<AtomicU64>,
    events: Arc<Mutex<Vec<LoggedJob>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            sequence: Arc::new(AtomicU64::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, name: impl Into<String>, category: u8) {
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        let mut events = self.events.lock().unwrap();
        // taken under the lock so the sequence matches the push order
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        events.push(LoggedJob {
            name: name.into(),
            category,
            thread,
            sequence,
            started_nsec: self.start.elapsed().as_nanos() as u64,
        });
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> TestLog {
        TestLog {
            events: self.events.lock().unwrap().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_positions() {
        let recorder = Recorder::new();
        recorder.record("a", 0);
        recorder.record("b", 1);
        recorder.record("c", 0);

        let log = recorder.snapshot();
        assert_eq!(log.order_in(0), vec!["a", "c"]);
        assert!(log.ran_before("a", "b"));
        assert!(!log.ran_before("c", "b"));
        assert!(!log.ran_before("a", "missing"));
        assert_eq!(log.count("b"), 1);
    }

    #[test]
    fn log_survives_json() {
        let recorder = Recorder::new();
        recorder.record("load", 2);
        let log = recorder.snapshot();
        let json = serde_json::to_string(&log).unwrap();
        assert_eq!(serde_json::from_str::<TestLog>(&json).unwrap(), log);
    }
}
