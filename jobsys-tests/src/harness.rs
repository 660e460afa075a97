// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use jobsys::{Category, Scheduler, SchedulerConfig};
use log::{debug, warn};

use crate::test_log::Recorder;

/// Route `log` output through the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scheduler with `workers` threads over `categories` lanes. The main lane,
/// if any, is the last one.
pub fn start_scheduler(workers: usize, categories: usize, with_main: bool) -> Scheduler {
    init_logging();
    let main = with_main.then(|| Category((categories - 1) as u8));
    let config = SchedulerConfig::default()
        .with_workers(workers)
        .with_categories(categories, main);
    debug!("test scheduler: {workers} workers, {categories} categories, main {main:?}");
    Scheduler::initialize(config).unwrap_or_else(|e| panic!("failed to start scheduler: {e}"))
}

/// Polls `condition` until it holds or `timeout` expires.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Runs `f` on another thread and gives up after `timeout`. Returns `None`
/// if it did not finish in time; the thread is left behind in that case.
pub fn within<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    let result = rx.recv_timeout(timeout).ok();
    if result.is_none() {
        warn!("gave up after {timeout:?}");
    }
    result
}

/// Queues a job that only records itself.
pub fn record_job(
    scheduler: &Scheduler,
    recorder: &Recorder,
    name: &str,
    category: Category,
) -> jobsys::JobHandle {
    let recorder = recorder.clone();
    let name = name.to_string();
    scheduler
        .run(
            category,
            move |_: &mut ()| {
                recorder.record(name, category.0);
                Ok(())
            },
            (),
        )
        .unwrap_or_else(|e| panic!("failed to queue job: {e}"))
}
