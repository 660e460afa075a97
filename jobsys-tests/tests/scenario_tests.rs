// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use jobsys::{Category, JobState, Scheduler, SchedulerConfig, SchedulerError, SchedulerState};
use jobsys_tests::harness::{init_logging, record_job, start_scheduler, wait_until, within};
use jobsys_tests::test_log::Recorder;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_single_job_finishes() {
    let scheduler = start_scheduler(2, 5, true);
    let recorder = Recorder::new();

    let a = record_job(&scheduler, &recorder, "a", Category::GENERIC);
    scheduler.wait(&a).unwrap();

    assert_eq!(scheduler.job_state(&a).unwrap(), JobState::Finished);
    assert_eq!(recorder.snapshot().count("a"), 1);
    scheduler.release(a).unwrap();
}

#[test]
fn test_dependent_stays_pending_until_dependency_finished() {
    let scheduler = start_scheduler(4, 5, true);
    let recorder = Recorder::new();
    let gate = Arc::new(Mutex::new(()));
    let closed = gate.lock().unwrap();

    let r = recorder.clone();
    let g = gate.clone();
    let a = scheduler
        .create(
            Category::GENERIC,
            move |_: &mut ()| {
                drop(g.lock().unwrap());
                r.record("a", 0);
                Ok(())
            },
            (),
        )
        .unwrap();
    let r = recorder.clone();
    let b = scheduler
        .create(
            Category::IO,
            move |_: &mut ()| {
                r.record("b", 2);
                Ok(())
            },
            (),
        )
        .unwrap();

    scheduler.depends_on(&b, &a).unwrap();
    scheduler.dispatch(&a).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(scheduler.job_state(&b).unwrap(), JobState::PendingDependency);
    assert!(recorder.is_empty());

    drop(closed);
    scheduler.wait(&b).unwrap();

    let log = recorder.snapshot();
    assert!(log.ran_before("a", "b"));
    assert_eq!(log.count("b"), 1);
    scheduler.release(a).unwrap();
    scheduler.release(b).unwrap();
}

#[test]
fn test_thousand_jobs_from_eight_producers() {
    // only generic is served by workers, so all four share its lane
    let scheduler = Arc::new(start_scheduler(4, 2, true));
    let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    assert_eq!(scheduler.worker_count(), 4);

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let spawner = scheduler.spawner();
            let runs = runs.clone();
            thread::spawn(move || {
                for i in (p..1000).step_by(8) {
                    let runs = runs.clone();
                    let handle = spawner
                        .run(
                            Category::GENERIC,
                            move |_: &mut ()| {
                                runs[i].fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            },
                            (),
                        )
                        .unwrap();
                    spawner.release(handle).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(TIMEOUT, || scheduler.stats().executed == 1000));
    assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    assert!(wait_until(TIMEOUT, || scheduler.stats().live_jobs == 0));
}

#[test]
fn test_main_jobs_run_only_in_begin_frame() {
    let scheduler = start_scheduler(2, 5, true);
    let recorder = Recorder::new();

    let handles: Vec<_> = ["m1", "m2", "m3"]
        .iter()
        .map(|name| record_job(&scheduler, &recorder, name, Category::MAIN))
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert!(recorder.is_empty());

    assert_eq!(scheduler.begin_frame(), 3);
    let log = recorder.snapshot();
    assert_eq!(log.order_in(Category::MAIN.0), vec!["m1", "m2", "m3"]);
    for handle in handles {
        assert_eq!(scheduler.job_state(&handle).unwrap(), JobState::Finished);
        scheduler.release(handle).unwrap();
    }
}

#[test]
fn test_dependent_dispatched_once_after_all_dependencies() {
    let scheduler = start_scheduler(4, 5, true);
    let recorder = Recorder::new();

    let deps: Vec<_> = (0..5)
        .map(|i| {
            let category = [Category::GENERIC, Category::IO, Category::RENDER][i % 3];
            record_job(&scheduler, &recorder, &format!("dep-{i}"), category)
        })
        .collect();

    let r = recorder.clone();
    let mut builder = scheduler.job(
        Category::LOGGING,
        move |_: &mut ()| {
            r.record("join", 1);
            Ok(())
        },
        (),
    );
    for dep in &deps {
        builder = builder.after(dep);
    }
    let join = builder.submit().unwrap();
    scheduler.wait(&join).unwrap();

    let log = recorder.snapshot();
    assert_eq!(log.count("join"), 1);
    for i in 0..5 {
        assert!(log.ran_before(&format!("dep-{i}"), "join"));
    }
    // no late duplicate run
    thread::sleep(Duration::from_millis(20));
    assert_eq!(recorder.snapshot().count("join"), 1);

    scheduler.release(join).unwrap();
    for dep in deps {
        scheduler.release(dep).unwrap();
    }
}

#[test]
fn test_builder_with_finished_dependencies() {
    let scheduler = start_scheduler(4, 5, true);
    let recorder = Recorder::new();

    let done = record_job(&scheduler, &recorder, "done", Category::GENERIC);
    scheduler.wait(&done).unwrap();

    let gate = Arc::new(Mutex::new(()));
    let closed = gate.lock().unwrap();
    let g = gate.clone();
    let r = recorder.clone();
    let slow = scheduler
        .run(
            Category::IO,
            move |_: &mut ()| {
                drop(g.lock().unwrap());
                r.record("slow", 2);
                Ok(())
            },
            (),
        )
        .unwrap();

    let r = recorder.clone();
    let last = scheduler
        .job(
            Category::GENERIC,
            move |_: &mut ()| {
                r.record("last", 0);
                Ok(())
            },
            (),
        )
        .after(&done)
        .after(&slow)
        .desc("after done and slow")
        .submit()
        .unwrap();
    assert_eq!(scheduler.job_state(&last).unwrap(), JobState::PendingDependency);

    drop(closed);
    scheduler.wait(&last).unwrap();
    let log = recorder.snapshot();
    assert!(log.ran_before("slow", "last"));
    assert_eq!(log.count("last"), 1);

    for handle in [done, slow, last] {
        scheduler.release(handle).unwrap();
    }
}

#[test]
fn test_concurrent_dispatch_lands_once() {
    init_logging();
    // not started: every dispatched job stays visible in its queue
    let scheduler = Scheduler::new(SchedulerConfig::default().with_workers(2)).unwrap();
    let barrier = Arc::new(Barrier::new(6));
    let runs = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..6)
        .map(|_| {
            let spawner = scheduler.spawner();
            let barrier = barrier.clone();
            let runs = runs.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let runs = runs.clone();
                    let handle = spawner
                        .create(
                            Category::IO,
                            move |_: &mut ()| {
                                runs.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            },
                            (),
                        )
                        .unwrap();
                    spawner.dispatch_and_release(handle).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let stats = scheduler.stats();
    assert!(stats.queued.contains(&(Category::IO, 300)));
    assert_eq!(stats.dispatched, 300);

    let mut consumer = scheduler.consumer();
    consumer.subscribe(Category::IO);
    assert_eq!(consumer.consume_all(), 300);
    assert_eq!(runs.load(Ordering::SeqCst), 300);
    assert_eq!(scheduler.stats().live_jobs, 0);
}

#[test]
fn test_shutdown_with_idle_workers_is_bounded() {
    let scheduler = start_scheduler(6, 5, true);
    thread::sleep(Duration::from_millis(20));

    let state = within(TIMEOUT, move || {
        scheduler.shutdown();
        scheduler.state()
    });
    assert_eq!(state, Some(SchedulerState::Stopped));
}

#[test]
fn test_shutdown_abandons_waiters() {
    let scheduler = Arc::new(start_scheduler(1, 5, true));
    let never = scheduler
        .create(Category::GENERIC, |_: &mut ()| Ok(()), ())
        .unwrap();
    let queued = scheduler
        .run(Category::MAIN, |_: &mut ()| Ok(()), ())
        .unwrap();
    let completion = scheduler.completion(&queued).unwrap();

    let waiter = {
        let scheduler = scheduler.clone();
        thread::spawn(move || {
            let result = scheduler.wait(&queued);
            (result, queued)
        })
    };
    thread::sleep(Duration::from_millis(20));
    scheduler.shutdown();

    let (result, queued) = waiter.join().unwrap();
    assert!(matches!(result, Err(SchedulerError::JobAbandoned(_))));
    assert!(matches!(
        scheduler.wait(&never),
        Err(SchedulerError::JobAbandoned(_))
    ));
    assert!(matches!(
        futures::executor::block_on(completion),
        Err(SchedulerError::JobAbandoned(_))
    ));
    assert_eq!(scheduler.stats().live_jobs, 0);
    // releasing after shutdown reports the job as gone
    assert!(scheduler.release(never).is_err());
    assert!(scheduler.release(queued).is_err());
}

#[test]
fn test_zero_budget_drain_never_blocks() {
    let scheduler = start_scheduler(1, 5, true);
    let recorder = Recorder::new();
    let mut consumer = scheduler.consumer();
    consumer.subscribe(Category::MAIN);

    // nothing ready: returns at once
    assert_eq!(within(TIMEOUT, move || consumer.consume_for(Duration::ZERO)), Some(0));

    let first = record_job(&scheduler, &recorder, "first", Category::MAIN);
    let second = record_job(&scheduler, &recorder, "second", Category::MAIN);
    let mut consumer = scheduler.consumer();
    consumer.subscribe(Category::MAIN);
    assert_eq!(consumer.consume_for(Duration::ZERO), 1);
    assert_eq!(recorder.snapshot().order_in(Category::MAIN.0), vec!["first"]);
    assert!(consumer.has_work());

    assert_eq!(consumer.consume_for(Duration::from_secs(1)), 1);
    assert!(!consumer.has_work());
    scheduler.release(first).unwrap();
    scheduler.release(second).unwrap();
}

#[test]
fn test_budgeted_drain_leaves_later_jobs() {
    init_logging();
    let config = SchedulerConfig::default()
        .with_workers(1)
        .with_frame_budget(Duration::from_secs(5));
    let scheduler = Scheduler::initialize(config).unwrap();
    let spawner = scheduler.spawner();
    let recorder = Recorder::new();

    // each job queues a follow-up; the budgeted drain only runs the snapshot
    let r = recorder.clone();
    let parent = scheduler
        .run(
            Category::MAIN,
            move |_: &mut ()| {
                r.record("parent", 4);
                let r = r.clone();
                let child = spawner.run(
                    Category::MAIN,
                    move |_: &mut ()| {
                        r.record("child", 4);
                        Ok(())
                    },
                    (),
                )?;
                spawner.release(child)?;
                Ok(())
            },
            (),
        )
        .unwrap();

    assert_eq!(scheduler.begin_frame(), 1);
    assert_eq!(recorder.snapshot().count("child"), 0);
    assert_eq!(scheduler.begin_frame(), 1);
    assert_eq!(recorder.snapshot().count("child"), 1);
    scheduler.release(parent).unwrap();
}

#[test]
fn test_live_jobs_return_to_zero() {
    let scheduler = start_scheduler(4, 5, true);
    let recorder = Recorder::new();

    let mut handles = Vec::new();
    for i in 0..20 {
        let a = record_job(&scheduler, &recorder, &format!("a{i}"), Category::IO);
        let b = scheduler
            .job(Category::RENDER, |_: &mut ()| Ok(()), ())
            .after(&a)
            .submit()
            .unwrap();
        handles.push(a);
        handles.push(b);
    }
    for handle in handles {
        scheduler.wait_and_release(handle).unwrap();
    }

    let stats = scheduler.stats();
    assert_eq!(stats.live_jobs, 0);
    assert_eq!(stats.executed, 40);
    assert_eq!(stats.failed, 0);
}
