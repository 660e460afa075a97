// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use futures::channel::oneshot;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::SchedulerError;
use crate::global_config::SchedulerConfig;
use crate::job_engine::category::Category;
use crate::job_engine::closure_job::{ClosureJob, Payload};
use crate::job_engine::consumer::Consumer;
use crate::job_engine::job::{Job, JobFailure, JobHandle, JobId, JobState};
use crate::job_engine::job_builder::JobBuilder;
use crate::job_engine::job_table::JobTable;
use crate::job_engine::queue::Lane;

/// Lifecycle of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulerState {
    NotRunning,
    Running,
    ShuttingDown,
    Stopped,
}

/// Counters and queue lengths at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub created: u64,
    pub dispatched: u64,
    pub executed: u64,
    pub failed: u64,
    /// Jobs still held by a handle, a queue or a dependency link.
    pub live_jobs: usize,
    pub queued: Vec<(Category, usize)>,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    dispatched: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
}

/// State shared by the scheduler, its workers, its consumers and spawners.
#[derive(Debug)]
pub(crate) struct SchedulerCore {
    lanes: Vec<Lane>,
    jobs: JobTable,
    /// Workers keep waiting for work while this is set.
    running: AtomicBool,
    /// Cleared on shutdown; no job is created or dispatched afterwards.
    accepting: AtomicBool,
    counters: Counters,
}

impl SchedulerCore {
    fn new(config: &SchedulerConfig) -> Self {
        let lanes = (0..config.category_count)
            .map(|i| {
                let category = Category(i as u8);
                Lane::new(category, Some(category) != config.main_category)
            })
            .collect();
        Self {
            lanes,
            jobs: JobTable::new(),
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn lane(&self, category: Category) -> Result<&Lane, SchedulerError> {
        self.lanes
            .get(category.index())
            .ok_or(SchedulerError::UnknownCategory(category))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SchedulerError::Stopped)
        }
    }

    pub fn create(
        &self,
        category: Category,
        desc: Option<String>,
        work: ClosureJob,
        payload: Payload,
    ) -> Result<JobHandle, SchedulerError> {
        self.ensure_accepting()?;
        self.lane(category)?;
        let id = self.jobs.next_id();
        let job = self
            .jobs
            .insert_while(Job::new(id, category, desc, work, payload), &self.accepting)?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!("created job {} ({})", id, job.desc);
        Ok(JobHandle::new(id))
    }

    pub fn dispatch(&self, id: JobId) -> Result<(), SchedulerError> {
        self.ensure_accepting()?;
        let job = self.jobs.get(id)?;
        match job.mark_dispatched() {
            Ok(true) => self.enqueue(&job),
            Ok(false) => debug!("job {} waits for its dependencies", id),
            Err(e) => {
                error!("dispatch of job {} ({}) rejected: {e}", id, job.desc);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Pushes a job that just became `Dispatched` into its lane. The queue
    /// holds one reference until the job ran.
    fn enqueue(&self, job: &Arc<Job>) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!("not enqueuing job {}, scheduler is shutting down", job.id);
            return;
        }
        job.retain();
        self.lanes[job.category.index()].push(job.id);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn depends_on(&self, dependent: JobId, dependency: JobId) -> Result<(), SchedulerError> {
        if dependent == dependency {
            return Err(SchedulerError::SelfDependency(dependent));
        }
        let dependent_job = self.jobs.get(dependent)?;
        let dependency_job = self.jobs.get(dependency)?;

        if let Err(e) = dependent_job.add_pending() {
            error!("cannot link job {} after it was dispatched", dependent);
            return Err(e);
        }
        // the link holds a reference until the dependency finished; taken
        // before linking because the dependency may finish right away
        dependent_job.retain();

        if dependency_job.add_dependent(dependent) {
            debug!("job {} now depends on job {}", dependent, dependency);
        } else {
            // already finished: the link is satisfied, but a held job still
            // waits for its dispatch
            self.resolve_dependency(&dependent_job, false);
            self.release(dependent)?;
        }
        Ok(())
    }

    pub fn resolve_dependency(&self, job: &Arc<Job>, finished: bool) {
        if job.resolve_one(finished) {
            debug!("dependencies of job {} resolved", job.id);
            self.enqueue(job);
        }
    }

    pub fn release(&self, id: JobId) -> Result<bool, SchedulerError> {
        self.jobs.release(id)
    }

    pub fn job(&self, id: JobId) -> Result<Arc<Job>, SchedulerError> {
        self.jobs.get(id)
    }

    pub fn retain(&self, id: JobId) -> Result<JobHandle, SchedulerError> {
        self.jobs.retain(id)?;
        Ok(JobHandle::new(id))
    }

    /// Gives up on a job that was never submitted.
    pub fn discard(&self, handle: JobHandle) {
        if let Ok(job) = self.jobs.get(handle.id()) {
            job.abandon();
        }
        let _ = self.jobs.release(handle.id());
    }

    pub fn wait(&self, id: JobId) -> Result<(), SchedulerError> {
        match self.jobs.get(id) {
            Ok(job) => job.wait(),
            Err(_) if !self.accepting.load(Ordering::Acquire) => {
                Err(SchedulerError::JobAbandoned(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Executes one popped job on the calling thread and settles everything
    /// that depends on it.
    pub fn run_job(&self, id: JobId) {
        let job = match self.jobs.get(id) {
            Ok(job) => job,
            Err(_) => {
                debug!("skipping job {}, it is gone", id);
                return;
            }
        };

        debug!("executing job {} ({})", id, job.desc);
        if let Some(failure) = job.execute() {
            warn!("job {} ({}) failed: {failure}", id, job.desc);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        self.on_finish(&job);

        // the queue's reference
        if let Err(e) = self.release(id) {
            error!("releasing job {} after execution failed: {e}", id);
        }
    }

    /// Resolves the dependents of a job that just ran, then wakes its
    /// waiters. A waiter therefore finds every dependent already dispatched.
    fn on_finish(&self, job: &Job) {
        for dependent in job.mark_finished() {
            match self.jobs.get(dependent) {
                Ok(dependent_job) => {
                    self.resolve_dependency(&dependent_job, true);
                    if let Err(e) = self.release(dependent) {
                        error!("releasing dependency link of job {dependent} failed: {e}");
                    }
                }
                Err(e) => debug!("dependent of job {} is gone: {e}", job.id),
            }
        }
        job.complete();
    }

    fn abandon_all(&self) {
        for lane in &self.lanes {
            lane.queue.clear();
        }
        let jobs = self.jobs.drain();
        let unfinished = jobs
            .iter()
            .filter(|job| job.state() != JobState::Finished)
            .count();
        for job in &jobs {
            job.abandon();
        }
        if unfinished > 0 {
            info!("abandoned {unfinished} unfinished jobs");
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            created: self.counters.created.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            live_jobs: self.jobs.len(),
            queued: self
                .lanes
                .iter()
                .map(|lane| (lane.category, lane.queue.len()))
                .collect(),
        }
    }
}

/// Resolves once the job finished, or with `JobAbandoned` if it never will.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct JobCompletion {
    id: JobId,
    rx: oneshot::Receiver<()>,
}

impl Future for JobCompletion {
    type Output = Result<(), SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        self.rx
            .poll_unpin(cx)
            .map(|result| result.map_err(|_| SchedulerError::JobAbandoned(id)))
    }
}

/// Cheap, cloneable access for producers that cannot borrow the scheduler,
/// e.g. jobs that queue follow-up work.
#[derive(Debug, Clone)]
pub struct JobSpawner {
    core: Arc<SchedulerCore>,
}

impl JobSpawner {
    pub fn create<P, F>(
        &self,
        category: Category,
        callback: F,
        payload: P,
    ) -> Result<JobHandle, SchedulerError>
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        self.core
            .create(category, None, ClosureJob::new(callback), Box::new(payload))
    }

    pub fn run<P, F>(
        &self,
        category: Category,
        callback: F,
        payload: P,
    ) -> Result<JobHandle, SchedulerError>
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        let handle = self.create(category, callback, payload)?;
        self.core.dispatch(handle.id())?;
        Ok(handle)
    }

    pub fn job<P, F>(&self, category: Category, callback: F, payload: P) -> JobBuilder
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        JobBuilder::new(self.core.clone(), category, ClosureJob::new(callback), Box::new(payload))
    }

    pub fn dispatch(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        self.core.dispatch(handle.id())
    }

    pub fn depends_on(
        &self,
        dependent: &JobHandle,
        dependency: &JobHandle,
    ) -> Result<(), SchedulerError> {
        self.core.depends_on(dependent.id(), dependency.id())
    }

    pub fn release(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.core.release(handle.id()).map(|_| ())
    }

    pub fn dispatch_and_release(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        let dispatched = self.core.dispatch(handle.id());
        let released = self.release(handle);
        dispatched.and(released)
    }
}

#[derive(Debug)]
pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) category: Category,
    pub(super) thread: JoinHandle<()>,
}

/// Joins every worker except the calling one. Returns how many panicked.
pub(super) fn join_workers(workers: impl IntoIterator<Item = Worker>) -> usize {
    let current = thread::current().id();
    let mut panicked = 0;
    for worker in workers {
        if worker.thread.thread().id() == current {
            // dropped from inside one of our own jobs; it exits on its own
            continue;
        }
        if worker.thread.join().is_err() {
            warn!("worker {} for {} panicked", worker.id, worker.category);
            panicked += 1;
        }
    }
    panicked
}

/// Category-based thread pool with dependency resolution.
///
/// Background categories are drained by worker threads. The main category
/// is only drained when the owning thread calls [`Scheduler::begin_frame`].
#[derive(Debug)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    workers: Mutex<Vec<Worker>>,
    main: Option<Consumer>,
    owner: ThreadId,
}

impl Scheduler {
    /// Allocates the lanes without starting any worker.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let core = Arc::new(SchedulerCore::new(&config));
        let main = config.main_category.map(|category| {
            let mut consumer = Consumer::new(core.clone());
            consumer.subscribe(category);
            consumer
        });
        Ok(Self {
            core,
            config,
            state: Mutex::new(SchedulerState::NotRunning),
            workers: Mutex::new(Vec::new()),
            main,
            owner: thread::current().id(),
        })
    }

    /// Builds the scheduler and starts its workers.
    pub fn initialize(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let scheduler = Self::new(config)?;
        scheduler.start()?;
        Ok(scheduler)
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the worker threads. A spawn failure stops the workers that
    /// already started and is returned.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        match *state {
            SchedulerState::NotRunning => {}
            SchedulerState::Running => return Ok(()),
            SchedulerState::ShuttingDown | SchedulerState::Stopped => {
                return Err(SchedulerError::Stopped)
            }
        }

        let background = self.config.background_categories();
        if background.is_empty() && self.config.worker_count > 0 {
            warn!("no background categories, not starting any worker");
        }

        self.core.running.store(true, Ordering::Release);
        let mut workers = self.lock_workers();
        if !background.is_empty() {
            for id in 0..self.config.worker_count {
                let category = background[id % background.len()];
                match spawn_worker(self.core.clone(), id, category) {
                    Ok(thread) => workers.push(Worker {
                        id,
                        category,
                        thread,
                    }),
                    Err(source) => {
                        error!("failed to spawn worker {id} for {category}: {source}");
                        self.core.running.store(false, Ordering::Release);
                        for lane in &self.core.lanes {
                            lane.wake_all();
                        }
                        join_workers(workers.drain(..));
                        return Err(SchedulerError::WorkerSpawn { category, source });
                    }
                }
            }
        }

        for category in &background {
            if !workers.iter().any(|w| w.category == *category) {
                warn!("category {category} has no worker; its jobs will not run");
            }
        }

        *state = SchedulerState::Running;
        info!(
            "scheduler running with {} workers over {} categories",
            workers.len(),
            self.config.category_count
        );
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        *self.lock_state()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.lock_workers().len()
    }

    /// Drains the main category on the owning thread using the configured
    /// drain policy. Returns the number of executed jobs.
    pub fn begin_frame(&self) -> usize {
        self.drain_main(self.config.frame_budget())
    }

    /// Drains the main category; `None` runs it until empty.
    pub fn drain_main(&self, budget: Option<Duration>) -> usize {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "the main category must be drained by the thread that created the scheduler"
        );
        match (&self.main, budget) {
            (None, _) => 0,
            (Some(consumer), None) => consumer.consume_all(),
            (Some(consumer), Some(budget)) => consumer.consume_for(budget),
        }
    }

    pub fn create<P, F>(
        &self,
        category: Category,
        callback: F,
        payload: P,
    ) -> Result<JobHandle, SchedulerError>
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        self.core
            .create(category, None, ClosureJob::new(callback), Box::new(payload))
    }

    /// Create and dispatch in one step.
    pub fn run<P, F>(
        &self,
        category: Category,
        callback: F,
        payload: P,
    ) -> Result<JobHandle, SchedulerError>
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        let handle = self.create(category, callback, payload)?;
        self.dispatch(&handle)?;
        Ok(handle)
    }

    /// Declares a job together with its dependencies; see [`JobBuilder`].
    pub fn job<P, F>(&self, category: Category, callback: F, payload: P) -> JobBuilder
    where
        P: Any + Send,
        F: FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static,
    {
        JobBuilder::new(self.core.clone(), category, ClosureJob::new(callback), Box::new(payload))
    }

    pub fn dispatch(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        self.core.dispatch(handle.id())
    }

    /// Makes `dependent` wait for `dependency`. Must happen before `dependent`
    /// is dispatched. Once linked, the job stays out of its queue until it is
    /// dispatched or one of its dependencies finishes, and in both cases
    /// until every dependency finished. Dispatching it afterwards is accepted
    /// once. Use [`Scheduler::job`] to link several dependencies
    /// atomically.
    pub fn depends_on(
        &self,
        dependent: &JobHandle,
        dependency: &JobHandle,
    ) -> Result<(), SchedulerError> {
        self.core.depends_on(dependent.id(), dependency.id())
    }

    pub fn retain(&self, handle: &JobHandle) -> Result<JobHandle, SchedulerError> {
        self.core.retain(handle.id())
    }

    pub fn release(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.core.release(handle.id()).map(|_| ())
    }

    /// Blocks until the job finished.
    pub fn wait(&self, handle: &JobHandle) -> Result<(), SchedulerError> {
        self.core.wait(handle.id())
    }

    /// Waits, then releases. A failed wait is reported over a failed release.
    pub fn wait_and_release(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        let waited = self.wait(&handle);
        let released = self.release(handle);
        waited.and(released)
    }

    pub fn dispatch_and_release(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        let dispatched = self.dispatch(&handle);
        let released = self.release(handle);
        dispatched.and(released)
    }

    pub fn completion(&self, handle: &JobHandle) -> Result<JobCompletion, SchedulerError> {
        let id = handle.id();
        let rx = self.core.job(id)?.completion();
        Ok(JobCompletion { id, rx })
    }

    pub fn job_state(&self, handle: &JobHandle) -> Result<JobState, SchedulerError> {
        Ok(self.core.job(handle.id())?.state())
    }

    pub fn failure(&self, handle: &JobHandle) -> Result<Option<JobFailure>, SchedulerError> {
        Ok(self.core.job(handle.id())?.failure())
    }

    /// Moves the output out of a finished job.
    pub fn take_payload<P: Any>(&self, handle: &JobHandle) -> Result<Option<P>, SchedulerError> {
        self.core.job(handle.id())?.take_payload()
    }

    /// A consumer with no subscriptions, bound to this scheduler.
    pub fn consumer(&self) -> Consumer {
        Consumer::new(self.core.clone())
    }

    pub fn spawner(&self) -> JobSpawner {
        JobSpawner {
            core: self.core.clone(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// Stops all workers and abandons every job that has not finished.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                SchedulerState::ShuttingDown | SchedulerState::Stopped => return,
                _ => *state = SchedulerState::ShuttingDown,
            }
        }
        info!("scheduler shutting down");

        self.core.accepting.store(false, Ordering::Release);
        self.core.running.store(false, Ordering::Release);
        for lane in &self.core.lanes {
            lane.wake_all();
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        join_workers(workers);

        self.core.abandon_all();
        *self.lock_state() = SchedulerState::Stopped;
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker(
    core: Arc<SchedulerCore>,
    id: usize,
    category: Category,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("jobsys-{category}-{id}"))
        .spawn(move || worker_loop(core, category))
}

/// Waits on the category's signal and drains it until shutdown.
fn worker_loop(core: Arc<SchedulerCore>, category: Category) {
    let Ok(lane) = core.lane(category) else {
        return;
    };
    let Some(signal) = &lane.signal else {
        error!("category {category} has no wake signal, worker exits");
        return;
    };
    let mut consumer = Consumer::new(core.clone());
    consumer.subscribe(category);

    debug!("worker for {category} started");
    loop {
        let has_work = lane.queue.wait_for_items(signal, || core.is_running());
        if !core.is_running() {
            break;
        }
        if has_work {
            consumer.consume_while(|| core.is_running());
        }
    }
    debug!("worker for {category} stopped");
}
