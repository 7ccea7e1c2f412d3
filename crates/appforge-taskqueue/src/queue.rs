// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The task queue - ordered execution, live tracking, bounded history.
//!
//! Every accepted task becomes a live job: a shared snapshot, an abort
//! flag and the runner to execute. Workers drive jobs through the
//! tracking executor; a reaper task settles completions into the bounded
//! history, whose eviction callback unrecords the oldest finished jobs.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{LogEventSink, TaskEvent, TaskEventSink};
use crate::error::{JobError, Result, TaskError};
use crate::jobs::{JobContext, JobRunner};
use crate::state::{
    FinishVerdict, JobDetail, JobKind, JobSnapshot, JobSnapshotBuilder, MetaStatus,
};
use crate::sync::{BoundedHistoryQueue, Completion, TrackedJob, TrackingExecutor};

/// Submission handed to [`TaskQueue::add_task`].
pub struct NewTask {
    /// Domain record the task operates on.
    pub record_id: u64,
    /// Human-readable description.
    pub description: String,
    /// Kind-specific payload, in its initial state.
    pub detail: JobDetail,
    /// The work to execute.
    pub runner: Arc<dyn JobRunner>,
}

/// A recorded job: shared snapshot, abort flag, runner.
pub(crate) struct LiveJob {
    id: u64,
    record_id: u64,
    kind: JobKind,
    snapshot: Arc<RwLock<JobSnapshot>>,
    abort: watch::Sender<bool>,
    runner: Arc<dyn JobRunner>,
    sink: Arc<dyn TaskEventSink>,
}

impl LiveJob {
    fn new(snapshot: JobSnapshot, runner: Arc<dyn JobRunner>, sink: Arc<dyn TaskEventSink>) -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            id: snapshot.id,
            record_id: snapshot.record_id,
            kind: snapshot.kind(),
            snapshot: Arc::new(RwLock::new(snapshot)),
            abort,
            runner,
            sink,
        }
    }

    async fn current(&self) -> JobSnapshot {
        self.snapshot.read().await.clone()
    }

    fn abort_requested(&self) -> bool {
        *self.abort.borrow()
    }

    fn request_abort(&self) {
        self.abort.send_replace(true);
    }

    fn context(&self) -> JobContext {
        JobContext::new(
            self.id,
            self.record_id,
            self.snapshot.clone(),
            self.abort.clone(),
            self.sink.clone(),
        )
    }

    /// Replaces the snapshot through the validating builder, without
    /// emitting an event. Returns the new snapshot when it changed.
    async fn stamp(&self, mutate: impl FnOnce(&mut JobSnapshotBuilder)) -> Option<JobSnapshot> {
        let mut current = self.snapshot.write().await;
        let mut builder = current.to_builder();
        mutate(&mut builder);
        match builder.build() {
            Ok(next) if next != *current => {
                *current = next.clone();
                Some(next)
            }
            Ok(_) => None,
            Err(err) => {
                error!(job_id = self.id, %err, "Rejected invalid state transition");
                None
            }
        }
    }

    /// Stamps the terminal snapshot for a verdict and emits `Finished`.
    async fn finish(&self, verdict: FinishVerdict) {
        let aborted = self.abort_requested();
        let now = Utc::now().timestamp_millis();
        let stamped = self
            .stamp(|builder| {
                builder.aborted = builder.aborted || aborted;
                match &verdict {
                    FinishVerdict::Success => builder.progress = 100,
                    FinishVerdict::Failed(_) => builder.progress = -1,
                    FinishVerdict::Cancelled => {}
                }
                builder.detail.finalize(verdict.clone());
                builder.meta_status = MetaStatus::Finished;
                builder.finished = now;
            })
            .await;
        if let Some(snapshot) = stamped {
            self.sink.publish(TaskEvent::Finished, &snapshot);
        }
    }
}

#[async_trait]
impl TrackedJob for LiveJob {
    fn job_id(&self) -> u64 {
        self.id
    }

    async fn execute(&self) {
        if self.abort_requested() {
            // aborted while waiting, never runs
            debug!(job_id = self.id, kind = %self.kind, "Job aborted before start");
            self.finish(FinishVerdict::Cancelled).await;
            return;
        }
        let started = Utc::now().timestamp_millis();
        let stamped = self
            .stamp(|builder| {
                builder.meta_status = MetaStatus::Running;
                builder.started = started;
            })
            .await;
        if let Some(snapshot) = stamped {
            self.sink.publish(TaskEvent::Updated, &snapshot);
        }
        info!(job_id = self.id, kind = %self.kind, "Job started");

        let ctx = self.context();
        let verdict = match self.runner.run(&ctx).await {
            Ok(()) => FinishVerdict::Success,
            Err(JobError::Aborted) => FinishVerdict::Cancelled,
            Err(err) if self.abort_requested() => {
                debug!(job_id = self.id, %err, "Job failed after abort request");
                FinishVerdict::Cancelled
            }
            Err(err) => {
                warn!(job_id = self.id, %err, "Job failed");
                FinishVerdict::Failed(Some(err.to_string()))
            }
        };
        self.finish(verdict).await;
        info!(job_id = self.id, kind = %self.kind, "Job finished");
    }
}

#[derive(Default)]
struct Recorder {
    by_id: HashMap<u64, Arc<LiveJob>>,
    by_handle: HashMap<String, u64>,
}

impl Recorder {
    fn handle(kind: JobKind, record_id: u64) -> String {
        format!("{kind}-{record_id}")
    }

    fn insert(&mut self, job: Arc<LiveJob>) {
        self.by_handle
            .insert(Self::handle(job.kind, job.record_id), job.id);
        self.by_id.insert(job.id, job);
    }

    fn remove(&mut self, id: u64) -> Option<Arc<LiveJob>> {
        let job = self.by_id.remove(&id)?;
        let handle = Self::handle(job.kind, job.record_id);
        // a newer job may own the handle by now
        if self.by_handle.get(&handle) == Some(&id) {
            self.by_handle.remove(&handle);
        }
        Some(job)
    }
}

struct QueueInner {
    executor: TrackingExecutor<LiveJob>,
    recorder: RwLock<Recorder>,
    history: BoundedHistoryQueue<JobSnapshot>,
    sink: Arc<dyn TaskEventSink>,
    accepting: AtomicBool,
    next_id: AtomicU64,
    reaper_shutdown: Notify,
}

/// Ordered task queue with live tracking and a bounded finished history.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Queue with `workers` executor workers, keeping at most
    /// `max_finished` finished jobs, logging events at debug level.
    pub fn new(workers: usize, max_finished: NonZeroUsize) -> Self {
        Self::with_event_sink(workers, max_finished, Arc::new(LogEventSink))
    }

    /// Queue publishing lifecycle events to the given sink.
    pub fn with_event_sink(
        workers: usize,
        max_finished: NonZeroUsize,
        sink: Arc<dyn TaskEventSink>,
    ) -> Self {
        let (executor, completions) = TrackingExecutor::new(workers);
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let history = BoundedHistoryQueue::with_eviction_callback(max_finished, move |snapshot| {
            // unrecording needs the recorder lock, which the reaper takes;
            // the callback only forwards the evicted snapshot
            let _ = evicted_tx.send(snapshot);
        });
        let inner = Arc::new(QueueInner {
            executor,
            recorder: RwLock::new(Recorder::default()),
            history,
            sink,
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            reaper_shutdown: Notify::new(),
        });
        let reaper = tokio::spawn(reaper_loop(inner.clone(), completions, evicted_rx));
        Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Queues a new task and returns its id.
    ///
    /// Rejects the submission when an active task of the same kind
    /// already exists for the record.
    pub async fn add_task(&self, task: NewTask) -> Result<u64> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }
        let kind = task.detail.kind();
        let mut recorder = self.inner.recorder.write().await;
        if let Some(&existing_id) = recorder.by_handle.get(&Recorder::handle(kind, task.record_id))
        {
            if let Some(existing) = recorder.by_id.get(&existing_id) {
                if existing.current().await.meta_status != MetaStatus::Finished {
                    return Err(TaskError::AlreadyQueued {
                        kind,
                        record_id: task.record_id,
                    });
                }
            }
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let init =
            JobSnapshotBuilder::new(id, task.record_id, task.description, task.detail).build()?;
        let mut builder = init.to_builder();
        builder.meta_status = MetaStatus::Waiting;
        builder.queued = Utc::now().timestamp_millis();
        let waiting = builder.build()?;
        let job = Arc::new(LiveJob::new(
            waiting.clone(),
            task.runner,
            self.inner.sink.clone(),
        ));
        recorder.insert(job.clone());
        drop(recorder);

        if self.inner.executor.submit(job).await.is_err() {
            self.inner.recorder.write().await.remove(id);
            return Err(TaskError::ShuttingDown);
        }
        self.inner.sink.publish(TaskEvent::Created, &waiting);
        debug!(job_id = id, kind = %kind, record_id = task.record_id, "Task queued");
        Ok(id)
    }

    /// Requests an abort for a task.
    ///
    /// No-op when the task is unknown or already finished. A waiting job
    /// finishes cancelled without running; a running job unwinds at its
    /// next abort checkpoint.
    pub async fn abort_task(&self, id: u64) {
        let job = self.inner.recorder.read().await.by_id.get(&id).cloned();
        let Some(job) = job else {
            debug!(job_id = id, "Abort requested for unknown task");
            return;
        };
        if job.current().await.meta_status == MetaStatus::Finished {
            return;
        }
        info!(job_id = id, "Abort requested");
        job.request_abort();
        if let Some(snapshot) = job.stamp(|builder| builder.aborted = true).await {
            self.inner.sink.publish(TaskEvent::Updated, &snapshot);
        }
    }

    /// Aborts every live task, waiting jobs before running ones.
    pub async fn abort_all_tasks(&self) {
        let jobs: Vec<Arc<LiveJob>> = self
            .inner
            .recorder
            .read()
            .await
            .by_id
            .values()
            .cloned()
            .collect();
        let mut waiting = Vec::new();
        let mut running = Vec::new();
        for job in jobs {
            match job.current().await.meta_status {
                MetaStatus::Waiting => waiting.push(job),
                MetaStatus::Running => running.push(job),
                _ => {}
            }
        }
        info!(
            waiting = waiting.len(),
            running = running.len(),
            "Aborting all tasks"
        );
        // waiting jobs first, so none of them starts while the running
        // set unwinds
        for job in waiting.into_iter().chain(running) {
            job.request_abort();
            if let Some(snapshot) = job.stamp(|builder| builder.aborted = true).await {
                self.inner.sink.publish(TaskEvent::Updated, &snapshot);
            }
        }
    }

    /// Current snapshot of a task, if it is still recorded.
    pub async fn find_task_by_id(&self, id: u64) -> Option<JobSnapshot> {
        let job = self.inner.recorder.read().await.by_id.get(&id).cloned();
        match job {
            Some(job) => Some(job.current().await),
            None => None,
        }
    }

    /// Every recorded task: finished jobs in history order, then running,
    /// then waiting in queue order, then the rest by id.
    pub async fn get_all_tasks(&self) -> Vec<JobSnapshot> {
        let mut result = self.inner.history.iter_snapshot().await;
        let mut seen: HashSet<u64> = result.iter().map(|snapshot| snapshot.id).collect();
        let pending: HashMap<u64, usize> = self
            .inner
            .executor
            .pending_job_ids()
            .await
            .into_iter()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();
        let jobs: Vec<Arc<LiveJob>> = self
            .inner
            .recorder
            .read()
            .await
            .by_id
            .values()
            .cloned()
            .collect();
        let mut live = Vec::new();
        for job in jobs {
            let snapshot = job.current().await;
            if seen.insert(snapshot.id) {
                live.push(snapshot);
            }
        }
        live.sort_by_key(|snapshot| match snapshot.meta_status {
            MetaStatus::Finished => (0usize, 0usize, snapshot.id),
            MetaStatus::Running => (1, 0, snapshot.id),
            MetaStatus::Waiting => match pending.get(&snapshot.id) {
                Some(&position) => (2, position, snapshot.id),
                None => (3, 0, snapshot.id),
            },
            MetaStatus::Init => (4, 0, snapshot.id),
        });
        result.extend(live);
        result
    }

    /// Snapshots matching a predicate. See [`predicates`].
    pub async fn get_tasks(&self, predicate: impl Fn(&JobSnapshot) -> bool) -> Vec<JobSnapshot> {
        self.get_all_tasks()
            .await
            .into_iter()
            .filter(|snapshot| predicate(snapshot))
            .collect()
    }

    /// Active capture-type tasks (conversion, manual mode, rebuild) for a
    /// record.
    pub async fn find_active_tasks_for_app(&self, record_id: u64) -> Vec<JobSnapshot> {
        self.get_tasks(|snapshot| {
            snapshot.record_id == record_id
                && snapshot.meta_status != MetaStatus::Finished
                && matches!(
                    snapshot.kind(),
                    JobKind::Conversion | JobKind::ManualMode | JobKind::Rebuild
                )
        })
        .await
    }

    /// Active feed scans for a record.
    pub async fn find_active_tasks_for_feed(&self, feed_id: u64) -> Vec<JobSnapshot> {
        self.get_tasks(|snapshot| {
            snapshot.record_id == feed_id
                && snapshot.meta_status != MetaStatus::Finished
                && snapshot.kind() == JobKind::FeedScan
        })
        .await
    }

    /// Number of active tasks whose capture request references a datastore.
    pub async fn count_active_tasks_by_datastore_id(&self, datastore_id: u64) -> usize {
        self.get_tasks(|snapshot| {
            if snapshot.meta_status == MetaStatus::Finished {
                return false;
            }
            match &snapshot.detail {
                JobDetail::Conversion(detail) => detail.capture.datastore_id == datastore_id,
                JobDetail::ManualMode(detail) => detail.capture.datastore_id == datastore_id,
                _ => false,
            }
        })
        .await
        .len()
    }

    /// Ids of tasks still waiting for a worker, queue order.
    pub async fn pending_task_ids(&self) -> Vec<u64> {
        self.inner.executor.pending_job_ids().await
    }

    /// Moves a waiting task to the front of the queue.
    pub async fn move_to_head(&self, id: u64) -> bool {
        self.inner.executor.move_to_head(id).await
    }

    /// Moves a waiting task to the back of the queue.
    pub async fn move_to_tail(&self, id: u64) -> bool {
        self.inner.executor.move_to_tail(id).await
    }

    /// Moves a waiting task directly after another waiting task.
    pub async fn move_after(&self, id: u64, after_id: u64) -> bool {
        self.inner.executor.move_after(id, after_id).await
    }

    /// Drops every finished task, returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let drained = self.inner.history.drain().await;
        if drained.is_empty() {
            return 0;
        }
        let mut recorder = self.inner.recorder.write().await;
        for snapshot in &drained {
            recorder.remove(snapshot.id);
        }
        drop(recorder);
        for snapshot in &drained {
            self.inner.sink.publish(TaskEvent::Removed, snapshot);
        }
        info!(count = drained.len(), "Cleaned up finished tasks");
        drained.len()
    }

    /// Drops one finished task. Errors when the task is unknown or has
    /// not finished yet.
    pub async fn cleanup_task(&self, id: u64) -> Result<()> {
        let job = self
            .inner
            .recorder
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))?;
        let snapshot = job.current().await;
        if snapshot.meta_status != MetaStatus::Finished {
            return Err(TaskError::NotFinished(id));
        }
        self.inner.history.remove_where(|entry| entry.id == id).await;
        self.inner.recorder.write().await.remove(id);
        self.inner.sink.publish(TaskEvent::Removed, &snapshot);
        debug!(job_id = id, "Cleaned up finished task");
        Ok(())
    }

    /// Changes the executor worker count, clamped to at least one.
    pub async fn resize_pool(&self, workers: usize) {
        self.inner.executor.resize_workers(workers).await;
    }

    /// Number of live executor workers.
    pub fn pool_size(&self) -> usize {
        self.inner.executor.worker_count()
    }

    /// Stops accepting tasks, drains the backlog and stops the reaper.
    ///
    /// With `abort_active`, live tasks are aborted first: waiting jobs
    /// finish cancelled without running and running jobs unwind at their
    /// next abort checkpoint.
    pub async fn graceful_shutdown(&self, abort_active: bool) {
        info!(abort_active, "Task queue shutting down");
        self.inner.accepting.store(false, Ordering::SeqCst);
        if abort_active {
            self.abort_all_tasks().await;
        }
        self.inner.executor.shutdown().await;
        self.inner.reaper_shutdown.notify_one();
        let handle = self.reaper.lock().await.take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                warn!("Reaper task ended abnormally");
            }
        }
        info!("Task queue stopped");
    }
}

/// Snapshot predicates for [`TaskQueue::get_tasks`].
pub mod predicates {
    use crate::state::{JobSnapshot, MetaStatus};

    /// Matches tasks that have not finished.
    pub const NOT_FINISHED: fn(&JobSnapshot) -> bool =
        |snapshot| snapshot.meta_status != MetaStatus::Finished;

    /// Matches queued tasks no worker picked up yet.
    pub const WAITING: fn(&JobSnapshot) -> bool =
        |snapshot| snapshot.meta_status == MetaStatus::Waiting;

    /// Matches running tasks.
    pub const RUNNING: fn(&JobSnapshot) -> bool =
        |snapshot| snapshot.meta_status == MetaStatus::Running;

    /// Matches finished tasks.
    pub const FINISHED: fn(&JobSnapshot) -> bool =
        |snapshot| snapshot.meta_status == MetaStatus::Finished;
}

async fn reaper_loop(
    inner: Arc<QueueInner>,
    mut completions: mpsc::UnboundedReceiver<Completion<LiveJob>>,
    mut evicted: mpsc::UnboundedReceiver<JobSnapshot>,
) {
    debug!("Reaper started");
    loop {
        tokio::select! {
            biased;
            _ = inner.reaper_shutdown.notified() => break,
            completion = completions.recv() => match completion {
                Some(completion) => settle_completion(&inner, completion, &mut evicted).await,
                None => break,
            },
        }
    }
    // completions buffered before the stop signal still settle
    while let Ok(completion) = completions.try_recv() {
        settle_completion(&inner, completion, &mut evicted).await;
    }
    debug!("Reaper stopped");
}

async fn settle_completion(
    inner: &Arc<QueueInner>,
    completion: Completion<LiveJob>,
    evicted: &mut mpsc::UnboundedReceiver<JobSnapshot>,
) {
    let Some(job) = completion.original else {
        return;
    };
    if completion.panicked && job.current().await.meta_status != MetaStatus::Finished {
        error!(job_id = job.id, "Job panicked, repairing terminal state");
        job.finish(FinishVerdict::Failed(Some("Job panicked".to_string())))
            .await;
    }
    let snapshot = job.current().await;
    if snapshot.meta_status != MetaStatus::Finished {
        warn!(job_id = job.id, "Completion without a terminal snapshot");
        return;
    }
    // a cleanup may have raced the completion; dropped jobs stay dropped
    if !inner.recorder.read().await.by_id.contains_key(&job.id) {
        return;
    }
    inner.history.push(snapshot).await;
    while let Ok(removed) = evicted.try_recv() {
        inner.recorder.write().await.remove(removed.id);
        inner.sink.publish(TaskEvent::Removed, &removed);
        debug!(job_id = removed.id, "Evicted finished task from history");
    }
}
