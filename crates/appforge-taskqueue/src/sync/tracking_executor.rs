// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool that tracks every submission through to completion.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::OrderableQueue;

/// A unit of work the executor can track through completion.
#[async_trait]
pub trait TrackedJob: Send + Sync + 'static {
    /// Stable identifier used for reordering and logging.
    fn job_id(&self) -> u64;

    /// Runs the job. Must leave the job in a terminal state on every path.
    async fn execute(&self);
}

/// Completion record for one submission.
///
/// The submitted object rides along so the reaper can run bookkeeping
/// against it; detached futures complete with `original` unset.
#[derive(Debug)]
pub struct Completion<J> {
    /// The submitted job, `None` for detached futures.
    pub original: Option<Arc<J>>,
    /// Whether execution panicked before finishing.
    pub panicked: bool,
}

/// Error returned when submitting to a shut-down executor.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Executor is shut down")]
pub struct ExecutorClosed;

type DetachedFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Work<J> {
    Job(Arc<J>),
    Detached(DetachedFuture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKey {
    Job(u64),
    Detached(u64),
}

/// Pending-queue entry. Probes built for the move operations carry a key
/// and no payload; they are compared against the queue but never pushed.
struct PendingEntry<J> {
    key: EntryKey,
    work: Option<Work<J>>,
}

impl<J> PendingEntry<J> {
    fn probe(job_id: u64) -> Self {
        Self {
            key: EntryKey::Job(job_id),
            work: None,
        }
    }
}

impl<J> PartialEq for PendingEntry<J> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

struct ExecutorShared<J> {
    pending: OrderableQueue<PendingEntry<J>>,
    completions: mpsc::UnboundedSender<Completion<J>>,
    desired_workers: AtomicUsize,
    live_workers: AtomicUsize,
    accepting: AtomicBool,
    wake: Notify,
    next_detached: AtomicU64,
}

/// Bounded worker pool over an [`OrderableQueue`] of pending submissions.
///
/// Workers pop submissions in queue order and run each one inside a nested
/// task, so a panicking job is contained and reported on the completion
/// channel instead of killing its worker. Pending submissions can be
/// repositioned by job id until a worker picks them up.
pub struct TrackingExecutor<J> {
    shared: Arc<ExecutorShared<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl<J: TrackedJob> TrackingExecutor<J> {
    /// Creates the pool with `workers` worker tasks (at least one) and
    /// returns it together with its completion stream.
    pub fn new(workers: usize) -> (Self, mpsc::UnboundedReceiver<Completion<J>>) {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ExecutorShared {
            pending: OrderableQueue::new(),
            completions: tx,
            desired_workers: AtomicUsize::new(workers),
            live_workers: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            wake: Notify::new(),
            next_detached: AtomicU64::new(1),
        });
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            shared.live_workers.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(worker_loop(shared.clone(), worker_id)));
        }
        let executor = Self {
            shared,
            workers: Mutex::new(handles),
            next_worker_id: AtomicUsize::new(workers),
        };
        (executor, rx)
    }

    /// Queues a job for execution.
    pub async fn submit(&self, job: Arc<J>) -> Result<(), ExecutorClosed> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(ExecutorClosed);
        }
        let entry = PendingEntry {
            key: EntryKey::Job(job.job_id()),
            work: Some(Work::Job(job)),
        };
        self.shared.pending.push(entry).await;
        Ok(())
    }

    /// Runs an anonymous future through the pool.
    ///
    /// Its completion carries no original object and cannot be reordered.
    pub async fn submit_detached<F>(&self, future: F) -> Result<(), ExecutorClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(ExecutorClosed);
        }
        let seq = self.shared.next_detached.fetch_add(1, Ordering::SeqCst);
        let entry = PendingEntry {
            key: EntryKey::Detached(seq),
            work: Some(Work::Detached(Box::pin(future))),
        };
        self.shared.pending.push(entry).await;
        Ok(())
    }

    /// Moves a pending job to the front of the queue.
    pub async fn move_to_head(&self, job_id: u64) -> bool {
        self.shared
            .pending
            .move_to_head(&PendingEntry::probe(job_id))
            .await
    }

    /// Moves a pending job to the back of the queue.
    pub async fn move_to_tail(&self, job_id: u64) -> bool {
        self.shared
            .pending
            .move_to_tail(&PendingEntry::probe(job_id))
            .await
    }

    /// Moves a pending job directly after another pending job.
    pub async fn move_after(&self, job_id: u64, after_id: u64) -> bool {
        self.shared
            .pending
            .move_after(&PendingEntry::probe(job_id), &PendingEntry::probe(after_id))
            .await
    }

    /// Ids of jobs still waiting for a worker, queue order.
    pub async fn pending_job_ids(&self) -> Vec<u64> {
        self.shared
            .pending
            .project(|entry| match entry.key {
                EntryKey::Job(id) => Some(id),
                EntryKey::Detached(_) => None,
            })
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Number of submissions waiting for a worker.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.len().await
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    /// Changes the worker count, clamped to at least one.
    ///
    /// Growing spawns workers immediately; shrinking lets excess workers
    /// exit after their current job.
    pub async fn resize_workers(&self, target: usize) {
        let target = target.max(1);
        self.shared.desired_workers.store(target, Ordering::SeqCst);
        if self.shared.accepting.load(Ordering::SeqCst) {
            let mut handles = self.workers.lock().await;
            while self.shared.live_workers.load(Ordering::SeqCst) < target {
                let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                self.shared.live_workers.fetch_add(1, Ordering::SeqCst);
                handles.push(tokio::spawn(worker_loop(self.shared.clone(), worker_id)));
            }
        }
        // idle workers re-check the desired count once woken
        self.shared.wake.notify_waiters();
    }

    /// Stops accepting work and waits for the pending queue to drain.
    ///
    /// Submissions that race the closing flag and land after the workers
    /// have exited are dropped with a warning.
    pub async fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        self.join_workers().await;
        self.discard_pending().await;
    }

    /// Stops accepting work and drops everything still pending.
    ///
    /// Jobs already picked up run to completion; dropped submissions never
    /// produce a completion.
    pub async fn shutdown_now(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.discard_pending().await;
        self.shared.wake.notify_waiters();
        self.join_workers().await;
        self.discard_pending().await;
    }

    async fn join_workers(&self) {
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if handle.await.is_err() {
                warn!("Executor worker ended abnormally");
            }
        }
    }

    async fn discard_pending(&self) {
        let mut dropped = 0usize;
        while self.shared.pending.try_pop().await.is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "Discarded submissions during executor shutdown");
        }
    }
}

async fn worker_loop<J: TrackedJob>(shared: Arc<ExecutorShared<J>>, worker_id: usize) {
    debug!(worker_id, "Executor worker started");
    let mut retired = false;
    loop {
        if try_retire(&shared) {
            retired = true;
            break;
        }
        if !shared.accepting.load(Ordering::SeqCst) {
            match shared.pending.try_pop().await {
                Some(entry) => run_entry(&shared, entry).await,
                None => break,
            }
            continue;
        }
        tokio::select! {
            biased;
            _ = shared.wake.notified() => {}
            entry = shared.pending.pop() => run_entry(&shared, entry).await,
        }
    }
    if !retired {
        shared.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
    debug!(worker_id, "Executor worker stopped");
}

/// Claims one retirement slot when more workers are live than desired.
fn try_retire<J>(shared: &ExecutorShared<J>) -> bool {
    loop {
        let live = shared.live_workers.load(Ordering::SeqCst);
        let desired = shared.desired_workers.load(Ordering::SeqCst);
        if live <= desired {
            return false;
        }
        if shared
            .live_workers
            .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

async fn run_entry<J: TrackedJob>(shared: &ExecutorShared<J>, entry: PendingEntry<J>) {
    match entry.work {
        Some(Work::Job(job)) => {
            let job_id = job.job_id();
            let task = job.clone();
            let outcome = tokio::spawn(async move { task.execute().await }).await;
            let panicked = outcome.as_ref().is_err_and(|err| err.is_panic());
            if panicked {
                warn!(job_id, "Job execution panicked");
            }
            let _ = shared.completions.send(Completion {
                original: Some(job),
                panicked,
            });
        }
        Some(Work::Detached(future)) => {
            let outcome = tokio::spawn(future).await;
            let panicked = outcome.as_ref().is_err_and(|err| err.is_panic());
            if panicked {
                warn!("Detached submission panicked");
            }
            let _ = shared.completions.send(Completion {
                original: None,
                panicked,
            });
        }
        // probes are never enqueued
        None => {}
    }
}
