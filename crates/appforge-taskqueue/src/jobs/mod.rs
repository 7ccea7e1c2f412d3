// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runners and the context the queue hands them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};

use crate::collaborators::{TaskEvent, TaskEventSink};
use crate::error::JobError;
use crate::state::{JobSnapshot, JobSnapshotBuilder};

pub mod conversion;
pub mod feed_scan;
pub mod import;
pub mod manual_mode;
pub mod rebuild;

pub use conversion::ConversionRunner;
pub use feed_scan::FeedScanRunner;
pub use import::ImportRunner;
pub use manual_mode::{ManualModeGate, ManualModeRunner};
pub use rebuild::RebuildRunner;

/// The work behind a queued task.
///
/// A runner reports progress and sub-status through the context and
/// checks the abort flag at phase boundaries. Whatever it returns, the
/// queue settles the job into a terminal snapshot afterwards; a runner
/// that already set a terminal sub-status wins over the generic mapping.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Executes the job.
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Live view of one job, handed to its runner.
///
/// State updates go through the validating builder and emit an
/// `Updated` event only when the snapshot actually changed.
pub struct JobContext {
    job_id: u64,
    record_id: u64,
    snapshot: Arc<RwLock<JobSnapshot>>,
    abort: watch::Sender<bool>,
    sink: Arc<dyn TaskEventSink>,
}

impl JobContext {
    pub(crate) fn new(
        job_id: u64,
        record_id: u64,
        snapshot: Arc<RwLock<JobSnapshot>>,
        abort: watch::Sender<bool>,
        sink: Arc<dyn TaskEventSink>,
    ) -> Self {
        Self {
            job_id,
            record_id,
            snapshot,
            abort,
            sink,
        }
    }

    /// Queue-assigned id of the job.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Domain record the job operates on.
    pub fn record_id(&self) -> u64 {
        self.record_id
    }

    /// Clone of the current snapshot.
    pub async fn snapshot(&self) -> JobSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Applies a mutation through the validating builder.
    ///
    /// An invalid result is rejected and the current snapshot stays in
    /// place. Emits `Updated` when the snapshot changed.
    pub async fn update_state(
        &self,
        mutate: impl FnOnce(&mut JobSnapshotBuilder),
    ) -> Result<(), JobError> {
        let updated = {
            let mut current = self.snapshot.write().await;
            let mut builder = current.to_builder();
            mutate(&mut builder);
            let next = builder.build()?;
            if next == *current {
                None
            } else {
                *current = next.clone();
                Some(next)
            }
        };
        if let Some(snapshot) = updated {
            self.sink.publish(TaskEvent::Updated, &snapshot);
        }
        Ok(())
    }

    /// Sets the progress percent.
    pub async fn update_progress(&self, progress: i32) -> Result<(), JobError> {
        self.update_state(|builder| builder.progress = progress).await
    }

    /// Advances progress by `delta`, capped at 100.
    ///
    /// Indeterminate progress (-1) counts as 0 for the increment.
    pub async fn increment_progress(&self, delta: i32) -> Result<(), JobError> {
        self.update_state(|builder| {
            let base = builder.progress.max(0);
            builder.progress = (base + delta).min(100);
        })
        .await
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once an abort is requested.
    pub async fn aborted(&self) {
        let mut rx = self.abort.subscribe();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            // the context holds the sender, so the channel cannot close
            // while this future is alive
            std::future::pending::<()>().await;
        }
    }

    /// Errors with [`JobError::Aborted`] when an abort was requested.
    pub fn check_aborted(&self) -> Result<(), JobError> {
        if self.is_aborted() {
            Err(JobError::Aborted)
        } else {
            Ok(())
        }
    }
}
