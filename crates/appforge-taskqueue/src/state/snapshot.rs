// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Immutable job snapshots and the validating builder that produces them.

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::state::detail::{JobDetail, JobKind};

/// Sentinel for a timestamp that was never stamped.
pub const UNSET_TIMESTAMP: i64 = -1;

/// Coarse lifecycle status shared by every job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaStatus {
    /// Built but not yet queued.
    Init,
    /// Queued, no worker picked it up yet.
    Waiting,
    /// A worker is executing the job.
    Running,
    /// Terminal. The snapshot will never change again.
    Finished,
}

impl MetaStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaStatus::Init => "INIT",
            MetaStatus::Waiting => "WAITING",
            MetaStatus::Running => "RUNNING",
            MetaStatus::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for MetaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a job.
///
/// Snapshots are immutable values; the queue replaces a job's current
/// snapshot wholesale through [`JobSnapshotBuilder`], which revalidates
/// every invariant on each transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct JobSnapshot {
    /// Queue-assigned job id, non-zero.
    pub id: u64,
    /// Domain record the job operates on, non-zero.
    pub record_id: u64,
    /// Human-readable description.
    pub description: String,
    /// Coarse lifecycle status.
    pub meta_status: MetaStatus,
    /// Epoch millis the job was queued, -1 when unset.
    pub queued: i64,
    /// Epoch millis a worker picked the job up, -1 when unset.
    pub started: i64,
    /// Epoch millis the job reached a terminal state, -1 when unset.
    pub finished: i64,
    /// Progress percent in [-1, 100], -1 meaning indeterminate.
    pub progress: i32,
    /// Whether an abort was requested for this job.
    pub aborted: bool,
    /// Kind-specific payload.
    pub detail: JobDetail,
}

impl JobSnapshot {
    /// Kind tag of the job.
    pub fn kind(&self) -> JobKind {
        self.detail.kind()
    }

    /// Builder pre-loaded with this snapshot's fields.
    ///
    /// Building it unchanged reproduces the snapshot exactly.
    pub fn to_builder(&self) -> JobSnapshotBuilder {
        JobSnapshotBuilder {
            id: self.id,
            record_id: self.record_id,
            description: self.description.clone(),
            meta_status: self.meta_status,
            queued: self.queued,
            started: self.started,
            finished: self.finished,
            progress: self.progress,
            aborted: self.aborted,
            detail: self.detail.clone(),
        }
    }
}

/// Mutable staging area for the next snapshot of a job.
///
/// Fields are set directly; [`build`](Self::build) validates the whole
/// snapshot and rejects anything inconsistent instead of repairing it.
#[derive(Debug, Clone)]
pub struct JobSnapshotBuilder {
    /// Queue-assigned job id.
    pub id: u64,
    /// Domain record the job operates on.
    pub record_id: u64,
    /// Human-readable description.
    pub description: String,
    /// Coarse lifecycle status.
    pub meta_status: MetaStatus,
    /// Epoch millis the job was queued, -1 when unset.
    pub queued: i64,
    /// Epoch millis a worker picked the job up, -1 when unset.
    pub started: i64,
    /// Epoch millis the job reached a terminal state, -1 when unset.
    pub finished: i64,
    /// Progress percent in [-1, 100].
    pub progress: i32,
    /// Whether an abort was requested.
    pub aborted: bool,
    /// Kind-specific payload.
    pub detail: JobDetail,
}

impl JobSnapshotBuilder {
    /// Fresh `Init` builder with unset timestamps and indeterminate progress.
    pub fn new(id: u64, record_id: u64, description: impl Into<String>, detail: JobDetail) -> Self {
        Self {
            id,
            record_id,
            description: description.into(),
            meta_status: MetaStatus::Init,
            queued: UNSET_TIMESTAMP,
            started: UNSET_TIMESTAMP,
            finished: UNSET_TIMESTAMP,
            progress: -1,
            aborted: false,
            detail,
        }
    }

    /// Validates every field and produces the snapshot.
    pub fn build(self) -> Result<JobSnapshot, StateError> {
        if self.id == 0 {
            return Err(StateError::MissingId);
        }
        if self.record_id == 0 {
            return Err(StateError::MissingRecordId);
        }
        if self.description.is_empty() {
            return Err(StateError::EmptyDescription);
        }
        if !(-1..=100).contains(&self.progress) {
            return Err(StateError::ProgressOutOfRange(self.progress));
        }
        let timestamps_ok = match self.meta_status {
            MetaStatus::Init => {
                self.queued == UNSET_TIMESTAMP
                    && self.started == UNSET_TIMESTAMP
                    && self.finished == UNSET_TIMESTAMP
            }
            MetaStatus::Waiting => {
                self.queued > 0
                    && self.started == UNSET_TIMESTAMP
                    && self.finished == UNSET_TIMESTAMP
            }
            // an aborted job may finish without ever starting
            MetaStatus::Running => {
                self.queued > 0
                    && (self.started > 0 || self.aborted)
                    && self.finished == UNSET_TIMESTAMP
            }
            MetaStatus::Finished => {
                self.queued > 0 && (self.started > 0 || self.aborted) && self.finished > 0
            }
        };
        if !timestamps_ok {
            return Err(StateError::InvalidTimestamps {
                status: self.meta_status,
                queued: self.queued,
                started: self.started,
                finished: self.finished,
            });
        }
        Ok(JobSnapshot {
            id: self.id,
            record_id: self.record_id,
            description: self.description,
            meta_status: self.meta_status,
            queued: self.queued,
            started: self.started,
            finished: self.finished,
            progress: self.progress,
            aborted: self.aborted,
            detail: self.detail,
        })
    }
}
