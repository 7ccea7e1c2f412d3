// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for appforge-taskqueue.

use thiserror::Error;

use crate::state::{JobKind, MetaStatus};

/// Snapshot builder validation errors.
///
/// Raised by [`JobSnapshotBuilder::build`](crate::state::JobSnapshotBuilder::build)
/// when a snapshot would violate the job state invariants. Invalid snapshots
/// are rejected, never silently repaired.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateError {
    /// The snapshot has no job id.
    #[error("Job id must be non-zero")]
    MissingId,

    /// The snapshot references no domain record.
    #[error("Record id must be non-zero")]
    MissingRecordId,

    /// The snapshot description is empty.
    #[error("Description must not be empty")]
    EmptyDescription,

    /// Progress is outside the [-1, 100] range.
    #[error("Progress {0} is outside [-1, 100]")]
    ProgressOutOfRange(i32),

    /// The timestamps do not fit the claimed meta status.
    #[error(
        "Timestamps queued={queued} started={started} finished={finished} are invalid for {status} status"
    )]
    InvalidTimestamps {
        /// Meta status the snapshot claims.
        status: MetaStatus,
        /// Queued timestamp in epoch millis, -1 when unset.
        queued: i64,
        /// Started timestamp in epoch millis, -1 when unset.
        started: i64,
        /// Finished timestamp in epoch millis, -1 when unset.
        finished: i64,
    },
}

/// Task queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// An active task of the same kind already exists for the record.
    #[error("A {kind} task for record {record_id} is already queued")]
    AlreadyQueued {
        /// Kind of the conflicting task.
        kind: JobKind,
        /// Domain record both tasks reference.
        record_id: u64,
    },

    /// No task with this id is recorded.
    #[error("No task found with id: {0}")]
    NotFound(u64),

    /// The task has not reached a terminal state yet.
    #[error("Task {0} is not finished")]
    NotFinished(u64),

    /// The queue is shutting down and no longer accepts work.
    #[error("The queue is shutting down")]
    ShuttingDown,

    /// Snapshot validation failed.
    #[error("Invalid job state: {0}")]
    State(#[from] StateError),
}

/// Errors produced by job runners.
///
/// Runner errors never escape the queue; the execution wrapper records them
/// on the job's terminal snapshot and logs them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// The converter service failed or rejected an operation.
    #[error("Converter error: {0}")]
    Converter(String),

    /// A guest operation failed.
    #[error("Guest error: {0}")]
    Guest(String),

    /// The record store failed.
    #[error("Record store error: {0}")]
    Store(String),

    /// A workpool operation failed.
    #[error("Workpool error: {0}")]
    Workpool(#[from] appforge_workpool::WorkpoolError),

    /// The job observed its abort flag and unwound.
    #[error("Job aborted")]
    Aborted,

    /// The job payload kind does not match the runner.
    #[error("Unexpected payload kind: {0}")]
    Payload(JobKind),

    /// Snapshot validation failed.
    #[error("Invalid job state: {0}")]
    State(#[from] StateError),
}

/// Configuration loading errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("{0} is required")]
    Missing(&'static str),

    /// An environment variable holds a value that does not parse.
    #[error("Invalid {key}: {value:?}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },
}

/// Result type using TaskError.
pub type Result<T> = std::result::Result<T, TaskError>;
