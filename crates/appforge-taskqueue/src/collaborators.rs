// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator seams the job runners depend on.
//!
//! Every external system sits behind an async trait injected as
//! `Arc<dyn ...>`, so runners stay testable with mocks and the queue
//! never links against a concrete backend.

use async_trait::async_trait;
use tracing::debug;

use appforge_workpool::Lease;

use crate::error::JobError;
use crate::state::{CaptureRequest, ConversionStatus, JobSnapshot};

/// One poll result from the conversion backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterStatus {
    /// Pipeline stage the converter reports.
    pub status: ConversionStatus,
    /// Converter-reported percent, -1 when it reports none.
    pub progress: i32,
    /// Command the converter is currently executing, if any.
    pub last_command: Option<String>,
    /// Free-form running status line, if any.
    pub last_running_status: Option<String>,
    /// Error message, set when `status` is a failure state.
    pub last_error: Option<String>,
}

/// Conversion backend driving capture and build pipelines.
#[async_trait]
pub trait ConverterService: Send + Sync {
    /// Starts a conversion for a capture request and returns its ticket.
    async fn start_conversion(&self, request: &CaptureRequest) -> Result<u64, JobError>;

    /// Re-drives an existing build and returns the ticket.
    async fn start_rebuild(&self, build_id: u64) -> Result<u64, JobError>;

    /// Polls the pipeline state for a ticket.
    async fn poll(&self, ticket_id: u64) -> Result<ConverterStatus, JobError>;

    /// Cancels the pipeline behind a ticket.
    async fn cancel(&self, ticket_id: u64) -> Result<(), JobError>;
}

/// Operations against the guest OS of a leased VM.
#[async_trait]
pub trait GuestOps: Send + Sync {
    /// Copies a local file into the guest.
    async fn upload(&self, lease: &Lease, local: &str, remote: &str) -> Result<(), JobError>;

    /// Copies a guest file to the local filesystem.
    async fn download(&self, lease: &Lease, remote: &str, local: &str) -> Result<(), JobError>;

    /// Runs a command in the guest and returns its exit code.
    async fn run_in_guest(&self, lease: &Lease, command: &str) -> Result<i32, JobError>;
}

/// Opaque persistence layer, keyed by numeric record ids.
///
/// Calls are at-least-once; the store is expected to tolerate replays.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records a finished build for an application, returns the build id.
    async fn record_build(&self, application_id: u64, ticket_id: u64) -> Result<u64, JobError>;

    /// Rescans a feed record, returns how many records were found.
    async fn refresh_record(&self, record_id: u64) -> Result<u32, JobError>;

    /// Creates an imported project shell.
    async fn create_project(&self, project_id: u64) -> Result<(), JobError>;

    /// Refreshes an imported project's metadata.
    async fn refresh_project(&self, project_id: u64) -> Result<(), JobError>;

    /// Persists an imported project.
    async fn save_project(&self, project_id: u64) -> Result<(), JobError>;
}

/// Lifecycle notifications emitted by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// A task was accepted and queued.
    Created,
    /// A task's snapshot changed.
    Updated,
    /// A task reached its terminal snapshot.
    Finished,
    /// A finished task was dropped from the queue.
    Removed,
}

impl TaskEvent {
    /// Wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEvent::Created => "CREATED",
            TaskEvent::Updated => "UPDATED",
            TaskEvent::Finished => "FINISHED",
            TaskEvent::Removed => "REMOVED",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receives queue lifecycle events.
///
/// `publish` is called after the queue released its locks, with the
/// snapshot the event refers to. Implementations must not block.
pub trait TaskEventSink: Send + Sync {
    /// Delivers one event.
    fn publish(&self, event: TaskEvent, snapshot: &JobSnapshot);
}

/// Default sink, logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl TaskEventSink for LogEventSink {
    fn publish(&self, event: TaskEvent, snapshot: &JobSnapshot) {
        debug!(
            job_id = snapshot.id,
            kind = %snapshot.kind(),
            meta_status = %snapshot.meta_status,
            event = %event,
            "Task event"
        );
    }
}
