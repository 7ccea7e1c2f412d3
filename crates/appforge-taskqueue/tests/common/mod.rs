// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for appforge-taskqueue integration tests.
//!
//! Provides mock collaborators, controllable runners, and polling helpers.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use appforge_taskqueue::collaborators::{
    ConverterService, ConverterStatus, GuestOps, RecordStore, TaskEvent, TaskEventSink,
};
use appforge_taskqueue::error::JobError;
use appforge_taskqueue::jobs::{JobContext, JobRunner};
use appforge_taskqueue::queue::NewTask;
use appforge_taskqueue::state::{
    CaptureRequest, ConversionDetail, ConversionStatus, FeedScanDetail, FeedScanStatus,
    ImportDetail, JobDetail, JobSnapshot, ManualModeDetail, MetaStatus, RebuildDetail,
};
use appforge_taskqueue::TaskQueue;
use appforge_workpool::Lease;

/// Polls a condition every 5ms until it holds, for at most 5 seconds.
pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Waits until the task reaches the given meta status and returns its
/// snapshot.
pub async fn wait_for_status(queue: &TaskQueue, id: u64, status: MetaStatus) -> JobSnapshot {
    wait_for(|| async move {
        queue
            .find_task_by_id(id)
            .await
            .map(|snapshot| snapshot.meta_status == status)
            .unwrap_or(false)
    })
    .await;
    queue
        .find_task_by_id(id)
        .await
        .expect("task disappeared while waiting")
}

/// Event sink recording `(event, job id, meta status)` triples.
pub struct RecordingSink {
    events: StdMutex<Vec<(TaskEvent, u64, MetaStatus)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: StdMutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(TaskEvent, u64, MetaStatus)> {
        self.events.lock().unwrap().clone()
    }

    /// Events for one job, in publication order.
    pub fn events_for(&self, id: u64) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event_id, _)| *event_id == id)
            .map(|(event, _, _)| *event)
            .collect()
    }

    /// Ids of finished jobs, in completion order.
    pub fn finished_order(&self) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _, _)| *event == TaskEvent::Finished)
            .map(|(_, id, _)| *id)
            .collect()
    }
}

impl TaskEventSink for RecordingSink {
    fn publish(&self, event: TaskEvent, snapshot: &JobSnapshot) {
        self.events
            .lock()
            .unwrap()
            .push((event, snapshot.id, snapshot.meta_status));
    }
}

/// Feed-scan runner held open until the test releases it.
pub struct GatedRunner {
    outcome: watch::Sender<Option<bool>>,
}

impl GatedRunner {
    pub fn new() -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self { outcome })
    }

    /// Lets the job finish successfully.
    pub fn succeed(&self) {
        self.outcome.send_replace(Some(true));
    }

    /// Lets the job finish with a store error.
    pub fn fail(&self) {
        self.outcome.send_replace(Some(false));
    }
}

#[async_trait]
impl JobRunner for GatedRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.update_state(|builder| {
            builder.progress = 10;
            if let JobDetail::FeedScan(detail) = &mut builder.detail {
                detail.status = FeedScanStatus::Scanning;
            }
        })
        .await?;
        let mut rx = self.outcome.subscribe();
        let succeeded = tokio::select! {
            biased;
            _ = ctx.aborted() => return Err(JobError::Aborted),
            released = rx.wait_for(|outcome| outcome.is_some()) => match released {
                Ok(outcome) => (*outcome).unwrap_or(false),
                Err(_) => false,
            },
        };
        if !succeeded {
            return Err(JobError::Store("released with failure".to_string()));
        }
        ctx.update_state(|builder| {
            builder.progress = 100;
            if let JobDetail::FeedScan(detail) = &mut builder.detail {
                detail.status = FeedScanStatus::Complete;
            }
        })
        .await?;
        Ok(())
    }
}

/// Feed-scan runner completing as soon as it is picked up.
pub struct InstantRunner;

#[async_trait]
impl JobRunner for InstantRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.update_state(|builder| {
            builder.progress = 100;
            if let JobDetail::FeedScan(detail) = &mut builder.detail {
                detail.status = FeedScanStatus::Complete;
            }
        })
        .await
    }
}

/// Converter whose poll responses are scripted up front.
///
/// The last report repeats so pollers can spin on it.
pub struct ScriptedConverter {
    pub ticket: u64,
    pub conversions: StdMutex<Vec<CaptureRequest>>,
    pub rebuilds: StdMutex<Vec<u64>>,
    pub cancelled: StdMutex<Vec<u64>>,
    reports: StdMutex<VecDeque<ConverterStatus>>,
}

impl ScriptedConverter {
    pub fn new(ticket: u64, reports: Vec<ConverterStatus>) -> Arc<Self> {
        Arc::new(Self {
            ticket,
            conversions: StdMutex::new(Vec::new()),
            rebuilds: StdMutex::new(Vec::new()),
            cancelled: StdMutex::new(Vec::new()),
            reports: StdMutex::new(reports.into()),
        })
    }
}

#[async_trait]
impl ConverterService for ScriptedConverter {
    async fn start_conversion(&self, request: &CaptureRequest) -> Result<u64, JobError> {
        self.conversions.lock().unwrap().push(request.clone());
        Ok(self.ticket)
    }

    async fn start_rebuild(&self, build_id: u64) -> Result<u64, JobError> {
        self.rebuilds.lock().unwrap().push(build_id);
        Ok(self.ticket)
    }

    async fn poll(&self, _ticket_id: u64) -> Result<ConverterStatus, JobError> {
        let mut reports = self.reports.lock().unwrap();
        if reports.len() > 1 {
            Ok(reports.pop_front().expect("non-empty script"))
        } else {
            reports
                .front()
                .cloned()
                .ok_or_else(|| JobError::Converter("script exhausted".to_string()))
        }
    }

    async fn cancel(&self, ticket_id: u64) -> Result<(), JobError> {
        self.cancelled.lock().unwrap().push(ticket_id);
        Ok(())
    }
}

/// A scripted poll report with no diagnostics attached.
pub fn report(status: ConversionStatus) -> ConverterStatus {
    ConverterStatus {
        status,
        progress: -1,
        last_command: None,
        last_running_status: None,
        last_error: None,
    }
}

/// Record store that logs every call and can fail selected project
/// refreshes.
#[derive(Default)]
pub struct RecordingStore {
    pub found: u32,
    pub fail_refresh_projects: HashSet<u64>,
    pub builds: StdMutex<Vec<(u64, u64)>>,
    pub refreshed_records: StdMutex<Vec<u64>>,
    pub project_calls: StdMutex<Vec<String>>,
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn record_build(&self, application_id: u64, ticket_id: u64) -> Result<u64, JobError> {
        self.builds
            .lock()
            .unwrap()
            .push((application_id, ticket_id));
        Ok(4242)
    }

    async fn refresh_record(&self, record_id: u64) -> Result<u32, JobError> {
        self.refreshed_records.lock().unwrap().push(record_id);
        Ok(self.found)
    }

    async fn create_project(&self, project_id: u64) -> Result<(), JobError> {
        self.project_calls
            .lock()
            .unwrap()
            .push(format!("create:{project_id}"));
        Ok(())
    }

    async fn refresh_project(&self, project_id: u64) -> Result<(), JobError> {
        self.project_calls
            .lock()
            .unwrap()
            .push(format!("refresh:{project_id}"));
        if self.fail_refresh_projects.contains(&project_id) {
            return Err(JobError::Store(format!("refresh failed for {project_id}")));
        }
        Ok(())
    }

    async fn save_project(&self, project_id: u64) -> Result<(), JobError> {
        self.project_calls
            .lock()
            .unwrap()
            .push(format!("save:{project_id}"));
        Ok(())
    }
}

/// Guest that records commands and exits with a fixed code.
pub struct MockGuest {
    pub commands: StdMutex<Vec<String>>,
    pub exit_code: i32,
}

impl MockGuest {
    pub fn new(exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            commands: StdMutex::new(Vec::new()),
            exit_code,
        })
    }
}

#[async_trait]
impl GuestOps for MockGuest {
    async fn upload(&self, _lease: &Lease, _local: &str, _remote: &str) -> Result<(), JobError> {
        Ok(())
    }

    async fn download(&self, _lease: &Lease, _remote: &str, _local: &str) -> Result<(), JobError> {
        Ok(())
    }

    async fn run_in_guest(&self, _lease: &Lease, command: &str) -> Result<i32, JobError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.exit_code)
    }
}

pub fn capture(application_id: u64, datastore_id: u64, workpool_id: u64) -> CaptureRequest {
    CaptureRequest {
        application_id,
        datastore_id,
        workpool_id,
        recipe: None,
    }
}

pub fn feed_scan_task(record_id: u64, runner: Arc<dyn JobRunner>) -> NewTask {
    NewTask {
        record_id,
        description: format!("Scan feed {record_id}"),
        detail: JobDetail::FeedScan(FeedScanDetail::new()),
        runner,
    }
}

pub fn conversion_task(request: CaptureRequest, runner: Arc<dyn JobRunner>) -> NewTask {
    NewTask {
        record_id: request.application_id,
        description: format!("Convert application {}", request.application_id),
        detail: JobDetail::Conversion(ConversionDetail::new(request)),
        runner,
    }
}

pub fn manual_mode_task(request: CaptureRequest, runner: Arc<dyn JobRunner>) -> NewTask {
    NewTask {
        record_id: request.application_id,
        description: format!("Manual capture for application {}", request.application_id),
        detail: JobDetail::ManualMode(ManualModeDetail::new(request)),
        runner,
    }
}

pub fn import_task(record_id: u64, requested: Vec<u64>, runner: Arc<dyn JobRunner>) -> NewTask {
    NewTask {
        record_id,
        description: format!("Import {} projects", requested.len()),
        detail: JobDetail::Import(ImportDetail::new(requested)),
        runner,
    }
}

pub fn rebuild_task(record_id: u64, build_id: u64, runner: Arc<dyn JobRunner>) -> NewTask {
    NewTask {
        record_id,
        description: format!("Rebuild build {build_id}"),
        detail: JobDetail::Rebuild(RebuildDetail::new(build_id)),
        runner,
    }
}
