// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-kind job payloads and their sub-status ladders.

use serde::{Deserialize, Serialize};

/// Job kind tag, derived from the detail payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Application capture and conversion.
    #[serde(rename = "CONVERSION")]
    Conversion,
    /// Feed scan for new records.
    #[serde(rename = "FEED_SCAN")]
    FeedScan,
    /// Interactive capture on a leased VM.
    #[serde(rename = "MANUAL_MODE_BUILD")]
    ManualMode,
    /// Re-drive of an existing build.
    #[serde(rename = "REBUILD")]
    Rebuild,
    /// Bulk project import.
    #[serde(rename = "IMPORT_PROJECTS")]
    Import,
}

impl JobKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Conversion => "CONVERSION",
            JobKind::FeedScan => "FEED_SCAN",
            JobKind::ManualMode => "MANUAL_MODE_BUILD",
            JobKind::Rebuild => "REBUILD",
            JobKind::Import => "IMPORT_PROJECTS",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain fields a capture job references. Opaque to the queue itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Application record under capture.
    pub application_id: u64,
    /// Datastore the capture output lands in.
    pub datastore_id: u64,
    /// Workpool that provides the capture VM.
    pub workpool_id: u64,
    /// Optional capture recipe name.
    pub recipe: Option<String>,
}

/// Conversion pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ConversionStatus {
    NewTask,
    Queued,
    Created,
    Downloading,
    Provisioning,
    PreCapture,
    PreInstall,
    Install,
    PostInstall,
    PostCapture,
    Generate,
    PreBuild,
    Build,
    Refresh,
    Finishing,
    Complete,
    Failed,
    Cancelling,
    Cancelled,
}

impl ConversionStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConversionStatus::Complete | ConversionStatus::Failed | ConversionStatus::Cancelled
        )
    }

    /// Progress percent a job in this stage reports, -1 before work starts
    /// and for the failure states.
    pub fn percent(&self) -> i32 {
        match self {
            ConversionStatus::NewTask | ConversionStatus::Queued | ConversionStatus::Created => -1,
            ConversionStatus::Downloading => 5,
            ConversionStatus::Provisioning => 10,
            ConversionStatus::PreCapture => 15,
            ConversionStatus::PreInstall => 20,
            ConversionStatus::Install => 35,
            ConversionStatus::PostInstall => 50,
            ConversionStatus::PostCapture => 60,
            ConversionStatus::Generate => 70,
            ConversionStatus::PreBuild => 75,
            ConversionStatus::Build => 80,
            ConversionStatus::Refresh => 90,
            ConversionStatus::Finishing => 95,
            ConversionStatus::Complete => 100,
            ConversionStatus::Failed
            | ConversionStatus::Cancelling
            | ConversionStatus::Cancelled => -1,
        }
    }
}

/// Feed scan stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum FeedScanStatus {
    Waiting,
    Scanning,
    Complete,
    Failed,
    Cancelled,
}

impl FeedScanStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedScanStatus::Complete | FeedScanStatus::Failed | FeedScanStatus::Cancelled
        )
    }
}

/// Manual-mode build stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ManualModeStatus {
    Created,
    Starting,
    AcquiringVm,
    WaitingForUser,
    Building,
    Complete,
    Failed,
    Cancelled,
}

impl ManualModeStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ManualModeStatus::Complete | ManualModeStatus::Failed | ManualModeStatus::Cancelled
        )
    }
}

/// Project import stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ImportStatus {
    New,
    CreatingProjects,
    RefreshingProjects,
    SavingProjects,
    Complete,
    Failed,
    Cancelling,
    Cancelled,
}

impl ImportStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Complete | ImportStatus::Failed | ImportStatus::Cancelled
        )
    }
}

/// Conversion job payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionDetail {
    /// Current pipeline stage.
    pub status: ConversionStatus,
    /// Capture request driving the conversion.
    pub capture: CaptureRequest,
    /// Converter ticket, once the conversion was started.
    pub ticket_id: Option<u64>,
    /// Last running status string reported by the converter.
    pub last_running_status: Option<String>,
    /// Last command the converter reported executing.
    pub last_command: Option<String>,
    /// Last error message, if any.
    pub last_error: Option<String>,
    /// Whether the converter stopped reporting progress.
    pub stalled: bool,
}

impl ConversionDetail {
    /// New conversion payload for a capture request.
    pub fn new(capture: CaptureRequest) -> Self {
        Self {
            status: ConversionStatus::NewTask,
            capture,
            ticket_id: None,
            last_running_status: None,
            last_command: None,
            last_error: None,
            stalled: false,
        }
    }
}

/// Feed scan payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedScanDetail {
    /// Current scan stage.
    pub status: FeedScanStatus,
}

impl FeedScanDetail {
    /// New feed scan payload.
    pub fn new() -> Self {
        Self {
            status: FeedScanStatus::Waiting,
        }
    }
}

impl Default for FeedScanDetail {
    fn default() -> Self {
        Self::new()
    }
}

/// Manual-mode build payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualModeDetail {
    /// Current build stage.
    pub status: ManualModeStatus,
    /// Capture request driving the interactive session.
    pub capture: CaptureRequest,
}

impl ManualModeDetail {
    /// New manual-mode payload for a capture request.
    pub fn new(capture: CaptureRequest) -> Self {
        Self {
            status: ManualModeStatus::Created,
            capture,
        }
    }
}

/// Rebuild payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildDetail {
    /// Current pipeline stage.
    pub status: ConversionStatus,
    /// Existing build being re-driven.
    pub build_id: u64,
    /// Last error message, if any.
    pub last_error: Option<String>,
}

impl RebuildDetail {
    /// New rebuild payload for an existing build.
    pub fn new(build_id: u64) -> Self {
        Self {
            status: ConversionStatus::NewTask,
            build_id,
            last_error: None,
        }
    }
}

/// Project import payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportDetail {
    /// Current import stage.
    pub status: ImportStatus,
    /// Projects requested for import.
    pub requested_ids: Vec<u64>,
    /// Projects imported successfully so far.
    pub imported_ids: Vec<u64>,
    /// Projects that failed a phase.
    pub failed_ids: Vec<u64>,
    /// Records found during the refresh phase.
    pub found: u32,
    /// Records imported during the save phase.
    pub imported: u32,
    /// Last error message, if any.
    pub last_error: Option<String>,
}

impl ImportDetail {
    /// New import payload for the requested project ids.
    pub fn new(requested_ids: Vec<u64>) -> Self {
        Self {
            status: ImportStatus::New,
            requested_ids,
            imported_ids: Vec::new(),
            failed_ids: Vec::new(),
            found: 0,
            imported: 0,
            last_error: None,
        }
    }
}

/// Kind-specific job payload, tagged with the kind on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobDetail {
    /// Application capture and conversion.
    #[serde(rename = "CONVERSION")]
    Conversion(ConversionDetail),
    /// Feed scan for new records.
    #[serde(rename = "FEED_SCAN")]
    FeedScan(FeedScanDetail),
    /// Interactive capture on a leased VM.
    #[serde(rename = "MANUAL_MODE_BUILD")]
    ManualMode(ManualModeDetail),
    /// Re-drive of an existing build.
    #[serde(rename = "REBUILD")]
    Rebuild(RebuildDetail),
    /// Bulk project import.
    #[serde(rename = "IMPORT_PROJECTS")]
    Import(ImportDetail),
}

/// How a job run ended, used to settle a non-terminal detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FinishVerdict {
    Success,
    Cancelled,
    Failed(Option<String>),
}

impl JobDetail {
    /// Kind tag of the payload.
    pub fn kind(&self) -> JobKind {
        match self {
            JobDetail::Conversion(_) => JobKind::Conversion,
            JobDetail::FeedScan(_) => JobKind::FeedScan,
            JobDetail::ManualMode(_) => JobKind::ManualMode,
            JobDetail::Rebuild(_) => JobKind::Rebuild,
            JobDetail::Import(_) => JobKind::Import,
        }
    }

    /// Whether the sub-status is terminal.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobDetail::Conversion(d) => d.status.is_terminal(),
            JobDetail::FeedScan(d) => d.status.is_terminal(),
            JobDetail::ManualMode(d) => d.status.is_terminal(),
            JobDetail::Rebuild(d) => d.status.is_terminal(),
            JobDetail::Import(d) => d.status.is_terminal(),
        }
    }

    /// Last error recorded on the payload, for kinds that carry one.
    pub fn last_error(&self) -> Option<&str> {
        match self {
            JobDetail::Conversion(d) => d.last_error.as_deref(),
            JobDetail::Rebuild(d) => d.last_error.as_deref(),
            JobDetail::Import(d) => d.last_error.as_deref(),
            JobDetail::FeedScan(_) | JobDetail::ManualMode(_) => None,
        }
    }

    /// Settles the payload into a terminal sub-status matching the verdict.
    ///
    /// A payload the runner already settled is left untouched, so a runner
    /// that reports a specific failure stage wins over the generic mapping.
    pub(crate) fn finalize(&mut self, verdict: FinishVerdict) {
        if self.is_terminal() {
            return;
        }
        match self {
            JobDetail::Conversion(d) => {
                d.status = match &verdict {
                    FinishVerdict::Success => ConversionStatus::Complete,
                    FinishVerdict::Cancelled => ConversionStatus::Cancelled,
                    FinishVerdict::Failed(_) => ConversionStatus::Failed,
                };
                if let FinishVerdict::Failed(message) = verdict {
                    if d.last_error.is_none() {
                        d.last_error = message;
                    }
                }
            }
            JobDetail::FeedScan(d) => {
                d.status = match verdict {
                    FinishVerdict::Success => FeedScanStatus::Complete,
                    FinishVerdict::Cancelled => FeedScanStatus::Cancelled,
                    FinishVerdict::Failed(_) => FeedScanStatus::Failed,
                };
            }
            JobDetail::ManualMode(d) => {
                d.status = match verdict {
                    FinishVerdict::Success => ManualModeStatus::Complete,
                    FinishVerdict::Cancelled => ManualModeStatus::Cancelled,
                    FinishVerdict::Failed(_) => ManualModeStatus::Failed,
                };
            }
            JobDetail::Rebuild(d) => {
                d.status = match &verdict {
                    FinishVerdict::Success => ConversionStatus::Complete,
                    FinishVerdict::Cancelled => ConversionStatus::Cancelled,
                    FinishVerdict::Failed(_) => ConversionStatus::Failed,
                };
                if let FinishVerdict::Failed(message) = verdict {
                    if d.last_error.is_none() {
                        d.last_error = message;
                    }
                }
            }
            JobDetail::Import(d) => {
                d.status = match &verdict {
                    FinishVerdict::Success => ImportStatus::Complete,
                    FinishVerdict::Cancelled => ImportStatus::Cancelled,
                    FinishVerdict::Failed(_) => ImportStatus::Failed,
                };
                if let FinishVerdict::Failed(message) = verdict {
                    if d.last_error.is_none() {
                        d.last_error = message;
                    }
                }
            }
        }
    }
}
