// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capture-and-convert runner driving the converter backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collaborators::{ConverterService, ConverterStatus, RecordStore};
use crate::error::JobError;
use crate::jobs::{JobContext, JobRunner};
use crate::state::{ConversionStatus, JobDetail};

/// Polls without an observable change before the conversion counts as
/// stalled.
const STALL_POLLS: u32 = 60;

/// Runs a full capture-and-convert pipeline for one application.
///
/// Starts a converter ticket, polls it on a fixed cadence while mapping
/// the reported stage onto the job's sub-status and progress, and
/// records the resulting build once the converter reports completion.
/// An abort cancels the ticket.
pub struct ConversionRunner {
    converter: Arc<dyn ConverterService>,
    store: Arc<dyn RecordStore>,
    poll_interval: Duration,
}

impl ConversionRunner {
    /// Runner polling once per second.
    pub fn new(converter: Arc<dyn ConverterService>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            converter,
            store,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Overrides the poll cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn cancel(&self, ctx: &JobContext, ticket: u64) -> Result<(), JobError> {
        info!(job_id = ctx.job_id(), ticket, "Cancelling conversion");
        ctx.update_state(|builder| {
            if let JobDetail::Conversion(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Cancelling;
            }
        })
        .await?;
        match self.converter.cancel(ticket).await {
            Ok(()) => {
                ctx.update_state(|builder| {
                    if let JobDetail::Conversion(detail) = &mut builder.detail {
                        detail.status = ConversionStatus::Cancelled;
                    }
                })
                .await?;
                Err(JobError::Aborted)
            }
            Err(err) => {
                warn!(job_id = ctx.job_id(), ticket, %err, "Cancel failed");
                ctx.update_state(|builder| {
                    builder.progress = -1;
                    if let JobDetail::Conversion(detail) = &mut builder.detail {
                        detail.status = ConversionStatus::Failed;
                        detail.last_error = Some(format!("Cancel failed: {err}"));
                    }
                })
                .await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl JobRunner for ConversionRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let capture = match &ctx.snapshot().await.detail {
            JobDetail::Conversion(detail) => detail.capture.clone(),
            other => return Err(JobError::Payload(other.kind())),
        };
        ctx.check_aborted()?;
        ctx.update_state(|builder| {
            if let JobDetail::Conversion(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Queued;
            }
        })
        .await?;

        let ticket = self.converter.start_conversion(&capture).await?;
        info!(job_id = ctx.job_id(), ticket, "Conversion started");
        ctx.update_state(|builder| {
            if let JobDetail::Conversion(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Created;
                detail.ticket_id = Some(ticket);
            }
        })
        .await?;

        let mut unchanged_polls = 0u32;
        let mut last_seen: Option<ConverterStatus> = None;
        loop {
            tokio::select! {
                biased;
                _ = ctx.aborted() => return self.cancel(ctx, ticket).await,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let report = self.converter.poll(ticket).await?;
            let stalled = match &last_seen {
                Some(previous) if *previous == report => {
                    unchanged_polls += 1;
                    unchanged_polls >= STALL_POLLS
                }
                _ => {
                    unchanged_polls = 0;
                    false
                }
            };
            last_seen = Some(report.clone());

            match report.status {
                ConversionStatus::Complete => {
                    // the build record is still pending, hold at Finishing
                    let applied = report.clone();
                    ctx.update_state(move |builder| {
                        builder.progress = ConversionStatus::Finishing.percent();
                        if let JobDetail::Conversion(detail) = &mut builder.detail {
                            detail.status = ConversionStatus::Finishing;
                            detail.last_command = applied.last_command;
                            detail.last_running_status = applied.last_running_status;
                            detail.stalled = false;
                        }
                    })
                    .await?;
                    let build_id = self
                        .store
                        .record_build(capture.application_id, ticket)
                        .await?;
                    info!(
                        job_id = ctx.job_id(),
                        build_id, "Conversion complete, build recorded"
                    );
                    ctx.update_state(|builder| {
                        builder.progress = 100;
                        if let JobDetail::Conversion(detail) = &mut builder.detail {
                            detail.status = ConversionStatus::Complete;
                        }
                    })
                    .await?;
                    return Ok(());
                }
                ConversionStatus::Failed => {
                    let message = report
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "Conversion failed".to_string());
                    warn!(job_id = ctx.job_id(), ticket, error = %message, "Conversion failed");
                    ctx.update_state(move |builder| {
                        builder.progress = -1;
                        if let JobDetail::Conversion(detail) = &mut builder.detail {
                            detail.status = ConversionStatus::Failed;
                            detail.last_command = report.last_command;
                            detail.last_running_status = report.last_running_status;
                            detail.last_error = report.last_error;
                        }
                    })
                    .await?;
                    return Err(JobError::Converter(message));
                }
                ConversionStatus::Cancelled => {
                    // cancelled outside this queue
                    ctx.update_state(|builder| {
                        if let JobDetail::Conversion(detail) = &mut builder.detail {
                            detail.status = ConversionStatus::Cancelled;
                        }
                    })
                    .await?;
                    return Err(JobError::Aborted);
                }
                status => {
                    let progress = if (0..=100).contains(&report.progress) {
                        report.progress
                    } else {
                        status.percent()
                    };
                    ctx.update_state(move |builder| {
                        builder.progress = progress;
                        if let JobDetail::Conversion(detail) = &mut builder.detail {
                            detail.status = status;
                            detail.last_command = report.last_command;
                            detail.last_running_status = report.last_running_status;
                            if report.last_error.is_some() {
                                detail.last_error = report.last_error;
                            }
                            detail.stalled = stalled;
                        }
                    })
                    .await?;
                }
            }
        }
    }
}
