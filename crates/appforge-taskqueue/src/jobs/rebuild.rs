// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rebuild runner: re-run the converter against an existing build.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collaborators::ConverterService;
use crate::error::JobError;
use crate::jobs::{JobContext, JobRunner};
use crate::state::{ConversionStatus, JobDetail};

/// Re-runs the converter pipeline for a build that already exists.
///
/// Rebuilds reuse the conversion stage ladder but touch no record
/// store: the converter refreshes the existing build in place, so
/// completion needs no bookkeeping beyond the final stamp.
pub struct RebuildRunner {
    converter: Arc<dyn ConverterService>,
    poll_interval: Duration,
}

impl RebuildRunner {
    /// Runner polling once per second.
    pub fn new(converter: Arc<dyn ConverterService>) -> Self {
        Self {
            converter,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Overrides the poll cadence.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn cancel(&self, ctx: &JobContext, ticket: u64) -> Result<(), JobError> {
        info!(job_id = ctx.job_id(), ticket, "Cancelling rebuild");
        ctx.update_state(|builder| {
            if let JobDetail::Rebuild(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Cancelling;
            }
        })
        .await?;
        match self.converter.cancel(ticket).await {
            Ok(()) => {
                ctx.update_state(|builder| {
                    if let JobDetail::Rebuild(detail) = &mut builder.detail {
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
                    if let JobDetail::Rebuild(detail) = &mut builder.detail {
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
impl JobRunner for RebuildRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let build_id = match &ctx.snapshot().await.detail {
            JobDetail::Rebuild(detail) => detail.build_id,
            other => return Err(JobError::Payload(other.kind())),
        };
        ctx.check_aborted()?;
        ctx.update_state(|builder| {
            if let JobDetail::Rebuild(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Queued;
            }
        })
        .await?;

        let ticket = self.converter.start_rebuild(build_id).await?;
        info!(job_id = ctx.job_id(), build_id, ticket, "Rebuild started");
        ctx.update_state(|builder| {
            if let JobDetail::Rebuild(detail) = &mut builder.detail {
                detail.status = ConversionStatus::Created;
            }
        })
        .await?;

        loop {
            tokio::select! {
                biased;
                _ = ctx.aborted() => return self.cancel(ctx, ticket).await,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            let report = self.converter.poll(ticket).await?;

            match report.status {
                ConversionStatus::Complete => {
                    info!(job_id = ctx.job_id(), build_id, "Rebuild complete");
                    ctx.update_state(|builder| {
                        builder.progress = 100;
                        if let JobDetail::Rebuild(detail) = &mut builder.detail {
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
                        .unwrap_or_else(|| "Rebuild failed".to_string());
                    warn!(job_id = ctx.job_id(), ticket, error = %message, "Rebuild failed");
                    ctx.update_state(move |builder| {
                        builder.progress = -1;
                        if let JobDetail::Rebuild(detail) = &mut builder.detail {
                            detail.status = ConversionStatus::Failed;
                            detail.last_error = report.last_error;
                        }
                    })
                    .await?;
                    return Err(JobError::Converter(message));
                }
                ConversionStatus::Cancelled => {
                    // cancelled outside this queue
                    ctx.update_state(|builder| {
                        if let JobDetail::Rebuild(detail) = &mut builder.detail {
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
                        if let JobDetail::Rebuild(detail) = &mut builder.detail {
                            detail.status = status;
                            if report.last_error.is_some() {
                                detail.last_error = report.last_error;
                            }
                        }
                    })
                    .await?;
                }
            }
        }
    }
}
