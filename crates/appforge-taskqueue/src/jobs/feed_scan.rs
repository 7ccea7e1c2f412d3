// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Feed scan runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::collaborators::RecordStore;
use crate::error::JobError;
use crate::jobs::{JobContext, JobRunner};
use crate::state::{FeedScanStatus, JobDetail};

/// Rescans one feed record through the record store.
pub struct FeedScanRunner {
    store: Arc<dyn RecordStore>,
}

impl FeedScanRunner {
    /// Runner scanning through the given store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobRunner for FeedScanRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        match &ctx.snapshot().await.detail {
            JobDetail::FeedScan(_) => {}
            other => return Err(JobError::Payload(other.kind())),
        }
        ctx.check_aborted()?;
        ctx.update_state(|builder| {
            builder.progress = 0;
            if let JobDetail::FeedScan(detail) = &mut builder.detail {
                detail.status = FeedScanStatus::Scanning;
            }
        })
        .await?;

        let found = self.store.refresh_record(ctx.record_id()).await?;
        info!(job_id = ctx.job_id(), record_id = ctx.record_id(), found, "Feed scan complete");

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
