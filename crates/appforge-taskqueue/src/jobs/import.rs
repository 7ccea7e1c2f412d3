// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bulk project import runner.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collaborators::RecordStore;
use crate::error::JobError;
use crate::jobs::{JobContext, JobRunner};
use crate::state::{ImportStatus, JobDetail};

/// Progress milestone after the create phase.
const CREATE_DONE: i32 = 5;
/// Progress milestone after the refresh phase.
const REFRESH_DONE: i32 = 80;

/// Imports a batch of projects in three phases: create, refresh, save.
///
/// A project failing one phase is dropped from the later phases and
/// collected into `failed_ids`; the import completes as long as at
/// least one project made it through.
pub struct ImportRunner {
    store: Arc<dyn RecordStore>,
}

impl ImportRunner {
    /// Runner importing through the given store.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn checkpoint(&self, ctx: &JobContext) -> Result<(), JobError> {
        if !ctx.is_aborted() {
            return Ok(());
        }
        ctx.update_state(|builder| {
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.status = ImportStatus::Cancelling;
            }
        })
        .await?;
        Err(JobError::Aborted)
    }

    async fn record_failure(&self, ctx: &JobContext, id: u64, err: &JobError) -> Result<(), JobError> {
        warn!(job_id = ctx.job_id(), project_id = id, %err, "Project import step failed");
        let message = err.to_string();
        ctx.update_state(move |builder| {
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.failed_ids.push(id);
                detail.last_error = Some(message);
            }
        })
        .await
    }
}

#[async_trait]
impl JobRunner for ImportRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let requested = match &ctx.snapshot().await.detail {
            JobDetail::Import(detail) => detail.requested_ids.clone(),
            other => return Err(JobError::Payload(other.kind())),
        };
        self.checkpoint(ctx).await?;

        if requested.is_empty() {
            // nothing requested, vacuously complete
            ctx.update_state(|builder| {
                builder.progress = 100;
                if let JobDetail::Import(detail) = &mut builder.detail {
                    detail.status = ImportStatus::Complete;
                }
            })
            .await?;
            return Ok(());
        }
        info!(job_id = ctx.job_id(), requested = requested.len(), "Project import started");

        let mut failed: HashSet<u64> = HashSet::new();

        ctx.update_state(|builder| {
            builder.progress = 0;
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.status = ImportStatus::CreatingProjects;
            }
        })
        .await?;
        for &id in &requested {
            self.checkpoint(ctx).await?;
            if let Err(err) = self.store.create_project(id).await {
                self.record_failure(ctx, id, &err).await?;
                failed.insert(id);
            }
        }
        ctx.update_progress(CREATE_DONE).await?;

        let to_refresh: Vec<u64> = requested
            .iter()
            .copied()
            .filter(|id| !failed.contains(id))
            .collect();
        ctx.update_state(|builder| {
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.status = ImportStatus::RefreshingProjects;
            }
        })
        .await?;
        let refresh_total = to_refresh.len() as i32;
        for (index, &id) in to_refresh.iter().enumerate() {
            self.checkpoint(ctx).await?;
            match self.store.refresh_project(id).await {
                Ok(()) => {
                    let progress =
                        CREATE_DONE + (index as i32 + 1) * (REFRESH_DONE - CREATE_DONE) / refresh_total;
                    ctx.update_state(move |builder| {
                        builder.progress = progress;
                        if let JobDetail::Import(detail) = &mut builder.detail {
                            detail.found += 1;
                        }
                    })
                    .await?;
                }
                Err(err) => {
                    self.record_failure(ctx, id, &err).await?;
                    failed.insert(id);
                }
            }
        }
        ctx.update_progress(REFRESH_DONE).await?;

        let to_save: Vec<u64> = requested
            .iter()
            .copied()
            .filter(|id| !failed.contains(id))
            .collect();
        ctx.update_state(|builder| {
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.status = ImportStatus::SavingProjects;
            }
        })
        .await?;
        let save_total = to_save.len() as i32;
        for (index, &id) in to_save.iter().enumerate() {
            self.checkpoint(ctx).await?;
            match self.store.save_project(id).await {
                Ok(()) => {
                    let progress =
                        REFRESH_DONE + (index as i32 + 1) * (100 - REFRESH_DONE) / save_total;
                    ctx.update_state(move |builder| {
                        builder.progress = progress;
                        if let JobDetail::Import(detail) = &mut builder.detail {
                            detail.imported_ids.push(id);
                            detail.imported += 1;
                        }
                    })
                    .await?;
                }
                Err(err) => {
                    self.record_failure(ctx, id, &err).await?;
                    failed.insert(id);
                }
            }
        }

        let snapshot = ctx.snapshot().await;
        let (imported, last_error) = match &snapshot.detail {
            JobDetail::Import(detail) => (detail.imported_ids.len(), detail.last_error.clone()),
            other => return Err(JobError::Payload(other.kind())),
        };
        if imported == 0 {
            ctx.update_state(|builder| {
                builder.progress = -1;
                if let JobDetail::Import(detail) = &mut builder.detail {
                    detail.status = ImportStatus::Failed;
                }
            })
            .await?;
            return Err(JobError::Store(
                last_error.unwrap_or_else(|| "No projects imported".to_string()),
            ));
        }
        info!(
            job_id = ctx.job_id(),
            imported,
            failed = failed.len(),
            "Project import finished"
        );
        ctx.update_state(|builder| {
            builder.progress = 100;
            if let JobDetail::Import(detail) = &mut builder.detail {
                detail.status = ImportStatus::Complete;
            }
        })
        .await?;
        Ok(())
    }
}
