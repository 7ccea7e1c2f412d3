// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that reconciles pool and image state.
//!
//! Provisioning runs in spawned tasks, so pools and images can sit in
//! `processing` for minutes at a time. This worker periodically takes a
//! snapshot of everything that is unavailable or still processing and
//! publishes it on a watch channel for the UI and the task queue to
//! observe. It only scans while armed: any code that kicks off
//! provisioning calls [`WorkpoolTracker::mark_processing`], and the
//! worker disarms itself once nothing is left in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use crate::image_manager::VmImageManager;
use crate::manager::WorkpoolManager;
use crate::model::PoolState;

/// Configuration for the tracker worker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How often to scan pools and images while armed.
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// One reconciliation snapshot.
#[derive(Debug, Clone)]
pub struct FailCounts {
    /// Workpools currently settled as unavailable.
    pub workpool_failures: u32,
    /// Images currently settled as unavailable.
    pub image_failures: u32,
    /// Whether any pool or image is still processing.
    pub still_processing: bool,
    /// When this snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

impl Default for FailCounts {
    fn default() -> Self {
        Self {
            workpool_failures: 0,
            image_failures: 0,
            still_processing: false,
            checked_at: Utc::now(),
        }
    }
}

/// Background worker publishing pool and image health.
pub struct WorkpoolTracker {
    pools: Arc<WorkpoolManager>,
    images: Arc<VmImageManager>,
    config: TrackerConfig,
    shutdown: Arc<Notify>,
    armed: AtomicBool,
    tx: watch::Sender<FailCounts>,
}

impl WorkpoolTracker {
    /// Create a new tracker over the given managers.
    pub fn new(
        pools: Arc<WorkpoolManager>,
        images: Arc<VmImageManager>,
        config: TrackerConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(FailCounts::default());
        Self {
            pools,
            images,
            config,
            shutdown: Arc::new(Notify::new()),
            armed: AtomicBool::new(false),
            tx,
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Arm the scanner because provisioning work has started.
    pub fn mark_processing(&self) {
        self.armed.store(true, Ordering::Relaxed);
    }

    /// Subscribe to reconciliation snapshots.
    pub fn subscribe(&self) -> watch::Receiver<FailCounts> {
        self.tx.subscribe()
    }

    /// The most recently published snapshot.
    pub fn latest(&self) -> FailCounts {
        self.tx.borrow().clone()
    }

    /// Run the tracker loop.
    ///
    /// Scans at the configured interval while armed and exits when the
    /// shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Workpool tracker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Workpool tracker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if self.armed.load(Ordering::Relaxed) {
                        self.scan().await;
                    } else {
                        debug!("Tracker disarmed, skipping scan");
                    }
                }
            }
        }

        info!("Workpool tracker stopped");
    }

    /// Take one snapshot, publish it, and disarm once nothing is in flight.
    async fn scan(&self) -> FailCounts {
        let pools = self.pools.list().await;
        let images = self.images.list().await;

        let workpool_failures = pools
            .iter()
            .filter(|p| p.state == PoolState::Unavailable)
            .count() as u32;
        let image_failures = images
            .iter()
            .filter(|i| i.state == PoolState::Unavailable)
            .count() as u32;
        let still_processing = pools.iter().any(|p| p.state == PoolState::Processing)
            || images.iter().any(|i| i.state == PoolState::Processing);

        let counts = FailCounts {
            workpool_failures,
            image_failures,
            still_processing,
            checked_at: Utc::now(),
        };

        if workpool_failures > 0 || image_failures > 0 {
            info!(
                workpool_failures,
                image_failures, still_processing, "Reconciliation found failures"
            );
        } else {
            debug!(still_processing, "Reconciliation cycle completed");
        }

        self.tx.send_replace(counts.clone());

        if !still_processing {
            self.armed.store(false, Ordering::Relaxed);
            debug!("All provisioning settled, tracker disarmed");
        }

        counts
    }
}
