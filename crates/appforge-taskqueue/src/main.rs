// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AppForge Coordinator - Capture Job Scheduling Daemon
//!
//! Hosts the task queue and the capture VM pools:
//! - Job scheduling (captures, rebuilds, feed scans, imports)
//! - Workpool lifecycle (images, pools, leases)
//! - Background reconciliation of in-flight provisioning

use std::sync::Arc;

use tracing::{info, warn};

use appforge_taskqueue::CoordinatorConfig;
use appforge_taskqueue::TaskQueue;
use appforge_workpool::provisioner::MockProvisioner;
use appforge_workpool::tracker::TrackerConfig;
use appforge_workpool::{VmImageManager, WorkpoolManager, WorkpoolTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appforge_taskqueue=info,appforge_workpool=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = CoordinatorConfig::from_env()?;

    info!(
        queue = %config.queue_name,
        workers = config.workers,
        max_finished = config.max_finished.get(),
        vc_host = %config.vc.host,
        "Starting AppForge Coordinator"
    );

    // Build the workpool stack
    // TODO: replace the mock provisioner once the vSphere backend lands
    let provisioner = Arc::new(MockProvisioner::new());
    let images = Arc::new(VmImageManager::new(provisioner.clone()));
    let pools = Arc::new(WorkpoolManager::new(
        provisioner,
        images.clone(),
        config.vc.clone(),
    ));

    // Background reconciliation of in-flight provisioning
    let tracker = Arc::new(WorkpoolTracker::new(
        pools.clone(),
        images.clone(),
        TrackerConfig {
            poll_interval: config.reconcile_interval,
        },
    ));
    let tracker_shutdown = tracker.shutdown_handle();
    let tracker_task = tokio::spawn({
        let tracker = tracker.clone();
        async move { tracker.run().await }
    });

    // Start the task queue
    let queue = TaskQueue::new(config.workers, config.max_finished);

    info!(workers = queue.pool_size(), "Coordinator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown: queue first so jobs release their leases,
    // then the tracker
    queue.graceful_shutdown(true).await;
    tracker_shutdown.notify_one();
    tracker_task.await?;

    info!("AppForge Coordinator shut down");

    Ok(())
}
