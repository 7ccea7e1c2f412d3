// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interactive capture runner: lease a VM, wait for the user, build.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use appforge_workpool::{Lease, WorkpoolManager};

use crate::collaborators::GuestOps;
use crate::error::JobError;
use crate::jobs::{JobContext, JobRunner};
use crate::state::{CaptureRequest, JobDetail, ManualModeStatus};

/// Command run in the guest when the capture request names no recipe.
const DEFAULT_BUILD_COMMAND: &str = r"C:\appforge\bin\build.cmd";

/// Caller-controlled signal that the interactive session is done.
///
/// The runner parks in `WaitingForUser` until the gate fires or the job
/// is aborted. One gate belongs to one task.
pub struct ManualModeGate {
    done: watch::Sender<bool>,
}

impl ManualModeGate {
    /// Unfired gate.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self { done }
    }

    /// Marks the session finished, releasing the runner.
    pub fn finish(&self) {
        self.done.send_replace(true);
    }

    /// Whether the session was marked finished.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    async fn finished(&self) {
        let mut rx = self.done.subscribe();
        if rx.wait_for(|done| *done).await.is_err() {
            // the gate holds the sender, so the channel cannot close
            // while this future is alive
            std::future::pending::<()>().await;
        }
    }
}

impl Default for ManualModeGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one interactive capture session on a leased pool VM.
///
/// The lease is handed back on every exit path, including abort and
/// build failure.
pub struct ManualModeRunner {
    workpools: Arc<WorkpoolManager>,
    guest: Arc<dyn GuestOps>,
    gate: Arc<ManualModeGate>,
}

impl ManualModeRunner {
    /// Runner leasing from `workpools` and building through `guest`.
    pub fn new(
        workpools: Arc<WorkpoolManager>,
        guest: Arc<dyn GuestOps>,
        gate: Arc<ManualModeGate>,
    ) -> Self {
        Self {
            workpools,
            guest,
            gate,
        }
    }

    async fn attended(
        &self,
        ctx: &JobContext,
        lease: &Lease,
        capture: &CaptureRequest,
    ) -> Result<(), JobError> {
        ctx.update_state(|builder| {
            builder.progress = 25;
            if let JobDetail::ManualMode(detail) = &mut builder.detail {
                detail.status = ManualModeStatus::WaitingForUser;
            }
        })
        .await?;
        info!(job_id = ctx.job_id(), "Waiting for the user to finish the session");
        tokio::select! {
            biased;
            _ = ctx.aborted() => return Err(JobError::Aborted),
            _ = self.gate.finished() => {}
        }
        ctx.check_aborted()?;

        ctx.update_state(|builder| {
            builder.progress = 60;
            if let JobDetail::ManualMode(detail) = &mut builder.detail {
                detail.status = ManualModeStatus::Building;
            }
        })
        .await?;
        let command = capture.recipe.as_deref().unwrap_or(DEFAULT_BUILD_COMMAND);
        let exit = self.guest.run_in_guest(lease, command).await?;
        if exit != 0 {
            return Err(JobError::Guest(format!(
                "Build command exited with status {exit}"
            )));
        }

        ctx.update_state(|builder| {
            builder.progress = 100;
            if let JobDetail::ManualMode(detail) = &mut builder.detail {
                detail.status = ManualModeStatus::Complete;
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRunner for ManualModeRunner {
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        let capture = match &ctx.snapshot().await.detail {
            JobDetail::ManualMode(detail) => detail.capture.clone(),
            other => return Err(JobError::Payload(other.kind())),
        };
        ctx.check_aborted()?;
        ctx.update_state(|builder| {
            builder.progress = 0;
            if let JobDetail::ManualMode(detail) = &mut builder.detail {
                detail.status = ManualModeStatus::Starting;
            }
        })
        .await?;

        ctx.update_state(|builder| {
            builder.progress = 5;
            if let JobDetail::ManualMode(detail) = &mut builder.detail {
                detail.status = ManualModeStatus::AcquiringVm;
            }
        })
        .await?;
        let lease = self.workpools.acquire(capture.workpool_id).await?;
        info!(
            job_id = ctx.job_id(),
            lease_id = %lease.id,
            instance_id = lease.instance.id,
            "Capture VM acquired"
        );

        let outcome = self.attended(ctx, &lease, &capture).await;
        // the lease goes back on every path
        self.workpools.release(capture.workpool_id, lease.id).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::sync::RwLock;

    use super::*;
    use appforge_workpool::model::{
        CloneSupport, GuestCredentials, OsInfo, OsKind, PoolState, VcConfig, WorkpoolKind,
    };
    use appforge_workpool::provisioner::MockProvisioner;
    use appforge_workpool::{InstanceSpec, VmImageManager};

    use crate::collaborators::LogEventSink;
    use crate::state::{
        JobSnapshot, JobSnapshotBuilder, ManualModeDetail, MetaStatus,
    };

    struct MockGuest {
        commands: StdMutex<Vec<String>>,
        exit_code: i32,
    }

    impl MockGuest {
        fn new(exit_code: i32) -> Arc<Self> {
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

        async fn download(
            &self,
            _lease: &Lease,
            _remote: &str,
            _local: &str,
        ) -> Result<(), JobError> {
            Ok(())
        }

        async fn run_in_guest(&self, _lease: &Lease, command: &str) -> Result<i32, JobError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.exit_code)
        }
    }

    fn vc() -> VcConfig {
        VcConfig {
            host: "vc.example.test".to_string(),
            username: "administrator".to_string(),
            password: "secret".to_string(),
            datacenter: "dc-1".to_string(),
            clone_support: CloneSupport::Linked,
        }
    }

    fn guest_credentials() -> GuestCredentials {
        GuestCredentials {
            username: "capture".to_string(),
            password: "capture".to_string(),
        }
    }

    fn pools() -> Arc<WorkpoolManager> {
        let provisioner = Arc::new(MockProvisioner::new());
        let images = Arc::new(VmImageManager::new(provisioner.clone()));
        Arc::new(WorkpoolManager::new(provisioner, images, vc()))
    }

    async fn ready_custom_pool(pools: &WorkpoolManager, with_instance: bool) -> u64 {
        let pool_id = pools
            .create(
                "manual-pool",
                guest_credentials(),
                2,
                WorkpoolKind::Custom {
                    os: OsInfo {
                        kind: OsKind::Win7,
                        variant: "Professional".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(pool) = pools.get(pool_id).await {
                    if pool.state == PoolState::Available {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool never became available");
        if with_instance {
            pools
                .add_instance(
                    pool_id,
                    InstanceSpec {
                        moid: "vm-100".to_string(),
                        guest: None,
                        vmx_path: "[datastore1] manual/manual.vmx".to_string(),
                        autologon: true,
                    },
                )
                .await
                .unwrap();
        }
        pool_id
    }

    fn capture(workpool_id: u64, recipe: Option<&str>) -> CaptureRequest {
        CaptureRequest {
            application_id: 11,
            datastore_id: 3,
            workpool_id,
            recipe: recipe.map(str::to_string),
        }
    }

    fn manual_ctx(capture: CaptureRequest) -> (Arc<JobContext>, watch::Sender<bool>) {
        let mut builder = JobSnapshotBuilder::new(
            1,
            11,
            "Manual capture for app 11",
            JobDetail::ManualMode(ManualModeDetail::new(capture)),
        );
        builder.meta_status = MetaStatus::Waiting;
        builder.queued = 1_700_000_000_000;
        let (abort, _) = watch::channel(false);
        let ctx = JobContext::new(
            1,
            11,
            Arc::new(RwLock::new(builder.build().unwrap())),
            abort.clone(),
            Arc::new(LogEventSink),
        );
        (Arc::new(ctx), abort)
    }

    fn manual_status(snapshot: &JobSnapshot) -> ManualModeStatus {
        match &snapshot.detail {
            JobDetail::ManualMode(detail) => detail.status,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gate_release_builds_and_completes() {
        let pools = pools();
        let pool_id = ready_custom_pool(&pools, true).await;
        let guest = MockGuest::new(0);
        let gate = Arc::new(ManualModeGate::new());
        let runner = Arc::new(ManualModeRunner::new(pools.clone(), guest.clone(), gate.clone()));
        let (ctx, _abort) = manual_ctx(capture(pool_id, Some(r"C:\recipes\firefox.cmd")));

        let run = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            manual_status(&ctx.snapshot().await),
            ManualModeStatus::WaitingForUser
        );
        assert!(!gate.is_finished());
        gate.finish();

        run.await.expect("runner task should not panic").unwrap();
        let snapshot = ctx.snapshot().await;
        assert_eq!(manual_status(&snapshot), ManualModeStatus::Complete);
        assert_eq!(snapshot.progress, 100);
        // the recipe overrides the default build command
        assert_eq!(
            *guest.commands.lock().unwrap(),
            vec![r"C:\recipes\firefox.cmd".to_string()]
        );
        assert_eq!(pools.lease_count(pool_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abort_while_waiting_releases_the_lease() {
        let pools = pools();
        let pool_id = ready_custom_pool(&pools, true).await;
        let guest = MockGuest::new(0);
        let gate = Arc::new(ManualModeGate::new());
        let runner = Arc::new(ManualModeRunner::new(pools.clone(), guest.clone(), gate));
        let (ctx, abort) = manual_ctx(capture(pool_id, None));

        let run = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.run(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pools.lease_count(pool_id).await.unwrap(), 1);
        abort.send_replace(true);

        let outcome = run.await.expect("runner task should not panic");
        assert!(matches!(outcome, Err(JobError::Aborted)));
        assert!(guest.commands.lock().unwrap().is_empty());
        assert_eq!(pools.lease_count(pool_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_build_releases_the_lease() {
        let pools = pools();
        let pool_id = ready_custom_pool(&pools, true).await;
        let guest = MockGuest::new(13);
        let gate = Arc::new(ManualModeGate::new());
        gate.finish();
        let runner = ManualModeRunner::new(pools.clone(), guest.clone(), gate);
        let (ctx, _abort) = manual_ctx(capture(pool_id, None));

        let err = runner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Guest(_)));
        // the default command ran and failed
        assert_eq!(
            *guest.commands.lock().unwrap(),
            vec![DEFAULT_BUILD_COMMAND.to_string()]
        );
        assert_eq!(pools.lease_count(pool_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_instance_fails_fast() {
        let pools = pools();
        let pool_id = ready_custom_pool(&pools, false).await;
        let guest = MockGuest::new(0);
        let gate = Arc::new(ManualModeGate::new());
        let runner = ManualModeRunner::new(pools.clone(), guest, gate);
        let (ctx, _abort) = manual_ctx(capture(pool_id, None));

        let err = runner.run(&ctx).await.unwrap_err();
        assert!(matches!(err, JobError::Workpool(_)));
        assert_eq!(
            manual_status(&ctx.snapshot().await),
            ManualModeStatus::AcquiringVm
        );
    }
}
