// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workpool manager.
//!
//! Owns the set of workpools and their instances, and hands out leases to
//! running capture jobs. Lease acquisition never queues: when no instance
//! is free the caller gets a typed error immediately, and the pool grows
//! in the background when it still has headroom so that a later retry can
//! succeed. All provisioning failures are recorded on the pool and left
//! for the caller to act on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkpoolError};
use crate::image_manager::VmImageManager;
use crate::model::{
    DeleteMethod, GuestCredentials, Instance, InstanceState, Lease, PoolState, VcConfig, Workpool,
    WorkpoolKind,
};
use crate::provisioner::VmProvisioner;

/// Input for registering a pre-existing VM as a pool instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Managed object reference of the VM.
    pub moid: String,
    /// Guest account; the pool's account is used when `None`.
    pub guest: Option<GuestCredentials>,
    /// Datastore path of the .vmx file.
    pub vmx_path: String,
    /// Whether the guest logs in automatically.
    pub autologon: bool,
}

struct PoolEntry {
    pool: Workpool,
    /// Outstanding leases: lease id to instance id.
    leases: HashMap<Uuid, u64>,
}

/// Registry of workpools and the lease lifecycle around their instances.
pub struct WorkpoolManager {
    provisioner: Arc<dyn VmProvisioner>,
    images: Arc<VmImageManager>,
    vc: VcConfig,
    pools: Arc<RwLock<HashMap<u64, PoolEntry>>>,
    next_pool_id: AtomicU64,
    next_instance_id: AtomicU64,
}

impl WorkpoolManager {
    /// Create a new workpool manager.
    pub fn new(
        provisioner: Arc<dyn VmProvisioner>,
        images: Arc<VmImageManager>,
        vc: VcConfig,
    ) -> Self {
        Self {
            provisioner,
            images,
            vc,
            pools: Arc::new(RwLock::new(HashMap::new())),
            next_pool_id: AtomicU64::new(1),
            next_instance_id: AtomicU64::new(1),
        }
    }

    /// Register a new workpool and start its readiness check.
    ///
    /// Returns the new pool id immediately; the pool stays in `processing`
    /// until the check settles it.
    pub async fn create(
        &self,
        name: &str,
        guest: GuestCredentials,
        maximum: u32,
        kind: WorkpoolKind,
    ) -> Result<u64> {
        if maximum == 0 {
            return Err(WorkpoolError::InvalidMaximum { value: maximum });
        }

        let id = {
            let mut pools = self.pools.write().await;
            if pools.values().any(|e| e.pool.name == name) {
                return Err(WorkpoolError::NameInUse {
                    name: name.to_string(),
                });
            }
            let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
            pools.insert(
                id,
                PoolEntry {
                    pool: Workpool {
                        id,
                        name: name.to_string(),
                        maximum,
                        state: PoolState::Processing,
                        last_error: None,
                        guest,
                        kind,
                        instances: Vec::new(),
                    },
                    leases: HashMap::new(),
                },
            );
            id
        };

        info!(workpool_id = id, name = %name, "Registered workpool");
        self.spawn_ready_check(id);
        Ok(id)
    }

    /// Get a workpool by id.
    pub async fn get(&self, workpool_id: u64) -> Option<Workpool> {
        self.pools
            .read()
            .await
            .get(&workpool_id)
            .map(|e| e.pool.clone())
    }

    /// List all workpools, ordered by name.
    pub async fn list(&self) -> Vec<Workpool> {
        let mut all: Vec<Workpool> = self
            .pools
            .read()
            .await
            .values()
            .map(|e| e.pool.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Find a workpool by name.
    pub async fn find_by_name(&self, name: &str) -> Option<Workpool> {
        self.pools
            .read()
            .await
            .values()
            .find(|e| e.pool.name == name)
            .map(|e| e.pool.clone())
    }

    /// Change the maximum instance count of a pool.
    ///
    /// Shrinking never evicts existing instances; it only stops further
    /// growth.
    pub async fn update_maximum(&self, workpool_id: u64, maximum: u32) -> Result<()> {
        if maximum == 0 {
            return Err(WorkpoolError::InvalidMaximum { value: maximum });
        }
        let mut pools = self.pools.write().await;
        let entry = pools
            .get_mut(&workpool_id)
            .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
        entry.pool.maximum = maximum;
        Ok(())
    }

    /// Register a pre-existing VM as an instance of the pool.
    ///
    /// This is the only way custom pools gain instances.
    pub async fn add_instance(&self, workpool_id: u64, spec: InstanceSpec) -> Result<u64> {
        let mut pools = self.pools.write().await;
        let entry = pools
            .get_mut(&workpool_id)
            .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
        if entry.pool.instances.len() as u32 >= entry.pool.maximum {
            return Err(WorkpoolError::AtMaximum {
                workpool_id,
                maximum: entry.pool.maximum,
            });
        }

        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let guest = spec.guest.unwrap_or_else(|| entry.pool.guest.clone());
        entry.pool.instances.push(Instance {
            id,
            moid: Some(spec.moid),
            guest,
            vmx_path: spec.vmx_path,
            autologon: spec.autologon,
            state: InstanceState::Available,
        });
        info!(workpool_id, instance_id = id, "Registered instance");
        Ok(id)
    }

    /// Acquire a lease on a free instance.
    ///
    /// Fails immediately with `NoInstanceAvailable` when nothing is free.
    /// If the pool still has headroom, growth is kicked off in the
    /// background before the error is returned, so a retry after
    /// provisioning finishes will succeed.
    pub async fn acquire(&self, workpool_id: u64) -> Result<Lease> {
        let grow = {
            let mut pools = self.pools.write().await;
            let entry = pools
                .get_mut(&workpool_id)
                .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
            if entry.pool.state != PoolState::Available {
                return Err(WorkpoolError::NotReady {
                    id: workpool_id,
                    state: entry.pool.state.to_string(),
                });
            }

            let free = entry
                .pool
                .instances
                .iter_mut()
                .find(|i| i.state == InstanceState::Available);
            if let Some(instance) = free {
                instance.state = InstanceState::Leased;
                let lease = Lease {
                    id: Uuid::new_v4(),
                    workpool_id,
                    instance: instance.clone(),
                    vc: self.vc.clone(),
                    acquired_at: Utc::now(),
                };
                entry.leases.insert(lease.id, lease.instance.id);
                info!(
                    workpool_id,
                    instance_id = lease.instance.id,
                    lease_id = %lease.id,
                    "Lease acquired"
                );
                return Ok(lease);
            }

            let can_grow = entry.pool.kind.is_growable()
                && (entry.pool.instances.len() as u32) < entry.pool.maximum;
            if can_grow {
                Some(self.stage_instance(entry))
            } else {
                None
            }
        };

        if let Some((instance_id, name, kind)) = grow {
            info!(
                workpool_id,
                instance_id, "No free instance, growing pool in background"
            );
            self.spawn_grow(workpool_id, instance_id, name, kind);
        }
        Err(WorkpoolError::NoInstanceAvailable { workpool_id })
    }

    /// Provision one instance ahead of demand.
    ///
    /// Useful to warm a pool up before the first capture lands on it.
    /// Returns the id of the new instance, which starts `provisioning`.
    pub async fn provision_instance(&self, workpool_id: u64) -> Result<u64> {
        let (instance_id, name, kind) = {
            let mut pools = self.pools.write().await;
            let entry = pools
                .get_mut(&workpool_id)
                .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
            if !entry.pool.kind.is_growable() {
                return Err(WorkpoolError::NotGrowable { workpool_id });
            }
            if entry.pool.instances.len() as u32 >= entry.pool.maximum {
                return Err(WorkpoolError::AtMaximum {
                    workpool_id,
                    maximum: entry.pool.maximum,
                });
            }
            self.stage_instance(entry)
        };
        self.spawn_grow(workpool_id, instance_id, name, kind);
        Ok(instance_id)
    }

    /// Append a `provisioning` placeholder to the pool and hand back what
    /// the background growth task needs. Caller holds the write lock and
    /// has already checked growability and headroom.
    fn stage_instance(&self, entry: &mut PoolEntry) -> (u64, String, WorkpoolKind) {
        let instance_id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", entry.pool.name, instance_id);
        entry.pool.instances.push(Instance {
            id: instance_id,
            moid: None,
            guest: entry.pool.guest.clone(),
            vmx_path: String::new(),
            autologon: true,
            state: InstanceState::Provisioning,
        });
        (instance_id, name, entry.pool.kind.clone())
    }

    /// Return a leased instance to the pool.
    ///
    /// Unknown pools and unknown lease ids are ignored, so releasing twice
    /// is harmless and never corrupts the pool accounting.
    pub async fn release(&self, workpool_id: u64, lease_id: Uuid) {
        let mut pools = self.pools.write().await;
        let Some(entry) = pools.get_mut(&workpool_id) else {
            debug!(workpool_id, lease_id = %lease_id, "Release for unknown workpool ignored");
            return;
        };
        let Some(instance_id) = entry.leases.remove(&lease_id) else {
            debug!(workpool_id, lease_id = %lease_id, "Release of unknown lease ignored");
            return;
        };
        if let Some(instance) = entry.pool.instance_mut(instance_id) {
            if instance.state == InstanceState::Leased {
                instance.state = InstanceState::Available;
            }
        }
        info!(workpool_id, instance_id, lease_id = %lease_id, "Lease released");
    }

    /// Number of leases currently outstanding on a pool.
    pub async fn lease_count(&self, workpool_id: u64) -> Result<usize> {
        let pools = self.pools.read().await;
        let entry = pools
            .get(&workpool_id)
            .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
        Ok(entry.leases.len())
    }

    /// Delete a workpool, destroying its instances with the given method.
    ///
    /// Fails while any lease is outstanding. If the backend rejects some
    /// deletions the pool is kept as `unavailable` with the surviving
    /// instances marked failed, so the deletion can be retried.
    pub async fn delete(&self, workpool_id: u64, method: DeleteMethod) -> Result<()> {
        let instances = {
            let mut pools = self.pools.write().await;
            let entry = pools
                .get_mut(&workpool_id)
                .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
            if !entry.leases.is_empty() {
                return Err(WorkpoolError::LeasesOutstanding {
                    workpool_id,
                    count: entry.leases.len(),
                });
            }
            if entry.pool.state == PoolState::Processing {
                return Err(WorkpoolError::NotReady {
                    id: workpool_id,
                    state: entry.pool.state.to_string(),
                });
            }
            entry.pool.state = PoolState::Processing;
            entry.pool.instances.clone()
        };

        let mut survivors: Vec<u64> = Vec::new();
        let mut first_failure: Option<crate::provisioner::ProvisionError> = None;
        for instance in &instances {
            let Some(moid) = &instance.moid else { continue };
            if let Err(e) = self.provisioner.delete_vm(moid, method).await {
                warn!(
                    workpool_id,
                    instance_id = instance.id,
                    moid = %moid,
                    error = %e,
                    "Failed to delete pool instance"
                );
                survivors.push(instance.id);
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        let mut pools = self.pools.write().await;
        match first_failure {
            None => {
                pools.remove(&workpool_id);
                info!(workpool_id, method = %method, "Deleted workpool");
                Ok(())
            }
            Some(err) => {
                if let Some(entry) = pools.get_mut(&workpool_id) {
                    entry.pool.instances.retain(|i| survivors.contains(&i.id));
                    for instance in &mut entry.pool.instances {
                        instance.state = InstanceState::Failed;
                    }
                    entry.pool.state = PoolState::Unavailable;
                    entry.pool.last_error = Some(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Re-run the readiness check for a pool that settled as `unavailable`.
    pub async fn reset(&self, workpool_id: u64) -> Result<()> {
        {
            let mut pools = self.pools.write().await;
            let entry = pools
                .get_mut(&workpool_id)
                .ok_or(WorkpoolError::WorkpoolNotFound { workpool_id })?;
            if entry.pool.state != PoolState::Unavailable {
                return Err(WorkpoolError::NotReady {
                    id: workpool_id,
                    state: entry.pool.state.to_string(),
                });
            }
            entry.pool.state = PoolState::Processing;
            entry.pool.last_error = None;
        }
        info!(workpool_id, "Workpool reset");
        self.spawn_ready_check(workpool_id);
        Ok(())
    }

    /// Verify the pool's backing source and settle it.
    ///
    /// Linked pools need their base image to exist; full and custom pools
    /// have nothing to verify.
    fn spawn_ready_check(&self, workpool_id: u64) {
        let images = self.images.clone();
        let pools = self.pools.clone();

        tokio::spawn(async move {
            let kind = {
                let pools = pools.read().await;
                match pools.get(&workpool_id) {
                    Some(entry) => entry.pool.kind.clone(),
                    None => return,
                }
            };

            let failure = match &kind {
                WorkpoolKind::Linked { image_id } => match images.get(*image_id).await {
                    Some(_) => None,
                    None => Some(format!("No image found with id: {}", image_id)),
                },
                WorkpoolKind::Full { .. } | WorkpoolKind::Custom { .. } => None,
            };

            let mut pools = pools.write().await;
            let Some(entry) = pools.get_mut(&workpool_id) else {
                return;
            };
            match failure {
                None => {
                    entry.pool.state = PoolState::Available;
                    info!(workpool_id, kind = kind.as_str(), "Workpool ready");
                }
                Some(reason) => {
                    entry.pool.state = PoolState::Unavailable;
                    entry.pool.last_error = Some(reason.clone());
                    warn!(workpool_id, reason = %reason, "Workpool failed readiness check");
                }
            }
        });
    }

    /// Provision one new instance in the background.
    ///
    /// On failure the placeholder instance is removed and the failure is
    /// recorded as the pool's `last_error`.
    fn spawn_grow(&self, workpool_id: u64, instance_id: u64, name: String, kind: WorkpoolKind) {
        let provisioner = self.provisioner.clone();
        let images = self.images.clone();
        let pools = self.pools.clone();

        tokio::spawn(async move {
            let built = match &kind {
                WorkpoolKind::Linked { image_id } => match images.get(*image_id).await {
                    None => Err(format!("No image found with id: {}", image_id)),
                    Some(image) if image.state != PoolState::Available || image.moid.is_none() => {
                        Err(format!("Image '{}' is not available for cloning", image.name))
                    }
                    Some(image) => provisioner
                        .clone_from_image(&image, &name)
                        .await
                        .map_err(|e| e.to_string()),
                },
                WorkpoolKind::Full { pattern } => provisioner
                    .install_from_media(pattern, &name)
                    .await
                    .map_err(|e| e.to_string()),
                // Guarded by the caller; custom pools never reach here.
                WorkpoolKind::Custom { .. } => Err("Pool cannot grow".to_string()),
            };

            let mut pools = pools.write().await;
            let Some(entry) = pools.get_mut(&workpool_id) else {
                warn!(
                    workpool_id,
                    instance_id, "Workpool removed while growing, dropping new instance"
                );
                return;
            };

            match built {
                Ok(vm) => {
                    if let Some(instance) = entry.pool.instance_mut(instance_id) {
                        instance.moid = Some(vm.moid.clone());
                        instance.vmx_path = vm.vmx_path;
                        instance.state = InstanceState::Available;
                        info!(workpool_id, instance_id, moid = %vm.moid, "Instance provisioned");
                    }
                }
                Err(reason) => {
                    entry.pool.instances.retain(|i| i.id != instance_id);
                    entry.pool.last_error = Some(reason.clone());
                    warn!(workpool_id, instance_id, reason = %reason, "Instance provisioning failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CloneSupport, OsInfo, OsKind, OsRegistration, VmImageSource, VmPattern};
    use crate::provisioner::MockProvisioner;
    use std::time::Duration;

    fn vc() -> VcConfig {
        VcConfig {
            host: "vc.test".to_string(),
            username: "root".to_string(),
            password: "vmware".to_string(),
            datacenter: "dc1".to_string(),
            clone_support: CloneSupport::Linked,
        }
    }

    fn guest() -> GuestCredentials {
        GuestCredentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    fn pattern() -> VmPattern {
        VmPattern {
            source_iso: "[ds] iso/win7.iso".to_string(),
            network_name: "VM Network".to_string(),
            os: OsInfo {
                kind: OsKind::Win7,
                variant: "Professional".to_string(),
            },
            registration: OsRegistration {
                license_key: "XXXXX".to_string(),
                user_name: "bench".to_string(),
                organization: "appforge".to_string(),
                kms_server: String::new(),
            },
        }
    }

    struct Fixture {
        mock: Arc<MockProvisioner>,
        images: Arc<VmImageManager>,
        manager: WorkpoolManager,
    }

    async fn fixture() -> Fixture {
        let mock = Arc::new(MockProvisioner::new());
        let images = Arc::new(VmImageManager::new(mock.clone()));
        let manager = WorkpoolManager::new(mock.clone(), images.clone(), vc());
        Fixture {
            mock,
            images,
            manager,
        }
    }

    async fn settled_image(images: &VmImageManager, name: &str) -> u64 {
        let id = images
            .create(name, VmImageSource::Pattern(pattern()))
            .await
            .unwrap();
        wait_for(|| async move {
            images
                .get(id)
                .await
                .map(|i| i.state.is_settled())
                .unwrap_or(false)
        })
        .await;
        id
    }

    async fn settled_pool(manager: &WorkpoolManager, id: u64) -> Workpool {
        wait_for(|| async move {
            manager
                .get(id)
                .await
                .map(|p| p.state.is_settled())
                .unwrap_or(false)
        })
        .await;
        manager.get(id).await.unwrap()
    }

    async fn wait_for<F, Fut>(mut check: F)
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

    async fn linked_pool(f: &Fixture, name: &str, maximum: u32) -> u64 {
        let image_id = settled_image(&f.images, &format!("{}-image", name)).await;
        let id = f
            .manager
            .create(name, guest(), maximum, WorkpoolKind::Linked { image_id })
            .await
            .unwrap();
        let pool = settled_pool(&f.manager, id).await;
        assert_eq!(pool.state, PoolState::Available);
        id
    }

    #[tokio::test]
    async fn test_create_linked_pool_settles_available() {
        let f = fixture().await;
        let id = linked_pool(&f, "win7", 2).await;
        let pool = f.manager.get(id).await.unwrap();
        assert!(pool.instances.is_empty());
        assert!(pool.last_error.is_none());
    }

    #[tokio::test]
    async fn test_create_with_missing_image_settles_unavailable() {
        let f = fixture().await;
        let id = f
            .manager
            .create("orphan", guest(), 2, WorkpoolKind::Linked { image_id: 999 })
            .await
            .unwrap();
        let pool = settled_pool(&f.manager, id).await;
        assert_eq!(pool.state, PoolState::Unavailable);
        assert!(pool.last_error.unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_create_validations() {
        let f = fixture().await;
        let err = f
            .manager
            .create("p", guest(), 0, WorkpoolKind::Linked { image_id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MAXIMUM");

        linked_pool(&f, "dup", 1).await;
        let err = f
            .manager
            .create("dup", guest(), 1, WorkpoolKind::Linked { image_id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NAME_IN_USE");
    }

    #[tokio::test]
    async fn test_acquire_grows_then_succeeds_on_retry() {
        let f = fixture().await;
        let id = linked_pool(&f, "growing", 2).await;

        // First acquire finds nothing free; growth starts in the background.
        let err = f.manager.acquire(id).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_INSTANCE_AVAILABLE");

        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;

        let lease = f.manager.acquire(id).await.unwrap();
        assert_eq!(lease.workpool_id, id);
        assert!(lease.instance.moid.is_some());
        assert_eq!(lease.vc.host, "vc.test");

        let pool = f.manager.get(id).await.unwrap();
        assert_eq!(pool.instance(lease.instance.id).unwrap().state, InstanceState::Leased);
        assert_eq!(f.manager.lease_count(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_acquire_at_maximum_fails_fast_without_growth() {
        let f = fixture().await;
        let id = linked_pool(&f, "capped", 1).await;

        // Grow to the single allowed instance and lease it.
        let _ = f.manager.acquire(id).await.unwrap_err();
        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;
        let _lease = f.manager.acquire(id).await.unwrap();

        // Zero free, maximum reached: immediate typed error, no new instance.
        let err = f.manager.acquire(id).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_INSTANCE_AVAILABLE");
        assert_eq!(f.manager.get(id).await.unwrap().instances.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_on_custom_pool_never_grows() {
        let f = fixture().await;
        let id = f
            .manager
            .create(
                "manual",
                guest(),
                2,
                WorkpoolKind::Custom {
                    os: OsInfo {
                        kind: OsKind::WinXpPro,
                        variant: String::new(),
                    },
                },
            )
            .await
            .unwrap();
        settled_pool(&f.manager, id).await;

        let err = f.manager.acquire(id).await.unwrap_err();
        assert_eq!(err.error_code(), "NO_INSTANCE_AVAILABLE");
        assert!(f.manager.get(id).await.unwrap().instances.is_empty());
    }

    #[tokio::test]
    async fn test_provision_instance_warms_pool() {
        let f = fixture().await;
        let id = linked_pool(&f, "warm", 1).await;

        let instance_id = f.manager.provision_instance(id).await.unwrap();
        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;
        let lease = f.manager.acquire(id).await.unwrap();
        assert_eq!(lease.instance.id, instance_id);

        let err = f.manager.provision_instance(id).await.unwrap_err();
        assert_eq!(err.error_code(), "AT_MAXIMUM");

        let custom = f
            .manager
            .create(
                "warm-manual",
                guest(),
                1,
                WorkpoolKind::Custom {
                    os: OsInfo {
                        kind: OsKind::Win8,
                        variant: String::new(),
                    },
                },
            )
            .await
            .unwrap();
        settled_pool(&f.manager, custom).await;
        let err = f.manager.provision_instance(custom).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_GROWABLE");
    }

    #[tokio::test]
    async fn test_add_instance_and_acquire() {
        let f = fixture().await;
        let id = f
            .manager
            .create(
                "manual",
                guest(),
                1,
                WorkpoolKind::Custom {
                    os: OsInfo {
                        kind: OsKind::Win7,
                        variant: "Ultimate".to_string(),
                    },
                },
            )
            .await
            .unwrap();
        settled_pool(&f.manager, id).await;

        f.manager
            .add_instance(
                id,
                InstanceSpec {
                    moid: "vm-handmade".to_string(),
                    guest: None,
                    vmx_path: "[ds] manual/vm.vmx".to_string(),
                    autologon: false,
                },
            )
            .await
            .unwrap();

        let lease = f.manager.acquire(id).await.unwrap();
        assert_eq!(lease.instance.moid.as_deref(), Some("vm-handmade"));
        assert_eq!(lease.instance.guest, guest());

        let err = f
            .manager
            .add_instance(
                id,
                InstanceSpec {
                    moid: "vm-extra".to_string(),
                    guest: None,
                    vmx_path: "[ds] manual/extra.vmx".to_string(),
                    autologon: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "AT_MAXIMUM");
    }

    #[tokio::test]
    async fn test_release_twice_is_noop() {
        let f = fixture().await;
        let id = linked_pool(&f, "releasing", 1).await;
        let _ = f.manager.acquire(id).await.unwrap_err();
        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;
        let lease = f.manager.acquire(id).await.unwrap();

        f.manager.release(id, lease.id).await;
        assert_eq!(f.manager.lease_count(id).await.unwrap(), 0);
        assert_eq!(f.manager.get(id).await.unwrap().available_instances(), 1);

        // Second release of the same lease changes nothing.
        f.manager.release(id, lease.id).await;
        assert_eq!(f.manager.lease_count(id).await.unwrap(), 0);
        assert_eq!(f.manager.get(id).await.unwrap().available_instances(), 1);

        // Unknown pool is also ignored.
        f.manager.release(4242, lease.id).await;
    }

    #[tokio::test]
    async fn test_grow_failure_records_last_error() {
        let f = fixture().await;
        let id = linked_pool(&f, "flaky", 2).await;

        f.mock.fail_clone.store(true, Ordering::Relaxed);
        let _ = f.manager.acquire(id).await.unwrap_err();

        let manager = &f.manager;
        wait_for(|| async move {
            let pool = manager.get(id).await.unwrap();
            pool.last_error.is_some() && pool.instances.is_empty()
        })
        .await;

        let pool = f.manager.get(id).await.unwrap();
        assert!(pool.last_error.unwrap().contains("datastore full"));
        // The pool itself stays usable; a later retry can grow again.
        assert_eq!(pool.state, PoolState::Available);
    }

    #[tokio::test]
    async fn test_delete_rejected_while_leased() {
        let f = fixture().await;
        let id = linked_pool(&f, "held", 1).await;
        let _ = f.manager.acquire(id).await.unwrap_err();
        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;
        let lease = f.manager.acquire(id).await.unwrap();

        let err = f
            .manager
            .delete(id, DeleteMethod::DeleteFromDisk)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "LEASES_OUTSTANDING");

        f.manager.release(id, lease.id).await;
        f.manager.delete(id, DeleteMethod::DeleteFromDisk).await.unwrap();
        assert!(f.manager.get(id).await.is_none());
        assert_eq!(f.mock.deleted().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_pool_for_retry() {
        let f = fixture().await;
        let id = linked_pool(&f, "stuck", 1).await;
        let _ = f.manager.acquire(id).await.unwrap_err();
        let manager = &f.manager;
        wait_for(|| async move { manager.get(id).await.unwrap().available_instances() == 1 }).await;

        f.mock.fail_delete.store(true, Ordering::Relaxed);
        let err = f
            .manager
            .delete(id, DeleteMethod::DeleteFromDisk)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PROVISION_FAILED");

        let pool = f.manager.get(id).await.unwrap();
        assert_eq!(pool.state, PoolState::Unavailable);
        assert!(pool.last_error.unwrap().contains("vm is locked"));
        assert_eq!(pool.instances[0].state, InstanceState::Failed);

        f.mock.fail_delete.store(false, Ordering::Relaxed);
        f.manager.delete(id, DeleteMethod::DeleteFromDisk).await.unwrap();
        assert!(f.manager.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_update_maximum() {
        let f = fixture().await;
        let id = linked_pool(&f, "resize", 1).await;

        f.manager.update_maximum(id, 3).await.unwrap();
        assert_eq!(f.manager.get(id).await.unwrap().maximum, 3);

        let err = f.manager.update_maximum(id, 0).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_MAXIMUM");
    }

    #[tokio::test]
    async fn test_reset_after_failed_readiness() {
        let f = fixture().await;
        // The first image the fixture creates always gets id 1, so a pool
        // linked to it before it exists fails readiness, and a reset after
        // the image shows up succeeds.
        let id = f
            .manager
            .create("latework", guest(), 1, WorkpoolKind::Linked { image_id: 1 })
            .await
            .unwrap();
        let pool = settled_pool(&f.manager, id).await;
        assert_eq!(pool.state, PoolState::Unavailable);

        let err = f.manager.reset(999).await.unwrap_err();
        assert_eq!(err.error_code(), "WORKPOOL_NOT_FOUND");

        let image_id = settled_image(&f.images, "late-image").await;
        assert_eq!(image_id, 1);

        f.manager.reset(id).await.unwrap();
        let pool = settled_pool(&f.manager, id).await;
        assert_eq!(pool.state, PoolState::Available);
        assert!(pool.last_error.is_none());

        // Reset only applies to unavailable pools.
        let err = f.manager.reset(id).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_READY");
    }
}
