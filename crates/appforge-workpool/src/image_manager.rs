// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Base image registry.
//!
//! Manages the VM templates that linked workpools clone their instances
//! from. Creation runs asynchronously: the record is inserted in
//! `processing` state and settles into `available` or `unavailable` once
//! the backend finishes. Failures are recorded on the image and never
//! retried here; `reset` lets an operator re-run a failed build.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkpoolError};
use crate::model::{DeleteMethod, PoolState, VmImage, VmImageSource};
use crate::provisioner::VmProvisioner;

/// Registry of base images and the provisioning driver behind them.
pub struct VmImageManager {
    provisioner: Arc<dyn VmProvisioner>,
    images: Arc<RwLock<HashMap<u64, VmImage>>>,
    next_id: AtomicU64,
}

impl VmImageManager {
    /// Create a new image manager on top of a provisioning backend.
    pub fn new(provisioner: Arc<dyn VmProvisioner>) -> Self {
        Self {
            provisioner,
            images: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new base image and start building it.
    ///
    /// Returns the new image id immediately; the image stays in
    /// `processing` until the backend settles it.
    pub async fn create(&self, name: &str, source: VmImageSource) -> Result<u64> {
        let id = {
            let mut images = self.images.write().await;
            if images.values().any(|i| i.name == name) {
                return Err(WorkpoolError::NameInUse {
                    name: name.to_string(),
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            images.insert(
                id,
                VmImage {
                    id,
                    name: name.to_string(),
                    state: PoolState::Processing,
                    last_error: None,
                    moid: None,
                    source,
                },
            );
            id
        };

        info!(image_id = id, name = %name, "Registered image, provisioning started");
        self.spawn_provision(id);
        Ok(id)
    }

    /// Get an image by id.
    pub async fn get(&self, image_id: u64) -> Option<VmImage> {
        self.images.read().await.get(&image_id).cloned()
    }

    /// List all images, ordered by name.
    pub async fn list(&self) -> Vec<VmImage> {
        let mut all: Vec<VmImage> = self.images.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Find an image by name.
    pub async fn find_by_name(&self, name: &str) -> Option<VmImage> {
        self.images
            .read()
            .await
            .values()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Delete an image, removing its backing VM with the given method.
    ///
    /// Fails while the image is still processing. A backend failure leaves
    /// the record in place as `unavailable` so the deletion can be retried.
    pub async fn delete(&self, image_id: u64, method: DeleteMethod) -> Result<()> {
        let moid = {
            let mut images = self.images.write().await;
            let image = images
                .get_mut(&image_id)
                .ok_or(WorkpoolError::ImageNotFound { image_id })?;
            if image.state == PoolState::Processing {
                return Err(WorkpoolError::NotReady {
                    id: image_id,
                    state: image.state.to_string(),
                });
            }
            image.state = PoolState::Processing;
            image.moid.clone()
        };

        if let Some(moid) = moid {
            if let Err(e) = self.provisioner.delete_vm(&moid, method).await {
                warn!(image_id, moid = %moid, error = %e, "Failed to delete image VM");
                let mut images = self.images.write().await;
                if let Some(image) = images.get_mut(&image_id) {
                    image.state = PoolState::Unavailable;
                    image.last_error = Some(e.to_string());
                }
                return Err(e.into());
            }
        }

        self.images.write().await.remove(&image_id);
        info!(image_id, method = %method, "Deleted image");
        Ok(())
    }

    /// Re-run provisioning for an image that settled as `unavailable`.
    pub async fn reset(&self, image_id: u64) -> Result<()> {
        {
            let mut images = self.images.write().await;
            let image = images
                .get_mut(&image_id)
                .ok_or(WorkpoolError::ImageNotFound { image_id })?;
            if image.state != PoolState::Unavailable {
                return Err(WorkpoolError::NotReady {
                    id: image_id,
                    state: image.state.to_string(),
                });
            }
            image.state = PoolState::Processing;
            image.last_error = None;
            image.moid = None;
        }
        info!(image_id, "Image reset, provisioning restarted");
        self.spawn_provision(image_id);
        Ok(())
    }

    /// Build or adopt the backing VM, then settle the record.
    fn spawn_provision(&self, image_id: u64) {
        let provisioner = self.provisioner.clone();
        let images = self.images.clone();

        tokio::spawn(async move {
            let (name, source) = {
                let images = images.read().await;
                match images.get(&image_id) {
                    Some(image) => (image.name.clone(), image.source.clone()),
                    None => return,
                }
            };

            let built = match &source {
                VmImageSource::Pattern(pattern) => {
                    match provisioner.install_from_media(pattern, &name).await {
                        Ok(vm) => provisioner.snapshot_base(&vm.moid).await.map(|_| vm),
                        Err(e) => Err(e),
                    }
                }
                VmImageSource::ExistingVm { moid } => {
                    match provisioner.register_existing(moid).await {
                        Ok(vm) => provisioner.snapshot_base(&vm.moid).await.map(|_| vm),
                        Err(e) => Err(e),
                    }
                }
            };

            let mut images = images.write().await;
            let Some(image) = images.get_mut(&image_id) else {
                debug!(image_id, "Image removed while provisioning, dropping result");
                return;
            };

            match built {
                Ok(vm) => {
                    image.moid = Some(vm.moid.clone());
                    image.state = PoolState::Available;
                    image.last_error = None;
                    info!(image_id, moid = %vm.moid, "Image provisioned");
                }
                Err(e) => {
                    image.state = PoolState::Unavailable;
                    image.last_error = Some(e.to_string());
                    warn!(image_id, error = %e, "Image provisioning failed");
                }
            }
        });
    }
}
