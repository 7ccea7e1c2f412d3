// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner trait definitions.
//!
//! Defines the abstract interface to the virtual center backend that
//! clones, installs, registers, and destroys VMs.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{DeleteMethod, VmImage, VmPattern};

/// Errors from provisioning operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The source ISO or VM was not found on the backend.
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// A clone operation failed.
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    /// A fresh install from media failed.
    #[error("Install failed: {0}")]
    InstallFailed(String),

    /// Snapshotting the base image failed.
    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),

    /// The backend rejected or could not complete a VM deletion.
    #[error("Delete failed for {moid}: {reason}")]
    DeleteFailed {
        /// Managed object reference of the VM.
        moid: String,
        /// Backend failure detail.
        reason: String,
    },

    /// The virtual center connection failed.
    #[error("Virtual center unreachable: {0}")]
    Unreachable(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Identity of a VM produced by a provisioning operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedVm {
    /// Managed object reference of the new VM.
    pub moid: String,
    /// Datastore path of the .vmx file.
    pub vmx_path: String,
}

/// Trait for VM provisioning backends.
///
/// Provisioners are pure backend drivers: they create and destroy VMs but
/// never touch pool or image bookkeeping. State transitions are handled by
/// the managers that call them.
#[async_trait]
pub trait VmProvisioner: Send + Sync {
    /// Clone a new VM from a snapshotted base image.
    async fn clone_from_image(&self, image: &VmImage, name: &str) -> Result<ProvisionedVm>;

    /// Install a fresh VM from media following a pattern.
    async fn install_from_media(&self, pattern: &VmPattern, name: &str) -> Result<ProvisionedVm>;

    /// Adopt a pre-existing VM by managed object reference.
    async fn register_existing(&self, moid: &str) -> Result<ProvisionedVm>;

    /// Take the base snapshot that clones are created from.
    async fn snapshot_base(&self, moid: &str) -> Result<()>;

    /// Remove a VM using the given method.
    async fn delete_vm(&self, moid: &str, method: DeleteMethod) -> Result<()>;
}
