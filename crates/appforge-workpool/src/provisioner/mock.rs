// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provisioner for testing.
//!
//! A simple provisioner implementation that fabricates VM identities
//! without talking to a virtual center. Failure modes are toggled at
//! runtime through atomic flags, so tests can flip a backend into a
//! broken state mid-scenario.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::model::{DeleteMethod, VmImage, VmPattern};

/// Mock provisioner for testing.
#[derive(Debug, Default)]
pub struct MockProvisioner {
    /// Fail `clone_from_image` calls while set.
    pub fail_clone: AtomicBool,
    /// Fail `install_from_media` calls while set.
    pub fail_install: AtomicBool,
    /// Fail `delete_vm` calls while set.
    pub fail_delete: AtomicBool,
    /// Hold clone and install calls open while set.
    pub block_provisioning: AtomicBool,
    deleted: Mutex<Vec<String>>,
}

impl MockProvisioner {
    /// Create a mock provisioner where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moids of all VMs deleted so far, in deletion order.
    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    async fn gate(&self) {
        while self.block_provisioning.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn vm(name: &str) -> ProvisionedVm {
        ProvisionedVm {
            moid: format!("vm-{}", name),
            vmx_path: format!("[ds] pool/{}.vmx", name),
        }
    }
}

#[async_trait]
impl VmProvisioner for MockProvisioner {
    async fn clone_from_image(&self, _image: &VmImage, name: &str) -> Result<ProvisionedVm> {
        self.gate().await;
        if self.fail_clone.load(Ordering::Relaxed) {
            return Err(ProvisionError::CloneFailed("datastore full".to_string()));
        }
        Ok(Self::vm(name))
    }

    async fn install_from_media(&self, _pattern: &VmPattern, name: &str) -> Result<ProvisionedVm> {
        self.gate().await;
        if self.fail_install.load(Ordering::Relaxed) {
            return Err(ProvisionError::InstallFailed("iso unreadable".to_string()));
        }
        Ok(Self::vm(name))
    }

    async fn register_existing(&self, moid: &str) -> Result<ProvisionedVm> {
        Ok(ProvisionedVm {
            moid: moid.to_string(),
            vmx_path: format!("[ds] adopted/{}.vmx", moid),
        })
    }

    async fn snapshot_base(&self, _moid: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_vm(&self, moid: &str, _method: DeleteMethod) -> Result<()> {
        if self.fail_delete.load(Ordering::Relaxed) {
            return Err(ProvisionError::DeleteFailed {
                moid: moid.to_string(),
                reason: "vm is locked".to_string(),
            });
        }
        self.deleted.lock().await.push(moid.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OsInfo, OsKind, OsRegistration};

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

    #[tokio::test]
    async fn test_mock_install_success() {
        let mock = MockProvisioner::new();
        let vm = mock.install_from_media(&pattern(), "img-1").await.unwrap();
        assert_eq!(vm.moid, "vm-img-1");
        assert!(vm.vmx_path.ends_with("img-1.vmx"));
    }

    #[tokio::test]
    async fn test_mock_install_failure() {
        let mock = MockProvisioner::new();
        mock.fail_install.store(true, Ordering::Relaxed);
        let err = mock
            .install_from_media(&pattern(), "img-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InstallFailed(_)));
    }

    #[tokio::test]
    async fn test_mock_records_deletions() {
        let mock = MockProvisioner::new();
        mock.delete_vm("vm-a", DeleteMethod::DeleteFromDisk)
            .await
            .unwrap();
        mock.delete_vm("vm-b", DeleteMethod::RemoveFromInventory)
            .await
            .unwrap();
        assert_eq!(mock.deleted().await, vec!["vm-a", "vm-b"]);

        mock.fail_delete.store(true, Ordering::Relaxed);
        let err = mock
            .delete_vm("vm-c", DeleteMethod::DeleteFromDisk)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::DeleteFailed { .. }));
        assert_eq!(mock.deleted().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_gate_holds_calls() {
        let mock = std::sync::Arc::new(MockProvisioner::new());
        mock.block_provisioning.store(true, Ordering::Relaxed);

        let held = mock.clone();
        let handle =
            tokio::spawn(async move { held.install_from_media(&pattern(), "slow").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        mock.block_provisioning.store(false, Ordering::Relaxed);
        let vm = handle.await.unwrap().unwrap();
        assert_eq!(vm.moid, "vm-slow");
    }
}
