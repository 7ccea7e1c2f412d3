// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Value types for workpools, base images, instances, and leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a workpool or base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// Ready for use.
    Available,
    /// Settled in a failed state; `last_error` explains why.
    Unavailable,
    /// An asynchronous operation (creation, reset, deletion) is in flight.
    Processing,
}

impl PoolState {
    /// True once the record has settled into available or unavailable.
    pub fn is_settled(&self) -> bool {
        !matches!(self, PoolState::Processing)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Available => write!(f, "available"),
            PoolState::Unavailable => write!(f, "unavailable"),
            PoolState::Processing => write!(f, "processing"),
        }
    }
}

/// Lifecycle state of a single pool instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// The backing VM is being cloned or installed.
    Provisioning,
    /// Ready to be leased.
    Available,
    /// Exclusively held by a running job.
    Leased,
    /// The backing VM is being destroyed.
    Deleting,
    /// Provisioning or deletion failed.
    Failed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Provisioning => write!(f, "provisioning"),
            InstanceState::Available => write!(f, "available"),
            InstanceState::Leased => write!(f, "leased"),
            InstanceState::Deleting => write!(f, "deleting"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}

/// Guest OS family for a capture VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    /// Windows XP Professional.
    WinXpPro,
    /// Windows Vista.
    WinVista,
    /// Windows 7.
    Win7,
    /// Windows 8.
    Win8,
}

/// Guest OS descriptor: family plus edition variant ("Professional", "Ultimate", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// OS family.
    pub kind: OsKind,
    /// Edition variant, empty where the family has only one.
    pub variant: String,
}

/// Windows activation and identity settings applied during install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRegistration {
    /// Product license key.
    pub license_key: String,
    /// Registered user name.
    pub user_name: String,
    /// Registered organization.
    pub organization: String,
    /// KMS server address, empty for MAK activation.
    pub kms_server: String,
}

/// Recipe for building a fresh VM from install media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPattern {
    /// Datastore path of the OS install ISO.
    pub source_iso: String,
    /// Network to attach the VM to.
    pub network_name: String,
    /// Guest OS to install.
    pub os: OsInfo,
    /// Activation and identity settings.
    pub registration: OsRegistration,
}

/// Where a base image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmImageSource {
    /// Build a fresh VM from install media.
    Pattern(VmPattern),
    /// Adopt a pre-existing VM by managed object reference.
    ExistingVm {
        /// Managed object reference of the VM to adopt.
        moid: String,
    },
}

/// A base image that pool instances are cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmImage {
    /// Unique image id.
    pub id: u64,
    /// Human-readable name, unique across images.
    pub name: String,
    /// Lifecycle state.
    pub state: PoolState,
    /// Most recent provisioning failure, if any.
    pub last_error: Option<String>,
    /// Managed object reference of the built or adopted VM.
    /// `None` until provisioning completes.
    pub moid: Option<String>,
    /// How the image is produced.
    pub source: VmImageSource,
}

/// Credentials for the administrative account inside pool VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    /// Guest account name.
    pub username: String,
    /// Guest account password.
    pub password: String,
}

/// How pool instances for a workpool are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkpoolKind {
    /// Clone instances on demand from a base image.
    Linked {
        /// Id of the backing base image.
        image_id: u64,
    },
    /// Install each instance from scratch using a pattern.
    Full {
        /// Install recipe for new instances.
        pattern: VmPattern,
    },
    /// Instances are registered manually; the pool never grows on its own.
    Custom {
        /// Guest OS of the registered VMs.
        os: OsInfo,
    },
}

impl WorkpoolKind {
    /// Whether the pool can provision new instances by itself.
    pub fn is_growable(&self) -> bool {
        !matches!(self, WorkpoolKind::Custom { .. })
    }

    /// Short tag used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkpoolKind::Linked { .. } => "linked",
            WorkpoolKind::Full { .. } => "full",
            WorkpoolKind::Custom { .. } => "custom",
        }
    }
}

/// A provisioned VM belonging to a workpool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance id.
    pub id: u64,
    /// Managed object reference of the VM, `None` while provisioning.
    pub moid: Option<String>,
    /// Administrative guest account.
    pub guest: GuestCredentials,
    /// Datastore path of the .vmx file.
    pub vmx_path: String,
    /// Whether the guest logs the admin account in automatically.
    pub autologon: bool,
    /// Lifecycle state.
    pub state: InstanceState,
}

/// A named, bounded pool of capture VMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workpool {
    /// Unique workpool id.
    pub id: u64,
    /// Human-readable name, unique across workpools.
    pub name: String,
    /// Maximum number of instances the pool may hold.
    pub maximum: u32,
    /// Lifecycle state.
    pub state: PoolState,
    /// Most recent provisioning failure, if any.
    pub last_error: Option<String>,
    /// Administrative account configured on every instance.
    pub guest: GuestCredentials,
    /// How instances are produced.
    pub kind: WorkpoolKind,
    /// Instances currently belonging to the pool, oldest first.
    pub instances: Vec<Instance>,
}

impl Workpool {
    /// Find an instance by id.
    pub fn instance(&self, instance_id: u64) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == instance_id)
    }

    pub(crate) fn instance_mut(&mut self, instance_id: u64) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == instance_id)
    }

    /// Number of instances currently available for leasing.
    pub fn available_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Available)
            .count()
    }
}

/// Level of clone support offered by the virtual center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneSupport {
    /// Full clones only.
    Full,
    /// Linked clones supported.
    Linked,
    /// No cloning; only fresh installs.
    None,
}

/// Connection settings for the virtual center backing all pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcConfig {
    /// Host name or address.
    pub host: String,
    /// API user name.
    pub username: String,
    /// API password.
    pub password: String,
    /// Datacenter to operate in.
    pub datacenter: String,
    /// Clone capability of this datacenter.
    pub clone_support: CloneSupport,
}

/// A temporary exclusive claim on one pool instance.
///
/// Returned by `acquire` and must be handed back via `release`. Leases are
/// ephemeral: they are never persisted and die with the job that holds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique lease id.
    pub id: Uuid,
    /// Pool the instance was taken from.
    pub workpool_id: u64,
    /// The leased instance, as of acquisition time.
    pub instance: Instance,
    /// Connection settings for driving the instance.
    pub vc: VcConfig,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
}

/// How a VM is removed when a pool, image, or instance is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMethod {
    /// Destroy the VM and its files.
    DeleteFromDisk,
    /// Unregister the VM but leave its files in place.
    RemoveFromInventory,
}

impl std::fmt::Display for DeleteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeleteMethod::DeleteFromDisk => write!(f, "delete_from_disk"),
            DeleteMethod::RemoveFromInventory => write!(f, "remove_from_inventory"),
        }
    }
}
