// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for appforge-workpool.
//!
//! Provides a unified error type with stable error code strings for callers
//! that surface failures over an API.

use std::fmt;

use crate::provisioner::ProvisionError;

/// Result type using WorkpoolError
pub type Result<T> = std::result::Result<T, WorkpoolError>;

/// Errors raised by the workpool and image managers.
#[derive(Debug)]
#[non_exhaustive]
pub enum WorkpoolError {
    /// No workpool exists with the given id.
    WorkpoolNotFound {
        /// The workpool id that was not found.
        workpool_id: u64,
    },

    /// No base image exists with the given id.
    ImageNotFound {
        /// The image id that was not found.
        image_id: u64,
    },

    /// A workpool or image with this name already exists.
    NameInUse {
        /// The conflicting name.
        name: String,
    },

    /// No instance is free and the pool cannot satisfy the request now.
    ///
    /// Raised immediately; lease requests are never queued.
    NoInstanceAvailable {
        /// The pool that had no free instance.
        workpool_id: u64,
    },

    /// The pool still has outstanding leases and cannot be deleted.
    LeasesOutstanding {
        /// The pool holding the leases.
        workpool_id: u64,
        /// Number of leases still held.
        count: usize,
    },

    /// The pool cannot provision instances on its own.
    NotGrowable {
        /// The pool that was asked to grow.
        workpool_id: u64,
    },

    /// The pool is already holding `maximum` instances.
    AtMaximum {
        /// The pool that is full.
        workpool_id: u64,
        /// Its configured maximum.
        maximum: u32,
    },

    /// A maximum-instances value outside the accepted range.
    InvalidMaximum {
        /// The rejected value.
        value: u32,
    },

    /// The record exists but is not in a state that allows the operation.
    NotReady {
        /// The workpool or image id.
        id: u64,
        /// Its current state.
        state: String,
    },

    /// A provisioning operation against the virtual center failed.
    Provision(ProvisionError),
}

impl WorkpoolError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WorkpoolNotFound { .. } => "WORKPOOL_NOT_FOUND",
            Self::ImageNotFound { .. } => "IMAGE_NOT_FOUND",
            Self::NameInUse { .. } => "NAME_IN_USE",
            Self::NoInstanceAvailable { .. } => "NO_INSTANCE_AVAILABLE",
            Self::LeasesOutstanding { .. } => "LEASES_OUTSTANDING",
            Self::NotGrowable { .. } => "NOT_GROWABLE",
            Self::AtMaximum { .. } => "AT_MAXIMUM",
            Self::InvalidMaximum { .. } => "INVALID_MAXIMUM",
            Self::NotReady { .. } => "NOT_READY",
            Self::Provision(_) => "PROVISION_FAILED",
        }
    }
}

impl fmt::Display for WorkpoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkpoolNotFound { workpool_id } => {
                write!(f, "No workpool found with id: {}", workpool_id)
            }
            Self::ImageNotFound { image_id } => {
                write!(f, "No image found with id: {}", image_id)
            }
            Self::NameInUse { name } => {
                write!(f, "The name '{}' is already in use", name)
            }
            Self::NoInstanceAvailable { workpool_id } => {
                write!(f, "No instance available in workpool {}", workpool_id)
            }
            Self::LeasesOutstanding { workpool_id, count } => {
                write!(
                    f,
                    "Workpool {} still has {} outstanding lease(s)",
                    workpool_id, count
                )
            }
            Self::NotGrowable { workpool_id } => {
                write!(f, "Workpool {} cannot provision its own instances", workpool_id)
            }
            Self::AtMaximum {
                workpool_id,
                maximum,
            } => {
                write!(
                    f,
                    "Workpool {} already holds its maximum of {} instance(s)",
                    workpool_id, maximum
                )
            }
            Self::InvalidMaximum { value } => {
                write!(f, "Invalid maximum instance count: {}", value)
            }
            Self::NotReady { id, state } => {
                write!(f, "Record {} is {} and cannot accept this operation", id, state)
            }
            Self::Provision(err) => {
                write!(f, "Provisioning failed: {}", err)
            }
        }
    }
}

impl std::error::Error for WorkpoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Provision(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProvisionError> for WorkpoolError {
    fn from(err: ProvisionError) -> Self {
        WorkpoolError::Provision(err)
    }
}
