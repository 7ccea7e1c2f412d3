// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AppForge Workpool - Capture VM Lifecycle Management
//!
//! This crate manages the pools of virtual machines that capture and
//! rebuild jobs run inside. It covers base image provisioning, pool
//! growth, lease handout, and background reconciliation of everything
//! that is still being provisioned.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      appforge-taskqueue                          │
//! │                 (capture and rebuild job runners)                │
//! └──────────────────────────────────────────────────────────────────┘
//!                  │ acquire / release                │ observe
//!                  ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  appforge-workpool (This Crate)                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐   │
//! │  │   VmImage    │  │   Workpool   │  │       Workpool        │   │
//! │  │   Manager    │  │   Manager    │  │       Tracker         │   │
//! │  └──────────────┘  └──────────────┘  └───────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//!                  │ clone / install / delete
//!                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     VmProvisioner backend                        │
//! │                (vSphere driver, mocks in tests)                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Pool and Image State Machine
//!
//! Pools and images share one three-state lifecycle. Every mutating
//! operation moves the record through `PROCESSING` so concurrent
//! mutations are rejected instead of interleaved:
//!
//! ```text
//!      create / reset                 settle
//!   ──────────────────► ┌────────────┐ ──────► ┌────────────┐
//!                       │ PROCESSING │         │ AVAILABLE  │
//!   delete ───────────► └────────────┘ ──────► └────────────┘
//!                              │        settle
//!                              │ failure (reason kept as last_error)
//!                              ▼
//!                       ┌─────────────┐
//!                       │ UNAVAILABLE │ ──── reset retries ────►
//!                       └─────────────┘
//! ```
//!
//! # Leases
//!
//! A lease couples one pool instance with the virtual center connection
//! needed to drive it. Acquisition is fail-fast: when no instance is
//! free the caller gets [`error::WorkpoolError::NoInstanceAvailable`]
//! immediately, and a pool with headroom grows in the background so a
//! retry can succeed. Releasing an unknown lease is a no-op, which makes
//! job cleanup paths safe to run twice.
//!
//! # Modules
//!
//! - [`error`]: Error types for workpool operations
//! - [`model`]: Pools, instances, images, leases, and their states
//! - [`provisioner`]: Backend trait that drives the hypervisor
//! - [`image_manager`]: Base image registration and deletion
//! - [`manager`]: Pool registry, growth, and the lease lifecycle
//! - [`tracker`]: Background reconciliation of in-flight provisioning

#![deny(missing_docs)]

/// Error types for workpool operations.
pub mod error;

/// Pools, instances, images, leases, and their states.
pub mod model;

/// Backend trait that drives the hypervisor.
pub mod provisioner;

/// Base image registration and deletion.
pub mod image_manager;

/// Pool registry, growth, and the lease lifecycle.
pub mod manager;

/// Background reconciliation of in-flight provisioning.
pub mod tracker;

pub use error::{Result, WorkpoolError};
pub use image_manager::VmImageManager;
pub use manager::{InstanceSpec, WorkpoolManager};
pub use model::{Lease, Workpool};
pub use tracker::{FailCounts, WorkpoolTracker};
