// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioner module - virtual center backends.
//!
//! The managers in this crate never talk to a hypervisor directly; they
//! go through the [`VmProvisioner`] trait so tests can swap in the mock.

pub mod mock;
mod traits;

pub use mock::MockProvisioner;
pub use traits::*;
