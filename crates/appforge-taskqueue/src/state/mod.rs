// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job state model - snapshots, per-kind detail payloads, validating builder.

pub mod detail;
pub mod snapshot;

pub use detail::{
    CaptureRequest, ConversionDetail, ConversionStatus, FeedScanDetail, FeedScanStatus,
    ImportDetail, ImportStatus, JobDetail, JobKind, ManualModeDetail, ManualModeStatus,
    RebuildDetail,
};
pub use snapshot::{JobSnapshot, JobSnapshotBuilder, MetaStatus, UNSET_TIMESTAMP};

pub(crate) use detail::FinishVerdict;
