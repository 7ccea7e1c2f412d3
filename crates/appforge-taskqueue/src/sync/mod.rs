// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency primitives - pending queue, bounded history, tracked worker pool.

pub mod history_queue;
pub mod orderable_queue;
pub mod tracking_executor;

pub use history_queue::BoundedHistoryQueue;
pub use orderable_queue::OrderableQueue;
pub use tracking_executor::{Completion, ExecutorClosed, TrackedJob, TrackingExecutor};
