// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AppForge Taskqueue - Capture Job Scheduling and Tracking
//!
//! This crate schedules and tracks the long-running jobs behind the
//! AppForge conversion service: application captures, rebuilds, feed
//! scans, and project imports. Jobs run on a bounded worker pool,
//! publish observable snapshots while they progress, and remain
//! queryable after completion through a bounded history.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    API / UI / scheduler callers                  │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ add / abort / list / reorder / cleanup      │ task events
//!        ▼                                             ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 appforge-taskqueue (This Crate)                  │
//! │  ┌───────────┐  ┌──────────────────┐  ┌──────────────────────┐   │
//! │  │ TaskQueue │  │ TrackingExecutor │  │     Job runners      │   │
//! │  │ registry  │  │   worker pool    │  │ capture/scan/import  │   │
//! │  └───────────┘  └──────────────────┘  └──────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ acquire / release                │ start / poll / record
//!        ▼                                  ▼
//! ┌─────────────────────────┐  ┌────────────────────────────────────┐
//! │   appforge-workpool     │  │  converter, guest, and record      │
//! │   (capture VM leases)   │  │  store collaborator services       │
//! └─────────────────────────┘  └────────────────────────────────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! Every job moves through the same meta status ladder regardless of
//! its payload kind:
//!
//! ```text
//!    add_task           worker pickup           runner returns
//!   ──────────► WAITING ─────────────► RUNNING ──────────────► FINISHED
//!                  │                                               │
//!                  │ aborted before pickup                         ▼
//!                  └────────► FINISHED (Cancelled)          bounded history,
//!                                                           evicted oldest
//!                                                           first
//! ```
//!
//! Timestamps record the transitions (`queued`, `started`, `finished`,
//! epoch milliseconds, `-1` while unset) and `progress` runs `-1` (not
//! applicable) to `100`. Kind-specific state travels in the snapshot's
//! detail payload.
//!
//! # Modules
//!
//! - [`error`]: Error types for queue, state, and runner failures
//! - [`state`]: Job snapshots, builders, and per-kind detail payloads
//! - [`sync`]: Reorderable queue, bounded history, tracking executor
//! - [`collaborators`]: Traits for the converter, guest, store, and events
//! - [`jobs`]: Runner implementations for each job kind
//! - [`queue`]: The task queue facade itself
//! - [`config`]: Daemon configuration loaded from the environment

#![deny(missing_docs)]

/// Traits for the converter, guest, store, and event collaborators.
pub mod collaborators;

/// Daemon configuration loaded from the environment.
pub mod config;

/// Error types for queue, state, and runner failures.
pub mod error;

/// Runner implementations for each job kind.
pub mod jobs;

/// The task queue facade itself.
pub mod queue;

/// Job snapshots, builders, and per-kind detail payloads.
pub mod state;

/// Reorderable queue, bounded history, and the tracking executor.
pub mod sync;

pub use config::CoordinatorConfig;
pub use error::{ConfigError, JobError, Result, StateError, TaskError};
pub use queue::{NewTask, TaskQueue};
