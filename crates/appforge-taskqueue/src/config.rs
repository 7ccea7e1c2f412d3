// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator configuration loaded from the environment.

use std::env;
use std::num::NonZeroUsize;
use std::time::Duration;

use appforge_workpool::model::{CloneSupport, VcConfig};

use crate::error::ConfigError;

/// History capacity used when `APPFORGE_MAX_FINISHED` is not set.
const DEFAULT_MAX_FINISHED: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// Coordinator configuration for the task queue daemon.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Executor worker count (default: 4, minimum 1).
    pub workers: usize,
    /// Finished jobs kept in history (default: 1000).
    pub max_finished: NonZeroUsize,
    /// Workpool tracker reconcile cadence (default: 30s).
    pub reconcile_interval: Duration,
    /// Queue identity used in logs (default: "appforge").
    pub queue_name: String,
    /// Virtualisation backend connection for the workpools.
    pub vc: VcConfig,
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    ///
    /// # Required Environment Variables
    /// - `APPFORGE_VC_HOST` - Virtual center hostname
    /// - `APPFORGE_VC_USERNAME` - Virtual center account
    /// - `APPFORGE_VC_PASSWORD` - Virtual center password
    /// - `APPFORGE_VC_DATACENTER` - Datacenter the pools live in
    ///
    /// # Optional Environment Variables
    /// - `APPFORGE_WORKERS` - Executor workers (default: 4, minimum 1)
    /// - `APPFORGE_MAX_FINISHED` - History capacity (default: 1000)
    /// - `APPFORGE_RECONCILE_INTERVAL_SECS` - Tracker cadence (default: 30)
    /// - `APPFORGE_QUEUE_NAME` - Log identity (default: "appforge")
    /// - `APPFORGE_VC_CLONE_SUPPORT` - "full", "linked" or "none" (default: "linked")
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let workers = match lookup("APPFORGE_WORKERS") {
            Some(value) => match value.parse::<usize>() {
                Ok(parsed) if parsed >= 1 => parsed,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "APPFORGE_WORKERS",
                        value,
                    });
                }
            },
            None => 4,
        };

        let max_finished = match lookup("APPFORGE_MAX_FINISHED") {
            Some(value) => value.parse::<NonZeroUsize>().map_err(|_| ConfigError::Invalid {
                key: "APPFORGE_MAX_FINISHED",
                value,
            })?,
            None => DEFAULT_MAX_FINISHED,
        };

        let reconcile_interval = match lookup("APPFORGE_RECONCILE_INTERVAL_SECS") {
            Some(value) => {
                let secs = value.parse::<u64>().map_err(|_| ConfigError::Invalid {
                    key: "APPFORGE_RECONCILE_INTERVAL_SECS",
                    value,
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(30),
        };

        let queue_name =
            lookup("APPFORGE_QUEUE_NAME").unwrap_or_else(|| "appforge".to_string());

        let vc = VcConfig {
            host: required(&lookup, "APPFORGE_VC_HOST")?,
            username: required(&lookup, "APPFORGE_VC_USERNAME")?,
            password: required(&lookup, "APPFORGE_VC_PASSWORD")?,
            datacenter: required(&lookup, "APPFORGE_VC_DATACENTER")?,
            clone_support: match lookup("APPFORGE_VC_CLONE_SUPPORT") {
                Some(value) => match value.to_ascii_lowercase().as_str() {
                    "full" => CloneSupport::Full,
                    "linked" => CloneSupport::Linked,
                    "none" => CloneSupport::None,
                    _ => {
                        return Err(ConfigError::Invalid {
                            key: "APPFORGE_VC_CLONE_SUPPORT",
                            value,
                        });
                    }
                },
                None => CloneSupport::Linked,
            },
        };

        Ok(Self {
            workers,
            max_finished,
            reconcile_interval,
            queue_name,
            vc,
        })
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(key))
}
