// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the host. Configuration is loaded from the environment at
//! startup via [`HostConfig::from_env`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory for drives, keys and databases | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `TENANT_ODIN_ID` | Domain of the identity this host serves | `frodo.dotyou.cloud` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `OUTBOX_BATCH_SIZE` | Outbox items pulled per drive per sweep | `10` |
//! | `OUTBOX_POLL_INTERVAL_SECS` | Delay between outbox sweeps | `5` |
//! | `OUTBOX_MAX_ATTEMPTS` | Delivery attempts before an item is dropped | `10` |
//! | `INBOX_BATCH_SIZE` | Inbox items processed per drive per sweep | `20` |
//! | `INBOX_MAX_ATTEMPTS` | Processing attempts before an inbox item is dead-lettered | `5` |
//! | `PEER_OPERATION_MAX_ATTEMPTS` | Transport attempts per delivery | `3` |
//! | `PEER_OPERATION_DELAY_MS` | Delay between transport attempts | `300` |
//! | `PEER_SCHEME` | URL scheme used to reach peer hosts | `https` |
//! | `DRIVE_CACHE_CAPACITY` | Number of drive definitions kept in memory | `256` |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable name for the data directory path.
///
/// Every drive, the query index, the outbox and the tenant keys live
/// below this directory.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const TENANT_ODIN_ID_ENV: &str = "TENANT_ODIN_ID";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const OUTBOX_BATCH_SIZE_ENV: &str = "OUTBOX_BATCH_SIZE";
pub const OUTBOX_POLL_INTERVAL_ENV: &str = "OUTBOX_POLL_INTERVAL_SECS";
pub const OUTBOX_MAX_ATTEMPTS_ENV: &str = "OUTBOX_MAX_ATTEMPTS";
pub const INBOX_BATCH_SIZE_ENV: &str = "INBOX_BATCH_SIZE";
pub const INBOX_MAX_ATTEMPTS_ENV: &str = "INBOX_MAX_ATTEMPTS";
pub const PEER_OPERATION_MAX_ATTEMPTS_ENV: &str = "PEER_OPERATION_MAX_ATTEMPTS";
pub const PEER_OPERATION_DELAY_MS_ENV: &str = "PEER_OPERATION_DELAY_MS";
pub const PEER_SCHEME_ENV: &str = "PEER_SCHEME";
pub const DRIVE_CACHE_CAPACITY_ENV: &str = "DRIVE_CACHE_CAPACITY";

/// Default data root, matching the container volume mount.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Transit tuning shared by the sender, the outbox processor and the
/// inbox processor.
#[derive(Debug, Clone)]
pub struct TransitConfig {
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_max_attempts: u32,
    pub inbox_batch_size: usize,
    pub inbox_max_attempts: u32,
    pub peer_operation_max_attempts: u32,
    pub peer_operation_delay: Duration,
    pub peer_scheme: String,
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            outbox_batch_size: 10,
            outbox_poll_interval: Duration::from_secs(5),
            outbox_max_attempts: 10,
            inbox_batch_size: 20,
            inbox_max_attempts: 5,
            peer_operation_max_attempts: 3,
            peer_operation_delay: Duration::from_millis(300),
            peer_scheme: "https".to_string(),
        }
    }
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Identity served by this host, e.g. `frodo.dotyou.cloud`.
    pub tenant: String,
    /// `json` for structured logs, anything else for human-readable output.
    pub log_format: String,
    pub drive_cache_capacity: usize,
    pub transit: TransitConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            host: "0.0.0.0".to_string(),
            port: 8080,
            tenant: "frodo.dotyou.cloud".to_string(),
            log_format: "pretty".to_string(),
            drive_cache_capacity: 256,
            transit: TransitConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let transit_defaults = TransitConfig::default();

        Self {
            data_dir: env::var(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            host: env::var(HOST_ENV).unwrap_or(defaults.host),
            port: parse_env(PORT_ENV, defaults.port),
            tenant: env::var(TENANT_ODIN_ID_ENV)
                .map(|t| t.trim().to_lowercase())
                .unwrap_or(defaults.tenant),
            log_format: env::var(LOG_FORMAT_ENV).unwrap_or(defaults.log_format),
            drive_cache_capacity: parse_env(DRIVE_CACHE_CAPACITY_ENV, defaults.drive_cache_capacity),
            transit: TransitConfig {
                outbox_batch_size: parse_env(OUTBOX_BATCH_SIZE_ENV, transit_defaults.outbox_batch_size),
                outbox_poll_interval: Duration::from_secs(parse_env(
                    OUTBOX_POLL_INTERVAL_ENV,
                    transit_defaults.outbox_poll_interval.as_secs(),
                )),
                outbox_max_attempts: parse_env(
                    OUTBOX_MAX_ATTEMPTS_ENV,
                    transit_defaults.outbox_max_attempts,
                ),
                inbox_batch_size: parse_env(INBOX_BATCH_SIZE_ENV, transit_defaults.inbox_batch_size),
                inbox_max_attempts: parse_env(
                    INBOX_MAX_ATTEMPTS_ENV,
                    transit_defaults.inbox_max_attempts,
                ),
                peer_operation_max_attempts: parse_env(
                    PEER_OPERATION_MAX_ATTEMPTS_ENV,
                    transit_defaults.peer_operation_max_attempts,
                ),
                peer_operation_delay: Duration::from_millis(parse_env(
                    PEER_OPERATION_DELAY_MS_ENV,
                    transit_defaults.peer_operation_delay.as_millis() as u64,
                )),
                peer_scheme: env::var(PEER_SCHEME_ENV).unwrap_or(transit_defaults.peer_scheme),
            },
        }
    }

    /// Socket address string for the peer perimeter.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
