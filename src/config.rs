//! Pool configuration.
//!
//! Parsing a config file or environment into this struct is the caller's
//! job — this module only defines the shape, its defaults, and validation.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Transaction isolation level; controls the degree of locking that occurs
/// when selecting data.
///
/// See <https://en.wikipedia.org/wiki/Isolation_(database_systems)#Isolation_levels>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Dirty reads are allowed; one transaction may see uncommitted changes
    /// made by another.
    ReadUncommitted,
    /// A `SELECT` only sees data committed before the query began.
    ReadCommitted,
    /// A `SELECT` only sees data committed before the transaction began.
    RepeatableRead,
    Serializable,
}

/// Configuration recognized by the pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Used in alert callbacks, diagnostics, and tracing output.
    pub pool_name: String,

    pub url: String,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub custom_properties: HashMap<String, String>,

    #[serde(default)]
    pub min_connections: u32,
    pub max_connections: u32,
    #[serde(default)]
    pub warning_size: Option<u32>,

    #[serde(default = "default_wait_timeout_millis")]
    pub wait_timeout_millis: u64,

    /// `maxInactiveTimeSecs` → `maxInactiveMillis`.
    #[serde(default)]
    pub max_inactive_time_secs: Option<u64>,

    /// `maxAgeMinutes` → `maxAgeMillis`; 0 disables age-based trimming.
    #[serde(default)]
    pub max_age_minutes: u64,

    #[serde(default = "default_trim_pool_freq_secs")]
    pub trim_pool_freq_secs: u64,

    /// 0 disables the health monitor entirely.
    #[serde(default = "default_heartbeat_freq_secs")]
    pub heartbeat_freq_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_seconds: u64,
    /// `None` ⇒ use the vendor liveness check instead of a SQL probe.
    #[serde(default)]
    pub heartbeat_sql: Option<String>,

    #[serde(default = "default_leak_time_minutes")]
    pub leak_time_minutes: u64,

    #[serde(default)]
    pub capture_stack_trace: bool,
    #[serde(default = "default_max_stack_trace_size")]
    pub max_stack_trace_size: usize,

    #[serde(default)]
    pub isolation_level: Option<IsolationLevel>,
    #[serde(default = "default_true")]
    pub auto_commit: bool,

    #[serde(default = "default_pstmt_cache_size")]
    pub pstmt_cache_size: usize,

    /// Ambient: threshold past which a slow `borrow()` is logged at `warn`,
    /// grounded in sqlx-core's `PoolOptions::acquire_slow_threshold`.
    #[serde(default = "default_acquire_slow_threshold_millis")]
    pub acquire_slow_threshold_millis: u64,
}

fn default_wait_timeout_millis() -> u64 {
    30_000
}
fn default_trim_pool_freq_secs() -> u64 {
    30
}
fn default_heartbeat_freq_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    5
}
fn default_leak_time_minutes() -> u64 {
    60
}
fn default_max_stack_trace_size() -> usize {
    5
}
fn default_pstmt_cache_size() -> usize {
    25
}
fn default_acquire_slow_threshold_millis() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

impl PoolConfig {
    /// Validate limits and required fields, returning `Error::ConfigInvalid`
    /// on the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::ConfigInvalid("username is required".into()));
        }
        if self.password.is_empty() {
            return Err(Error::ConfigInvalid("password is required".into()));
        }
        if self.pool_name.is_empty() {
            return Err(Error::ConfigInvalid("poolName is required".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::ConfigInvalid(
                "maxConnections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::ConfigInvalid(
                "minConnections must not exceed maxConnections".into(),
            ));
        }
        if let Some(warning) = self.warning_size {
            if warning > self.max_connections {
                return Err(Error::ConfigInvalid(
                    "warningSize must not exceed maxConnections".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn warning_size(&self) -> u32 {
        self.warning_size
            .unwrap_or_else(|| self.max_connections.saturating_sub(1).max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_millis)
    }

    pub fn max_inactive(&self) -> Option<Duration> {
        self.max_inactive_time_secs.map(Duration::from_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        if self.max_age_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_age_minutes * 60))
        }
    }

    pub fn trim_pool_freq(&self) -> Duration {
        Duration::from_secs(self.trim_pool_freq_secs)
    }

    pub fn heartbeat_freq(&self) -> Option<Duration> {
        if self.heartbeat_freq_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.heartbeat_freq_secs))
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn leak_time(&self) -> Duration {
        Duration::from_secs(self.leak_time_minutes * 60)
    }

    pub fn acquire_slow_threshold(&self) -> Duration {
        Duration::from_millis(self.acquire_slow_threshold_millis)
    }
}
