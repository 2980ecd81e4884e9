//! Service configuration.
//!
//! All configuration is loaded from environment variables, each with a
//! default.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    /// The environment variable.
    pub var: &'static str,
    /// The value that failed to parse.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Directory for file-backed snapshots. In-memory snapshots when unset.
    pub snapshot_dir: Option<PathBuf>,
    /// Snapshot every this many events.
    pub snapshot_every: u64,
    /// Number of outbox workers.
    pub outbox_workers: usize,
    /// Serve Prometheus metrics at `/metrics`.
    pub metrics_enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            snapshot_dir: None,
            snapshot_every: 3,
            outbox_workers: 1,
            metrics_enabled: true,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional variables:
    /// - `ACCOUNTS_LISTEN_ADDR` -- bind address (default `0.0.0.0:8080`)
    /// - `ACCOUNTS_SNAPSHOT_DIR` -- snapshot directory (default: in memory)
    /// - `ACCOUNTS_SNAPSHOT_EVERY` -- events between snapshots (default 3)
    /// - `ACCOUNTS_OUTBOX_WORKERS` -- outbox worker count (default 1)
    /// - `ACCOUNTS_METRICS_ENABLED` -- serve `/metrics` (default `true`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let listen_addr = parse_var(&lookup, "ACCOUNTS_LISTEN_ADDR")?.unwrap_or(defaults.listen_addr);
        let snapshot_dir = lookup("ACCOUNTS_SNAPSHOT_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        let snapshot_every =
            parse_var(&lookup, "ACCOUNTS_SNAPSHOT_EVERY")?.unwrap_or(defaults.snapshot_every);
        let outbox_workers =
            parse_var(&lookup, "ACCOUNTS_OUTBOX_WORKERS")?.unwrap_or(defaults.outbox_workers);
        let metrics_enabled =
            parse_var(&lookup, "ACCOUNTS_METRICS_ENABLED")?.unwrap_or(defaults.metrics_enabled);

        if outbox_workers == 0 {
            return Err(ConfigError {
                var: "ACCOUNTS_OUTBOX_WORKERS",
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }

        Ok(Self {
            listen_addr,
            snapshot_dir,
            snapshot_every,
            outbox_workers,
            metrics_enabled,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|e: T::Err| ConfigError {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
