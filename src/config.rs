//! Connection and session configuration.
//!
//! Plays the role `src/core/config.rs`'s `ReplicationConfig` plays in the
//! teacher — a validated, explicit options struct — but sourced from
//! caller-supplied fields rather than `env::var`, since this is a library
//! with no process environment of its own to read.

use std::time::Duration;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationKind {
    Physical,
    Logical,
}

/// Parameters needed to open the underlying connection (spec §6.2 `open()`:
/// "mutates connection settings to force non-pooled, non-enlisted,
/// `replication=physical|logical`, `server_compatibility_mode=no_type_loading`").
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub replication: ReplicationKind,
}

impl ConnectOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::invalid_argument("host", "host cannot be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(Error::invalid_argument("user", "user cannot be empty"));
        }
        Ok(())
    }

    /// Renders a libpq-style keyword/value connection string with
    /// non-pooled, non-type-loading replication settings forced on, per
    /// spec §6.2's `open()` contract.
    pub fn to_conninfo(&self) -> Result<String, Error> {
        self.validate()?;

        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("user={}", self.user),
        ];
        if let Some(password) = &self.password {
            parts.push(format!("password={password}"));
        }
        if let Some(dbname) = &self.dbname {
            parts.push(format!("dbname={dbname}"));
        }
        let replication = match self.replication {
            ReplicationKind::Physical => "true",
            ReplicationKind::Logical => "database",
        };
        parts.push(format!("replication={replication}"));
        Ok(parts.join(" "))
    }
}

/// Timing parameters for the feedback scheduler and silence detection
/// (spec §5 "Timeouts").
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Schedules feedback; default 10s.
    pub wal_receiver_status_interval: Duration,
    /// Maximum tolerated server silence; default 60s. Enforced by the
    /// Connector's own socket read deadline, not by this crate directly.
    pub wal_receiver_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            wal_receiver_status_interval: Duration::from_secs(10),
            wal_receiver_timeout: Duration::from_secs(60),
        }
    }
}
