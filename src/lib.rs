//! A client-side engine for PostgreSQL streaming replication: slot
//! lifecycle, WAL streaming, pgoutput logical decoding, and base backups.
//!
//! The general PostgreSQL frontend protocol (Startup/Auth/extended query,
//! the type OID registry, connection-string parsing) is out of scope;
//! this crate talks to it only through the narrow [`connector::Connector`]
//! facade.

pub mod basebackup;
pub mod commands;
pub mod config;
pub mod connector;
pub mod database_info;
pub mod error;
pub mod feedback;
pub mod lsn;
pub mod pgoutput;
pub mod registry;
pub mod session;
pub mod tar;
pub mod version;
pub mod wal_stream;

pub use config::{ConnectOptions, ReplicationKind, SessionOptions};
pub use connector::{Connector, TokioPostgresConnector};
pub use error::{Error, Result};
pub use lsn::Lsn;
pub use pgoutput::PgOutputMessage;
pub use session::{IdentifySystemInfo, ReplicationSession, State, StreamEndReason};
pub use version::ServerVersion;
pub use wal_stream::XLogData;
