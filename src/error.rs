//! Error types for the capture pipeline.
//!
//! Errors are split by pipeline stage so callers can react per the stage's
//! contract instead of string-matching a catch-all:
//!
//! - [`ConnectError`]: opening the bus adapter failed; retried by the
//!   reconnect supervisor under backoff.
//! - [`LinkError`]: a failure on an open link; [`LinkError::is_terminal`]
//!   decides whether the session closes or reading resumes.
//! - [`DecodeError`]: a single bad adapter record; counted and skipped,
//!   never stops the stream.
//! - [`SinkError`]: a persistence failure; [`SinkError::is_fatal`] decides
//!   whether the dispatcher unregisters the sink or treats it as degraded.
//!
//! [`Error`] is the crate-level umbrella returned from setup paths
//! (configuration, pipeline assembly) where the stage distinction no longer
//! matters.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure to open a bus adapter.
///
/// Every variant is fatal for the attempt; whether another attempt is made
/// is the reconnect supervisor's decision, not the link's.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("CAN device '{device}' not found")]
    DeviceNotFound { device: String },

    #[error("permission denied opening CAN device '{device}'")]
    PermissionDenied { device: String },

    #[error("bitrate mismatch on '{device}': requested {requested}, interface reports {active}")]
    BitrateMismatch { device: String, requested: u32, active: u32 },
}

impl ConnectError {
    /// Classify an I/O error from an adapter open call.
    pub fn from_open_io(device: impl Into<String>, err: &std::io::Error) -> Self {
        let device = device.into();
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => ConnectError::PermissionDenied { device },
            _ => ConnectError::DeviceNotFound { device },
        }
    }
}

/// Failure on an open bus link.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    /// The controller went bus-off. Terminal for the session.
    #[error("CAN controller entered bus-off state")]
    BusOff,

    /// No traffic within the read timeout. The caller may retry the read.
    #[error("no frame received within {after:?}")]
    Timeout { after: Duration },

    /// The adapter disappeared (unplugged, interface down). Terminal.
    #[error("CAN device removed")]
    DeviceRemoved,
}

impl LinkError {
    /// Terminal errors close the current session and hand control back to
    /// the supervisor; non-terminal errors allow the read loop to continue.
    pub fn is_terminal(&self) -> bool {
        match self {
            LinkError::BusOff => true,
            LinkError::DeviceRemoved => true,
            LinkError::Timeout { .. } => false,
        }
    }
}

/// A single adapter record that could not be decoded.
///
/// Decode errors never halt ingestion; the decoder logs, counts, and moves
/// on to the next record.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("truncated record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("invalid DLC {dlc} (max {max})")]
    InvalidDlc { dlc: u8, max: u8 },

    #[error("malformed record header: {reason}")]
    MalformedHeader { reason: &'static str },
}

/// Failure inside a registered sink.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SinkError {
    /// Storage device is out of space. The sink stalls (degraded) until
    /// space returns.
    #[error("durable store out of disk space")]
    DiskFull {
        #[source]
        source: rusqlite::Error,
    },

    /// The durable store is corrupt. Fatal: operator intervention required.
    #[error("durable store corruption detected")]
    Corruption {
        #[source]
        source: rusqlite::Error,
    },

    /// A backup attempt failed. The live store is unaffected.
    #[error("backup to {path} failed")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The time-series backend rejected a write or was unreachable.
    /// Retried internally with backoff; surfaces only for observability.
    #[error("time-series backend error: {reason}")]
    Series { reason: String },

    /// A relay transport closed underneath the sink. Fatal for the sink.
    #[error("relay transport lost")]
    TransportLost {
        #[source]
        source: std::io::Error,
    },

    /// The relay peer failed the pre-shared PIN check.
    #[error("relay handshake rejected")]
    HandshakeRejected,

    /// Storage error that is neither disk-full nor corruption.
    #[error("durable store error")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },

    /// The sink was asked to accept a frame after being closed.
    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    /// Fatal sink errors cause the dispatcher to unregister the sink and
    /// notify the operator; non-fatal errors demote it to degraded.
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Corruption { .. } => true,
            SinkError::TransportLost { .. } => true,
            SinkError::HandshakeRejected => true,
            SinkError::Closed => true,
            SinkError::DiskFull { .. } => false,
            SinkError::BackupFailed { .. } => false,
            SinkError::Series { .. } => false,
            SinkError::Storage { .. } => false,
        }
    }

    /// Classify a rusqlite error per the durable-sink contract.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DiskFull => SinkError::DiskFull { source: err },
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    SinkError::Corruption { source: err }
                }
                _ => SinkError::Storage { source: err },
            },
            _ => SinkError::Storage { source: err },
        }
    }

    /// Helper constructor for time-series backend failures.
    pub fn series(reason: impl Into<String>) -> Self {
        SinkError::Series { reason: reason.into() }
    }
}

/// Crate-level error for setup and assembly paths.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration parse error: {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid retention literal '{literal}'")]
    InvalidRetention { literal: String },
}
