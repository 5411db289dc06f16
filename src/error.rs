//! Error types for the store engine.

use std::io;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the store engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-order HA traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Replication link errors.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Disk and persistence errors.
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    /// New standby synchronization failed.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Buffer or region allocation failed.
    #[error("allocation failed: {0}")]
    Allocate(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The store is going down or the facility is not running.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// The peer closed the HA channel cleanly.
    #[error("ha channel closed by peer")]
    CloseChannel,

    /// A store-transaction carried no data; only its callback was queued.
    #[error("store transaction has no data")]
    MsgUnsent,

    /// The peer requested the store to terminate.
    #[error("store terminated by peer")]
    StoreTerm,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire and framing errors. Always abort the message being processed.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Buffer ended before a field could be read.
    #[error("truncated input: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Unknown message type on the wire.
    #[error("unknown message type {0}")]
    UnknownMessage(u16),

    /// Unknown operation type on the wire.
    #[error("unknown operation type {0}")]
    UnknownOperation(u16),

    /// Message received out of order.
    #[error("message sequence gap: expected {expected}, got {got}")]
    MsgSqnGap { expected: u64, got: u64 },

    /// Fragment received out of order.
    #[error("fragment sequence gap: expected {expected}, got {got}")]
    FragSqnGap { expected: u32, got: u32 },

    /// Operation payload shorter or longer than its type requires.
    #[error("bad length {len} for {what}")]
    BadLength { what: &'static str, len: usize },

    /// Handle outside any resident generation.
    #[error("invalid handle {0:#x}")]
    InvalidHandle(u64),

    /// Anything else structurally wrong.
    #[error("{0}")]
    Malformed(String),
}

/// Replication transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link to the peer is gone (expected during failover).
    #[error("connection broke")]
    ConnectionBroke,

    /// Non-blocking receive found nothing.
    #[error("would block")]
    WouldBlock,

    /// The channel was closed locally.
    #[error("channel {0} closed")]
    Closed(i32),

    /// Socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Disk and persistence errors.
#[derive(Error, Debug)]
pub enum DiskError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A file failed validation.
    #[error("corrupt file {file}: {reason}")]
    Corrupt { file: String, reason: String },

    /// CRC mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A required file does not exist.
    #[error("missing file {0}")]
    Missing(String),

    /// The persistence pipeline hit a fatal write error earlier.
    #[error("persistence is in fatal state")]
    Fatal,

    /// A cancel-on-term task was dropped during shutdown.
    #[error("task cancelled")]
    Cancelled,
}

/// Synchronization errors, carrying the return code that aborted the sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The peer reported a failure.
    #[error("peer aborted sync with rc {0:?}")]
    Remote(ReturnCode),

    /// A local phase failed.
    #[error("sync phase {phase} failed with rc {rc:?}")]
    Local { phase: &'static str, rc: ReturnCode },

    /// The admin layer aborted the state transfer.
    #[error("admin state transfer aborted")]
    AdminAborted,
}

/// Stable numeric codes carried in acks and sync error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReturnCode {
    Ok = 0,
    SystemError = 1,
    AllocateError = 2,
    DiskError = 3,
    ConnectionBroke = 4,
    WouldBlock = 5,
    NotAvailable = 6,
    CloseChannel = 7,
    MsgUnsent = 8,
    StoreTerm = 9,
    Timeout = 10,
    SyncError = 11,
    ConfigError = 12,
}

impl ReturnCode {
    /// Decode a code received from the peer. Unknown values map to `SystemError`.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Ok,
            2 => Self::AllocateError,
            3 => Self::DiskError,
            4 => Self::ConnectionBroke,
            5 => Self::WouldBlock,
            6 => Self::NotAvailable,
            7 => Self::CloseChannel,
            8 => Self::MsgUnsent,
            9 => Self::StoreTerm,
            10 => Self::Timeout,
            11 => Self::SyncError,
            12 => Self::ConfigError,
            _ => Self::SystemError,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Convert a non-OK code back into an error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::ConnectionBroke => Err(TransportError::ConnectionBroke.into()),
            Self::WouldBlock => Err(TransportError::WouldBlock.into()),
            Self::DiskError => Err(DiskError::Fatal.into()),
            Self::AllocateError => Err(Error::Allocate("remote allocation failed".into())),
            Self::NotAvailable => Err(Error::NotAvailable("remote not available".into())),
            Self::CloseChannel => Err(Error::CloseChannel),
            Self::MsgUnsent => Err(Error::MsgUnsent),
            Self::StoreTerm => Err(Error::StoreTerm),
            Self::Timeout => Err(Error::Timeout),
            Self::SyncError => Err(SyncError::Remote(self).into()),
            Self::ConfigError => Err(Error::Config("remote config error".into())),
            Self::SystemError => Err(ProtocolError::Malformed("remote system error".into()).into()),
        }
    }
}

impl Error {
    /// Numeric code for this error as carried on the wire.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Error::Protocol(_) | Error::Internal(_) => ReturnCode::SystemError,
            Error::Transport(TransportError::ConnectionBroke)
            | Error::Transport(TransportError::Closed(_))
            | Error::Transport(TransportError::Io(_)) => ReturnCode::ConnectionBroke,
            Error::Transport(TransportError::WouldBlock) => ReturnCode::WouldBlock,
            Error::Disk(_) => ReturnCode::DiskError,
            Error::Sync(SyncError::Remote(rc)) | Error::Sync(SyncError::Local { rc, .. }) => *rc,
            Error::Sync(SyncError::AdminAborted) => ReturnCode::SystemError,
            Error::Allocate(_) => ReturnCode::AllocateError,
            Error::Config(_) => ReturnCode::ConfigError,
            Error::NotAvailable(_) => ReturnCode::NotAvailable,
            Error::CloseChannel => ReturnCode::CloseChannel,
            Error::MsgUnsent => ReturnCode::MsgUnsent,
            Error::StoreTerm => ReturnCode::StoreTerm,
            Error::Timeout => ReturnCode::Timeout,
        }
    }

    /// Errors expected while a peer fails over; logged at trace level.
    pub fn is_connection_broke(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::ConnectionBroke) | Error::Transport(TransportError::Closed(_))
        )
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Transport(TransportError::WouldBlock))
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError::Malformed(msg.into()))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Protocol(ProtocolError::Malformed(format!("serialization: {}", e)))
    }
}
