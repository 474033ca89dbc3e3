//! Error taxonomy for the driver.
//!
//! Server `ERR` packets are classified by vendor error number into one of the
//! variants below; framing/IO failures always become [`Error::Interface`] and
//! close the owning connection.

use thiserror::Error;

use crate::protocol::response::ErrPayload;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Connection lost, pool closed, or another interface-level failure not
    /// covered by a more specific variant below.
    #[error("interface error: {0}")]
    Interface(String),

    /// Packet buffer ran out before a field could be fully read.
    #[error("unexpected eof while parsing a packet")]
    UnexpectedEof,

    /// A packet's bytes don't match the shape its header/discriminator promised.
    #[error("invalid packet")]
    InvalidPacket,

    /// Server-reported error that does not fit a narrower classification.
    #[error("database error: {0}")]
    Database(ErrPayload),

    /// Numeric overflow, invalid date, or decoding failure.
    #[error("data error: {0}")]
    Data(String),

    /// Server shutdown, lock wait timeout, or deadlock.
    #[error("operational error: {0}")]
    Operational(ErrPayload),

    /// Constraint violation (duplicate key, FK, not-null).
    #[error("integrity error: {0}")]
    Integrity(ErrPayload),

    /// Server reports an internal error.
    #[error("internal error: {0}")]
    Internal(ErrPayload),

    /// Placeholder count mismatch, closed cursor/connection reuse, protocol
    /// ordering violation (second command issued before the prior result set
    /// was fully consumed).
    #[error("programming error: {0}")]
    Programming(String),

    /// Feature intentionally unimplemented, e.g. backward scroll on a
    /// streaming cursor.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Requested cursor position would leave the buffered row set.
    #[error("index error: {0}")]
    Index(String),

    #[error("bad config error: {0}")]
    BadConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

/// MySQL error-number classification ranges used to bucket a raw `ERR`
/// packet into the taxonomy above. Ranges follow the server's own grouping
/// (`include/mysqld_error.h`): integrity violations cluster around the
/// 1048/1062/1452 family, operational failures around lock/shutdown codes.
impl From<ErrPayload> for Error {
    fn from(err: ErrPayload) -> Self {
        match err.error_code {
            1022 | 1048 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 => Error::Integrity(err),
            1053 | 1205 | 1206 | 1213 | 2006 | 2013 => Error::Operational(err),
            1001 | 1094 | 1126 => Error::Internal(err),
            _ => Error::Database(err),
        }
    }
}
