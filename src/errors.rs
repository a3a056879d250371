use crate::query;
use std::{io, net::SocketAddr};
use thiserror::Error;

/// Reasons the built-in decoder rejects a message head.
///
/// Every kind carries a stable numeric [`code`](ErrorKind::code) so that logs
/// stay comparable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("message head is not valid UTF-8")]
    InvalidEncoding,
    #[error("message head exceeds the configured size")]
    HeadTooLarge,

    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUrl,
    #[error("invalid query string: {0}")]
    Query(query::Error),

    #[error("invalid HTTP version")]
    InvalidVersion,
    #[error("HTTP version not supported")]
    UnsupportedVersion,

    #[error("invalid header line")]
    InvalidHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid Connection header")]
    InvalidConnection,
    #[error("transfer codings are not supported")]
    UnsupportedTransferEncoding,
}

impl ErrorKind {
    /// Numeric identifier of the failure, used only for diagnostics.
    #[inline]
    pub const fn code(&self) -> u16 {
        match self {
            ErrorKind::InvalidEncoding => 1,
            ErrorKind::HeadTooLarge => 2,
            ErrorKind::InvalidMethod => 3,
            ErrorKind::InvalidUrl => 4,
            ErrorKind::Query(_) => 5,
            ErrorKind::InvalidVersion => 6,
            ErrorKind::UnsupportedVersion => 7,
            ErrorKind::InvalidHeader => 8,
            ErrorKind::TooManyHeaders => 9,
            ErrorKind::InvalidContentLength => 10,
            ErrorKind::InvalidConnection => 11,
            ErrorKind::UnsupportedTransferEncoding => 12,
        }
    }
}

impl From<query::Error> for ErrorKind {
    fn from(err: query::Error) -> Self {
        ErrorKind::Query(err)
    }
}

/// Failures while setting up the listening socket.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to create the listening socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to configure the listening socket: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to read the local address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Failures that abort a file transfer and must escalate to the caller.
///
/// Recoverable problems (missing file, unsafe path, failed file write) are
/// answered with a fallback page instead and never show up here.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("peer closed after {received} of {expected} bytes")]
    PeerClosed { expected: u64, received: u64 },
    #[error("file ended after {sent} of {expected} bytes")]
    FileTruncated { expected: u64, sent: u64 },
}
