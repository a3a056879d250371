//! The three ways a connection ends.
//!
//! Every path converges on [`Connection::release`], which closes the socket,
//! detaches the worker thread handle, logs the exit and clears the record's
//! `open` flag. Dropping a [`Connection`] that was never shut down runs the
//! same release as an error shutdown, so a panicking handler still frees its
//! slot.

use crate::{errors::ErrorKind, http::types::StatusCode, server::connection::Connection};
use std::{
    fmt, io,
    io::Write,
    net::Shutdown,
};
use tracing::{debug, error, info, warn};

/// Which side ended the exchange, and how gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownKind {
    /// The server chose to end the exchange: flush, send FIN, release.
    Active,
    /// The peer sent FIN: stop reading, send our FIN, release.
    Peer,
    /// A transport or application failure: release immediately.
    Error,
}

/// Why a worker stopped. Only used for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A handler returned [`Handled::Close`](crate::Handled::Close).
    HandlerClosed,
    /// A handler returned [`Handled::PeerClosed`](crate::Handled::PeerClosed).
    HandlerPeerClosed,
    /// A handler returned [`Handled::Fail`](crate::Handled::Fail).
    HandlerFailed(i32),
    /// The peer closed after `consumed` bytes of an unfinished message or body.
    PeerClosed { consumed: u64 },
    /// A read failed while framing.
    ReadFailed(io::ErrorKind),
    /// The framer could not grow its buffer.
    FramerOutOfMemory,
    /// The framer gave up on the stream.
    FramerFatal(&'static str),
    /// The head broke a limit before it was complete, so the rest of the
    /// stream cannot be framed.
    MalformedHead(ErrorKind),
    /// Sending a fallback page failed.
    FallbackFailed(StatusCode),
    /// Reading an unhandled body failed.
    DrainFailed(io::ErrorKind),
    /// The client sent `Connection: close`.
    ClientRequestedClose,
    /// The connection was dropped without an explicit shutdown.
    Aborted,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::HandlerClosed => write!(f, "handler closed the connection"),
            ExitReason::HandlerPeerClosed => write!(f, "handler reported a peer close"),
            ExitReason::HandlerFailed(code) => write!(f, "handler failed with {code}"),
            ExitReason::PeerClosed { consumed } => {
                write!(f, "peer closed after {consumed} bytes")
            }
            ExitReason::ReadFailed(kind) => write!(f, "read failed: {kind}"),
            ExitReason::FramerOutOfMemory => write!(f, "framer out of memory"),
            ExitReason::FramerFatal(what) => write!(f, "framer gave up: {what}"),
            ExitReason::MalformedHead(kind) => write!(f, "malformed head: {kind}"),
            ExitReason::FallbackFailed(status) => {
                write!(f, "sending the {} page failed", status.as_u16())
            }
            ExitReason::DrainFailed(kind) => write!(f, "draining the body failed: {kind}"),
            ExitReason::ClientRequestedClose => write!(f, "client requested close"),
            ExitReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub kind: ShutdownKind,
    pub reason: ExitReason,
}

impl Connection {
    /// Ends the connection along `kind` and releases it.
    pub(crate) fn shutdown(mut self, kind: ShutdownKind, reason: ExitReason) -> Exit {
        match kind {
            ShutdownKind::Active => self.active_shutdown(),
            ShutdownKind::Peer => self.peer_shutdown(),
            ShutdownKind::Error => {
                warn!(conn = self.id(), peer = %self.peer_addr(), %reason, "error shutdown")
            }
        }

        self.release(kind, &reason);
        Exit { kind, reason }
    }

    fn active_shutdown(&self) {
        info!(conn = self.id(), peer = %self.peer_addr(), "active shutdown");
        let Ok(mut stream) = self.stream() else {
            return;
        };

        if let Err(e) = stream.flush() {
            error!(conn = self.id(), error = %e, "flush before shutdown failed");
        }
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            error!(conn = self.id(), error = %e, "shutdown of the write half failed");
        }
    }

    fn peer_shutdown(&self) {
        debug!(conn = self.id(), peer = %self.peer_addr(), "peer shutdown");
        let Ok(stream) = self.stream() else {
            return;
        };

        if let Err(e) = stream.shutdown(Shutdown::Read) {
            error!(conn = self.id(), error = %e, "shutdown of the read half failed");
        }
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            error!(conn = self.id(), error = %e, "shutdown of the write half failed");
        }
    }

    /// Closes the socket and detaches the thread handle, once.
    fn release(&mut self, kind: ShutdownKind, reason: &ExitReason) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        drop(stream);
        drop(self.record.take_thread());

        info!(
            conn = self.id(),
            peer = %self.peer_addr(),
            ?kind,
            %reason,
            "connection worker exit"
        );
        self.record.mark_closed();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release(ShutdownKind::Error, &ExitReason::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::test_pair;
    use std::{io::Read, sync::Arc, time::Duration};

    #[test]
    fn active_sends_fin_after_data() {
        let (connection, mut client) = test_pair::pair();
        let record = Arc::clone(&connection.record);

        connection.send_all(b"bye").unwrap();
        let exit = connection.shutdown(ShutdownKind::Active, ExitReason::HandlerClosed);

        assert_eq!(exit.kind, ShutdownKind::Active);
        assert!(!record.is_open());

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn peer_after_fin() {
        let (connection, mut client) = test_pair::pair();
        let record = Arc::clone(&connection.record);

        client.shutdown(Shutdown::Write).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(connection.recv(&mut buf).unwrap(), 0);

        let exit = connection.shutdown(ShutdownKind::Peer, ExitReason::PeerClosed { consumed: 0 });
        assert_eq!(exit.kind, ShutdownKind::Peer);
        assert!(!record.is_open());

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn release_runs_once() {
        let (connection, _client) = test_pair::pair();
        let record = Arc::clone(&connection.record);

        let exit = connection.shutdown(ShutdownKind::Error, ExitReason::HandlerFailed(-3));
        assert_eq!(
            exit,
            Exit {
                kind: ShutdownKind::Error,
                reason: ExitReason::HandlerFailed(-3)
            }
        );

        // The drop that followed `shutdown` found nothing left to release
        assert!(!record.is_open());
        assert!(!record.mark_closed());
    }

    #[test]
    fn drop_releases() {
        let (connection, _client) = test_pair::pair();
        let record = Arc::clone(&connection.record);

        assert!(record.is_open());
        drop(connection);
        assert!(!record.is_open());
    }

    #[test]
    fn reasons_display() {
        #[rustfmt::skip]
        let cases = [
            (ExitReason::HandlerFailed(-2),                         "handler failed with -2"),
            (ExitReason::PeerClosed { consumed: 5 },                "peer closed after 5 bytes"),
            (ExitReason::FallbackFailed(StatusCode::BadRequest),    "sending the 400 page failed"),
            (ExitReason::Aborted,                                   "aborted"),
        ];

        for (reason, expected) in cases {
            assert_eq!(reason.to_string(), expected);
        }
    }
}
