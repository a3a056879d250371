//! The per-connection state machine.
//!
//! ```text
//! FRAMING => DECODING => DISPATCHING      => FRAMING
//!                     \=> DEFAULT_HANDLING => FRAMING
//! ```
//!
//! Every state can leave through one of the three shutdown paths. The loop
//! itself never touches the socket's lifetime: it only decides which
//! [`ShutdownKind`] ends it.

use crate::{
    errors::TransferError,
    http::{
        codec::{ByteGenerator, Decoded, FrameOutcome, GeneratorSignal, MessageCodec},
        message::ParsedMessage,
        response::FallbackPages,
        types::StatusCode,
    },
    limits::{ConnLimits, TransferLimits},
    server::{
        connection::Connection,
        router::{Handled, HandlerPacket, Router},
        shutdown::{Exit, ExitReason, ShutdownKind},
    },
};
use std::{io, sync::Arc};
use tracing::{debug, info, trace, warn};

/// Read-only state every worker of a server shares.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) codec: Box<dyn MessageCodec>,
    pub(crate) pages: Arc<FallbackPages>,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) transfer: TransferLimits,
}

enum Step {
    Continue,
    Stop(ShutdownKind, ExitReason),
}

/// Runs exchanges on `connection` until one of them ends it.
pub(crate) fn serve(connection: Connection, shared: &Shared) -> Exit {
    info!(conn = connection.id(), peer = %connection.peer_addr(), "connection worker start");

    loop {
        if let Step::Stop(kind, reason) = exchange(&connection, shared) {
            return connection.shutdown(kind, reason);
        }
    }
}

/// One pass through FRAMING, DECODING and the response.
fn exchange(connection: &Connection, shared: &Shared) -> Step {
    let (outcome, signal) = match connection.stream() {
        Ok(stream) => {
            let mut bytes = ByteGenerator::new(stream);
            let outcome = shared.codec.frame(&mut bytes);
            (outcome, bytes.last_signal())
        }
        Err(e) => return Step::Stop(ShutdownKind::Error, ExitReason::ReadFailed(e.kind())),
    };

    let head = match outcome {
        FrameOutcome::Complete(head) => head,
        FrameOutcome::Malformed(kind) => {
            // The unread rest of the head would be framed as a new message
            warn!(conn = connection.id(), code = kind.code(), error = %kind, "malformed head");
            return match respond(connection, StatusCode::BadRequest, false) {
                Step::Continue => Step::Stop(ShutdownKind::Active, ExitReason::MalformedHead(kind)),
                step => step,
            };
        }
        FrameOutcome::OutOfMemory => {
            return Step::Stop(ShutdownKind::Error, ExitReason::FramerOutOfMemory)
        }
        FrameOutcome::Exhausted { consumed } => return exhausted(signal, consumed as u64),
        FrameOutcome::Fatal(what) => {
            return Step::Stop(ShutdownKind::Error, ExitReason::FramerFatal(what))
        }
    };

    let message = match shared.codec.decode(&head) {
        Decoded::Message(message) => message,
        Decoded::Invalid(kind) => {
            warn!(conn = connection.id(), code = kind.code(), error = %kind, "invalid head");
            return respond(connection, StatusCode::BadRequest, true);
        }
        Decoded::OutOfMemory => {
            warn!(conn = connection.id(), len = head.len(), "no memory to decode head");
            return respond(connection, StatusCode::InternalServerError, true);
        }
    };
    log_message(connection, &message);

    let Some(handler) = shared.router.select(message.path()) else {
        return default_handling(connection, &message);
    };

    let packet = HandlerPacket {
        connection,
        route: handler.path_contains(),
    };
    match handler.handle(&message, &packet) {
        Handled::KeepAlive => Step::Continue,
        Handled::Close => Step::Stop(ShutdownKind::Active, ExitReason::HandlerClosed),
        Handled::PeerClosed => Step::Stop(ShutdownKind::Peer, ExitReason::HandlerPeerClosed),
        Handled::Fail(code) => Step::Stop(ShutdownKind::Error, ExitReason::HandlerFailed(code)),
    }
}

/// Maps a generator that ran dry to the shutdown it calls for.
fn exhausted(signal: GeneratorSignal, consumed: u64) -> Step {
    match signal {
        GeneratorSignal::Failed(kind) => {
            Step::Stop(ShutdownKind::Error, ExitReason::ReadFailed(kind))
        }
        _ => Step::Stop(ShutdownKind::Peer, ExitReason::PeerClosed { consumed }),
    }
}

fn respond(connection: &Connection, status: StatusCode, keep_alive: bool) -> Step {
    match connection.send_fallback(status, keep_alive) {
        Ok(()) => Step::Continue,
        Err(e) => {
            debug!(conn = connection.id(), status = status.as_u16(), error = %e, "fallback send failed");
            Step::Stop(ShutdownKind::Error, ExitReason::FallbackFailed(status))
        }
    }
}

/// Drains the body of an unrouted message and answers with the `200` page.
fn default_handling(connection: &Connection, message: &ParsedMessage) -> Step {
    let length = message.content_length();

    match connection.drain(length) {
        Ok(captured) if !captured.is_empty() => trace!(
            conn = connection.id(),
            len = length,
            body = %String::from_utf8_lossy(&captured),
            "unrouted body"
        ),
        Ok(_) => {}
        Err(TransferError::PeerClosed { received, .. }) => {
            return Step::Stop(ShutdownKind::Peer, ExitReason::PeerClosed { consumed: received })
        }
        Err(TransferError::Io(e)) => {
            return Step::Stop(ShutdownKind::Error, ExitReason::DrainFailed(e.kind()))
        }
        Err(TransferError::FileTruncated { .. }) => {
            return Step::Stop(ShutdownKind::Error, ExitReason::DrainFailed(io::ErrorKind::Other))
        }
    }

    let keep_alive = message.is_keep_alive();
    match respond(connection, StatusCode::Ok, keep_alive) {
        Step::Continue if !keep_alive => {
            Step::Stop(ShutdownKind::Active, ExitReason::ClientRequestedClose)
        }
        step => step,
    }
}

fn log_message(connection: &Connection, message: &ParsedMessage) {
    debug!(
        conn = connection.id(),
        method = message.method().as_str(),
        path = message.path(),
        version = ?message.version(),
        content_length = message.content_length(),
        keep_alive = message.is_keep_alive(),
        "message"
    );

    for (key, value) in message.query() {
        trace!(conn = connection.id(), %key, %value, "query");
    }
    for (key, value) in message.fragment() {
        trace!(conn = connection.id(), %key, %value, "fragment");
    }
    for header in message.headers() {
        trace!(conn = connection.id(), name = header.name(), value = header.value(), "header");
    }
}

#[cfg(test)]
pub(crate) mod test_shared {
    use super::*;
    use crate::{http::codec::HttpCodec, server::router::HttpHandler};

    pub(crate) fn with(handlers: Vec<HttpHandler>) -> Shared {
        with_codec(handlers, HttpCodec::default())
    }

    pub(crate) fn with_codec(handlers: Vec<HttpHandler>, codec: impl MessageCodec) -> Shared {
        Shared {
            router: Router::new(handlers),
            codec: Box::new(codec),
            pages: Arc::new(FallbackPages::default()),
            conn_limits: ConnLimits::default(),
            transfer: TransferLimits::default(),
        }
    }

    /// [`HttpCodec`] that runs out of memory on `/frame-oom` and `/decode-oom`.
    pub(crate) struct StarvedCodec(pub(crate) HttpCodec);

    impl MessageCodec for StarvedCodec {
        fn frame(&self, source: &mut dyn Iterator<Item = u8>) -> FrameOutcome {
            match self.0.frame(source) {
                FrameOutcome::Complete(head) if head.starts_with(b"GET /frame-oom ") => {
                    FrameOutcome::OutOfMemory
                }
                outcome => outcome,
            }
        }

        fn decode(&self, head: &[u8]) -> Decoded {
            match head.starts_with(b"GET /decode-oom ") {
                true => Decoded::OutOfMemory,
                false => self.0.decode(head),
            }
        }
    }
}
