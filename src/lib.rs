//! halfclose_web - Embeddable thread-per-connection HTTP/1.x server
//!
//! A small blocking server for native services that need an in-process HTTP
//! front end. Every accepted connection gets its own OS thread, every socket
//! operation is bounded by a timeout, and every connection ends through one
//! of three shutdown paths that sequence TCP's half-close correctly.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept => FRAMING => DECODING => handler | default 200 page => FRAMING ...
//!                                      ||
//!                                      \/
//!                    Active | Peer | Error shutdown => release
//! ```
//!
//! - **Active**: the server is done. Pending data is flushed, FIN is sent,
//!   the socket is released.
//! - **Peer**: the client sent FIN. Reading stops, FIN is sent back, the
//!   socket is released.
//! - **Error**: a transport or handler failure. The socket is released at
//!   once.
//!
//! Messages whose path matches no handler have their body drained and get
//! the configured `200` page; the connection stays open unless the client
//! sent `Connection: close`.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use halfclose_web::{Handled, HttpHandler, ResponseHead, Server, StatusCode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     Server::builder()
//!         .port(8080)
//!         .handler(HttpHandler::from_fn("/hello", |_, packet| {
//!             let head = ResponseHead::new(StatusCode::Ok, 0).mime("text/plain");
//!             match packet.connection().send_text(head, b"Hello world!") {
//!                 Ok(()) => Handled::KeepAlive,
//!                 Err(_) => Handled::Fail(-1),
//!             }
//!         }))
//!         .build()?
//!         .run();
//!     Ok(())
//! }
//! ```
//! Files and uploads:
//! ```no_run
//! use halfclose_web::{
//!     Handled, Handler, HandlerPacket, ParsedMessage, ResponseHead, Server, StatusCode,
//! };
//! use std::path::PathBuf;
//!
//! struct Files {
//!     root: PathBuf,
//! }
//!
//! impl Handler for Files {
//!     fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
//!         let name = &message.path()[packet.route().len()..];
//!         let head = ResponseHead::new(StatusCode::Ok, 0)
//!             .keep_alive(message.is_keep_alive())
//!             .download(name);
//!
//!         match packet.connection().send_file(self.root.join(name), head) {
//!             Ok(_) if message.is_keep_alive() => Handled::KeepAlive,
//!             Ok(_) => Handled::Close,
//!             Err(_) => Handled::Fail(-1),
//!         }
//!     }
//! }
//!
//! struct Uploads;
//!
//! impl Handler for Uploads {
//!     fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
//!         let Some(name) = message.query_value("name") else {
//!             return Handled::Fail(-2);
//!         };
//!         let size = message.content_length() as i64;
//!
//!         match packet.connection().receive_file("/srv/uploads/", name, size, true) {
//!             Ok(_) => Handled::KeepAlive,
//!             Err(_) => Handled::Fail(-3),
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     Server::builder()
//!         .port(8080)
//!         .route("/files/", Files { root: "/srv/files".into() })
//!         .route("/upload", Uploads)
//!         .build()?
//!         .run();
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`] events and never installs a subscriber:
//! lifecycle at `info`, per-message flow at `debug`, headers and captured
//! bodies at `trace`, protocol fallbacks at `warn` and transport or file
//! failures at `error`.

pub(crate) mod http {
    pub(crate) mod codec;
    pub(crate) mod message;
    pub mod query;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod registry;
    pub(crate) mod router;
    pub(crate) mod server_impl;
    pub(crate) mod shutdown;
    pub(crate) mod transfer;
    pub(crate) mod worker;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{ErrorKind, ServerError, TransferError},
    http::{
        codec::{ByteGenerator, Decoded, FrameOutcome, GeneratorSignal, HttpCodec, MessageCodec},
        message::ParsedMessage,
        query,
        response::{FallbackPages, Page, ResponseHead},
        types::{charset, mime, Header, Method, StatusCode, Version},
    },
    server::{
        connection::Connection,
        router::{Handled, Handler, HandlerPacket, HttpHandler},
        server_impl::{Server, ServerBuilder, StopHandle, StopReason},
        shutdown::{Exit, ExitReason, ShutdownKind},
        transfer::Delivery,
    },
};
