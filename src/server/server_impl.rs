use crate::{
    errors::ServerError,
    http::{
        codec::{HttpCodec, MessageCodec},
        response::FallbackPages,
    },
    limits::{ConnLimits, ReqLimits, ServerLimits, TransferLimits, WaitStrategy},
    server::{
        connection::{Connection, ConnectionRecord},
        registry::Registry,
        router::{Handler, HttpHandler, Router},
        worker::{serve, Shared},
    },
};
use crossbeam::{channel, utils::Backoff};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    borrow::Cow,
    collections::TryReserveError,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// A blocking HTTP/1.x server with one thread per connection.
///
/// [`build`](ServerBuilder::build) binds the listening socket;
/// [`run`](Self::run) accepts on the calling thread until an accept-path
/// failure or a [`StopHandle`] ends the loop, then waits for every worker to
/// finish on its own.
///
/// # Examples
///
/// ```no_run
/// use halfclose_web::{Handled, HttpHandler, ResponseHead, Server, StatusCode};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::builder()
///         .port(8080)
///         .handler(HttpHandler::from_fn("/hello", |_, packet| {
///             let head = ResponseHead::new(StatusCode::Ok, 0).mime("text/plain");
///             match packet.connection().send_text(head, b"Hello world!") {
///                 Ok(()) => Handled::KeepAlive,
///                 Err(_) => Handled::Fail(-1),
///             }
///         }))
///         .build()?;
///
///     let reason = server.run();
///     eprintln!("server stopped: {reason}");
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    limits: ServerLimits,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// A builder listening on `[::]:8080`, dual stack, without handlers.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            address: SocketAddr::from((Ipv6Addr::UNSPECIFIED, 8080)),
            handlers: Vec::new(),
            codec: None,
            pages: None,

            server_limits: None,
            connection_limits: None,
            request_limits: None,
            transfer_limits: None,
        }
    }

    /// The bound address, with the actual port when `0` was requested.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that makes [`run`](Self::run) stop accepting.
    #[inline]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
            wake: wake_address(self.local_addr),
        }
    }

    /// Accepts connections until something stops the loop, then blocks until
    /// every connection accepted so far has been released.
    pub fn run(self) -> StopReason {
        info!(addr = %self.local_addr, "server start");

        let threshold = self.limits.compaction_threshold();
        let mut registry = Registry::new();
        let mut next_id: u64 = 0;

        let reason = loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break StopReason::AcceptFailed(e);
                }
            };

            if self.stop.load(Ordering::Acquire) {
                drop(stream);
                break StopReason::Stopped;
            }

            next_id += 1;
            let record = Arc::new(ConnectionRecord::new(next_id, peer));
            let connection = match Connection::open(
                stream,
                Arc::clone(&record),
                &self.shared.conn_limits,
                self.shared.transfer.clone(),
                Arc::clone(&self.shared.pages),
            ) {
                Ok(connection) => connection,
                Err(source) => {
                    error!(%peer, error = %source, "cannot configure connection");
                    break StopReason::ConfigureFailed { peer, source };
                }
            };

            if let Err(reason) =
                start_worker(connection, record, &self.shared, &mut registry, threshold)
            {
                error!(%peer, %reason, "cannot start worker");
                break reason;
            }
        };

        info!(%reason, "server stopping, waiting for workers");
        registry.for_each(|record| {
            if record.is_open() {
                debug!(conn = record.id(), peer = %record.peer(), "worker still running");
            }
        });
        wait_all_closed(&registry, &self.limits.wait_strategy);
        info!(addr = %self.local_addr, "server exit");

        reason
    }
}

/// Spawns the worker, registers its record and only then lets it run.
fn start_worker(
    connection: Connection,
    record: Arc<ConnectionRecord>,
    shared: &Arc<Shared>,
    registry: &mut Registry,
    threshold: usize,
) -> Result<(), StopReason> {
    let (gate, opened) = channel::bounded::<()>(1);
    let peer = record.peer();
    let shared = Arc::clone(shared);

    let handle = thread::Builder::new()
        .name(format!("conn-{}", record.id()))
        .spawn(move || {
            // A closed gate means registration failed: dropping the
            // connection releases it
            if opened.recv().is_ok() {
                serve(connection, &shared);
            }
        })
        .map_err(|source| StopReason::SpawnFailed { peer, source })?;
    record.attach_thread(handle);

    register(registry, record, threshold).map_err(|_| StopReason::OutOfMemory)?;

    // The receiver lives until the worker has read from it
    let _ = gate.send(());
    Ok(())
}

/// Appends `record` and drops closed records once the registry has grown
/// past `threshold`.
pub(crate) fn register(
    registry: &mut Registry,
    record: Arc<ConnectionRecord>,
    threshold: usize,
) -> Result<(), TryReserveError> {
    registry.add(record)?;

    if registry.len() > threshold {
        let removed = registry.flush(ConnectionRecord::is_open);
        debug!(removed, remaining = registry.len(), "registry compacted");
    }
    Ok(())
}

fn wait_all_closed(registry: &Registry, strategy: &WaitStrategy) {
    let backoff = Backoff::new();

    while !registry.all_closed() {
        if !backoff.is_completed() {
            backoff.snooze();
            continue;
        }

        match strategy {
            WaitStrategy::Yield => thread::yield_now(),
            WaitStrategy::Sleep(time) => thread::sleep(*time),
        }
    }
}

fn bind(address: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;

    if address.is_ipv6() {
        socket.set_only_v6(false).map_err(ServerError::Configure)?;
    }
    socket
        .set_reuse_address(true)
        .map_err(ServerError::Configure)?;

    socket
        .bind(&address.into())
        .map_err(|source| ServerError::Bind {
            addr: address,
            source,
        })?;
    socket.listen(backlog).map_err(ServerError::Listen)?;

    Ok(socket.into())
}

/// Where a [`StopHandle`] connects to wake a blocked `accept`.
fn wake_address(local: SocketAddr) -> SocketAddr {
    match local.ip().is_unspecified() {
        // Dual stack sockets accept IPv4 loopback too
        true => SocketAddr::from((Ipv4Addr::LOCALHOST, local.port())),
        false => local,
    }
}

/// Why [`Server::run`] returned.
#[derive(Debug, Error)]
pub enum StopReason {
    #[error("stopped on request")]
    Stopped,
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] io::Error),
    #[error("the connection registry could not grow")]
    OutOfMemory,
    #[error("failed to start a worker for {peer}: {source}")]
    SpawnFailed {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to configure the connection from {peer}: {source}")]
    ConfigureFailed {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Stops a running [`Server`] from another thread.
///
/// Connections that are already being served are not interrupted;
/// [`Server::run`] returns once they have all finished.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    wake: SocketAddr,
}

impl StopHandle {
    /// Raises the stop flag and wakes the accept call with a loopback
    /// connection. Only the first call connects.
    pub fn stop(&self) -> io::Result<()> {
        if self.flag.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        TcpStream::connect(self.wake).map(drop)
    }
}

//

/// Builder for configuring and binding a [`Server`].
pub struct ServerBuilder {
    address: SocketAddr,
    handlers: Vec<HttpHandler>,
    codec: Option<Box<dyn MessageCodec>>,
    pages: Option<FallbackPages>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    transfer_limits: Option<TransferLimits>,
}

impl ServerBuilder {
    /// Listens on `[::]:port`, which serves IPv4 and IPv6 clients.
    #[inline(always)]
    pub fn port(mut self, port: u16) -> Self {
        self.address = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        self
    }

    /// Listens on exactly `address`. An IPv4 address gives an IPv4 only
    /// socket.
    #[inline(always)]
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Registers a handler. Among handlers whose prefix matches, the longest
    /// prefix wins and equal prefixes resolve to the one added last.
    #[inline(always)]
    pub fn handler(mut self, handler: HttpHandler) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Shorthand for [`handler`](Self::handler) with [`HttpHandler::new`].
    #[inline]
    pub fn route(self, path_contains: impl Into<Cow<'static, str>>, handler: impl Handler) -> Self {
        self.handler(HttpHandler::new(path_contains, handler))
    }

    /// Replaces the built-in [`HttpCodec`].
    ///
    /// [`request_limits`](Self::request_limits) only configures the built-in
    /// codec and is ignored once this is set.
    #[inline]
    pub fn codec(mut self, codec: impl MessageCodec) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Pages the server answers with on its own.
    #[inline(always)]
    pub fn pages(mut self, pages: FallbackPages) -> Self {
        self.pages = Some(pages);
        self
    }

    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Default timeouts of every accepted connection.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Limits of the built-in [`HttpCodec`].
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    #[inline(always)]
    pub fn transfer_limits(mut self, limits: TransferLimits) -> Self {
        self.transfer_limits = Some(limits);
        self
    }

    /// Creates, configures, binds and listens on the socket.
    ///
    /// # Errors
    ///
    /// Each setup step reports its own [`ServerError`] variant.
    pub fn build(self) -> Result<Server, ServerError> {
        let limits = self.server_limits.unwrap_or_default();
        let listener = bind(self.address, limits.backlog)?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let request_limits = self.request_limits.unwrap_or_default();
        let codec = self
            .codec
            .unwrap_or_else(|| Box::new(HttpCodec::new(request_limits)));

        let shared = Shared {
            router: Router::new(self.handlers),
            codec,
            pages: Arc::new(self.pages.unwrap_or_default()),
            conn_limits: self.connection_limits.unwrap_or_default(),
            transfer: self.transfer_limits.unwrap_or_default(),
        };
        debug!(addr = %local_addr, handlers = shared.router.len(), "server bound");

        Ok(Server {
            listener,
            local_addr,
            shared: Arc::new(shared),
            limits,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}
