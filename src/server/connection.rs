use crate::{
    http::response::FallbackPages,
    limits::{ConnLimits, TransferLimits},
};
use crossbeam::atomic::AtomicCell;
use socket2::SockRef;
use std::{
    cell::Cell,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, trace};

/// Registry side of a connection.
///
/// Shared between the accept thread, which owns it through the registry, and
/// the worker, which clears `open` exactly once when it releases the socket.
pub(crate) struct ConnectionRecord {
    id: u64,
    peer: SocketAddr,
    open: AtomicBool,
    thread: AtomicCell<Option<JoinHandle<()>>>,
}

impl ConnectionRecord {
    #[inline]
    pub(crate) fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            open: AtomicBool::new(true),
            thread: AtomicCell::new(None),
        }
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[inline(always)]
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn attach_thread(&self, handle: JoinHandle<()>) {
        self.thread.store(Some(handle));
    }

    #[inline]
    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }

    /// Returns `true` for the call that actually closed the record.
    #[inline]
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

/// One accepted TCP connection, as seen by its worker and its handlers.
///
/// Handlers receive it by reference through a
/// [`HandlerPacket`](crate::HandlerPacket) and may read from and write to the
/// socket directly, or use the higher level
/// [`send_text`](Self::send_text), [`send_file`](Self::send_file) and
/// [`receive_file`](Self::receive_file).
///
/// Every read and write is bounded by the connection's timeouts. A timed out
/// operation returns an error of kind [`WouldBlock`](io::ErrorKind::WouldBlock)
/// or [`TimedOut`](io::ErrorKind::TimedOut), depending on the platform.
pub struct Connection {
    pub(crate) stream: Option<TcpStream>,
    pub(crate) record: Arc<ConnectionRecord>,
    recv_timeout: Cell<Duration>,
    send_timeout: Cell<Duration>,
    pub(crate) transfer: TransferLimits,
    pub(crate) pages: Arc<FallbackPages>,
}

impl Connection {
    /// Switches the socket to linger-off and applies the timeouts.
    pub(crate) fn open(
        stream: TcpStream,
        record: Arc<ConnectionRecord>,
        limits: &ConnLimits,
        transfer: TransferLimits,
        pages: Arc<FallbackPages>,
    ) -> io::Result<Self> {
        SockRef::from(&stream).set_linger(None)?;
        stream.set_read_timeout(as_timeout(limits.recv_timeout))?;
        stream.set_write_timeout(as_timeout(limits.send_timeout))?;

        Ok(Self {
            stream: Some(stream),
            record,
            recv_timeout: Cell::new(limits.recv_timeout),
            send_timeout: Cell::new(limits.send_timeout),
            transfer,
            pages,
        })
    }

    /// Sequence number assigned at accept time, starting at 1.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> SocketAddr {
        self.record.peer()
    }

    /// The fallback pages the server was configured with.
    #[inline(always)]
    pub fn pages(&self) -> &FallbackPages {
        &self.pages
    }

    #[inline(always)]
    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout.get()
    }

    #[inline(always)]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout.get()
    }

    /// Changes the read timeout for the rest of this connection.
    /// [`Duration::ZERO`] disables it.
    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream()?.set_read_timeout(as_timeout(timeout))?;
        self.recv_timeout.set(timeout);
        Ok(())
    }

    /// Changes the write timeout for the rest of this connection.
    /// [`Duration::ZERO`] disables it.
    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream()?.set_write_timeout(as_timeout(timeout))?;
        self.send_timeout.set(timeout);
        Ok(())
    }

    /// One read of at most `buf.len()` bytes. `Ok(0)` means the peer sent FIN.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream()?;
        loop {
            match stream.read(buf) {
                Ok(0) => {
                    debug!(conn = self.id(), "peer closed its write half");
                    return Ok(0);
                }
                Ok(n) => {
                    trace!(conn = self.id(), len = n, "recv");
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(conn = self.id(), error = %e, "recv failed");
                    return Err(e);
                }
            }
        }
    }

    /// Fills `buf` completely.
    ///
    /// Fails with [`UnexpectedEof`](io::ErrorKind::UnexpectedEof) if the peer
    /// closes first.
    #[inline]
    pub fn recv_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        self.stream()?.read_exact(buf)
    }

    /// Writes all of `buf`.
    pub fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut stream = self.stream()?;
        match stream.write_all(buf) {
            Ok(()) => {
                trace!(conn = self.id(), len = buf.len(), "send");
                Ok(())
            }
            Err(e) => {
                debug!(conn = self.id(), error = %e, "send failed");
                Err(e)
            }
        }
    }

    #[inline]
    pub(crate) fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

#[inline(always)]
fn as_timeout(timeout: Duration) -> Option<Duration> {
    match timeout.is_zero() {
        true => None,
        false => Some(timeout),
    }
}

#[cfg(test)]
pub(crate) mod test_pair {
    use super::*;
    use std::net::TcpListener;

    /// A server side [`Connection`] and the client socket talking to it.
    pub(crate) fn with(limits: &ConnLimits, transfer: TransferLimits) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        let record = Arc::new(ConnectionRecord::new(1, peer));
        let connection = Connection::open(
            stream,
            record,
            limits,
            transfer,
            Arc::new(FallbackPages::default()),
        )
        .unwrap();

        (connection, client)
    }

    pub(crate) fn pair() -> (Connection, TcpStream) {
        with(&ConnLimits::default(), TransferLimits::default())
    }
}
