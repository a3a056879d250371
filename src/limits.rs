//! Server configuration: registry policy, socket timeouts, decoder limits
//! and transfer chunking.
//!
//! Every structure implements [`Default`] with the values listed on its
//! fields, so only the interesting parts need to be spelled out.
//!
//! # Examples
//!
//! ```no_run
//! use halfclose_web::{Server, limits::{ConnLimits, ServerLimits, TransferLimits}};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .port(8080)
//!         .server_limits(ServerLimits {
//!             low_memory: true, // compact the registry early
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             recv_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .transfer_limits(TransferLimits {
//!             receive_chunk: 64 * 1024,
//!             ..TransferLimits::default()
//!         })
//!         .build()?;
//!
//!     server.run();
//!     Ok(())
//! }
//! ```

use std::time::Duration;

/// Accept-loop and registry behaviour.
///
/// # Registry compaction
///
/// Every accepted connection is appended to the registry. Closed entries are
/// only removed when, right after an append, the registry holds more entries
/// than the active threshold:
///
/// ```text
/// [ accept ] => [ append record ] => /  len > threshold?  \ == No ==> [ accept ]
///                                    \--------------------/
///                                             || Yes
///                                             \/
///                                   [ drop closed records ]
/// ```
///
/// The threshold is [`low_memory_registry_threshold`](Self::low_memory_registry_threshold)
/// when [`low_memory`](Self::low_memory) is set and
/// [`registry_threshold`](Self::registry_threshold) otherwise.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Memory-constrained mode (default: `false`).
    ///
    /// Switches the registry to the small compaction threshold.
    pub low_memory: bool,

    /// Compaction threshold in normal mode (default: `2000`).
    pub registry_threshold: usize,

    /// Compaction threshold in memory-constrained mode (default: `6`).
    pub low_memory_registry_threshold: usize,

    /// Listen backlog (default: `i32::MAX`).
    ///
    /// The operating system silently clamps it to its own maximum.
    pub backlog: i32,

    /// How the accept thread waits for the workers during shutdown
    /// (default: `Sleep(1ms)`).
    pub wait_strategy: WaitStrategy,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl ServerLimits {
    /// The registry size above which closed records are removed.
    #[inline]
    pub fn compaction_threshold(&self) -> usize {
        match self.low_memory {
            true => self.low_memory_registry_threshold,
            false => self.registry_threshold,
        }
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            low_memory: false,
            registry_threshold: 2000,
            low_memory_registry_threshold: 6,
            backlog: i32::MAX,
            wait_strategy: WaitStrategy::Sleep(Duration::from_millis(1)),

            _priv: (),
        }
    }
}

/// Strategy used while polling for every worker to finish.
///
/// The poll first spins and yields with an exponential backoff; once the
/// backoff is exhausted this strategy takes over.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`std::thread::yield_now()`]
    ///
    /// Keeps a core busy for as long as workers are alive.
    Yield,

    /// While waiting, uses [`std::thread::sleep()`]
    Sleep(Duration),
}

/// Per-connection socket behaviour.
///
/// Accepted sockets are always switched to linger-off, so closing them never
/// blocks the worker.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Timeout of every socket read (default: `15 seconds`).
    ///
    /// A read that times out is a transport error and ends the connection
    /// with an error shutdown. [`Duration::ZERO`] disables the timeout.
    pub recv_timeout: Duration,

    /// Timeout of every socket write (default: `15 seconds`).
    ///
    /// [`Duration::ZERO`] disables the timeout.
    pub send_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(15),

            _priv: (),
        }
    }
}

/// Limits of the built-in message decoder.
///
/// A decoded head that breaks a limit is answered with the 400 fallback page
/// and the connection keeps going. A head that outgrows `max_head_size` while
/// still being framed is answered with the 400 page and `connection: close`,
/// then the connection is shut down.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of the message head, blank line included (default: `8192`).
    pub max_head_size: usize,

    /// Maximum length of the request target (default: `2048`).
    pub url_size: usize,

    /// Maximum number of query parameters, and separately of fragment
    /// parameters (default: `32`).
    pub url_query_parts: usize,

    /// Maximum number of headers (default: `64`).
    pub header_count: usize,

    /// Maximum length of a header name (default: `64`).
    pub header_name_size: usize,

    /// Maximum length of a header value (default: `4096`).
    pub header_value_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            max_head_size: 8192,
            url_size: 2048,
            url_query_parts: 32,
            header_count: 64,
            header_name_size: 64,
            header_value_size: 4096,

            _priv: (),
        }
    }
}

/// Chunk sizes of the streaming paths.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    /// Largest slice of a file handed to one bulk send (default: `2147483646`).
    pub send_chunk: u64,

    /// Buffer size of [`receive_file`](crate::Connection::receive_file)
    /// (default: `512000`).
    pub receive_chunk: usize,

    /// Read size used to drain unhandled request bodies (default: `1024`).
    pub drain_chunk: usize,

    /// How many bytes of a drained body are kept for the trace log
    /// (default: `5096`).
    ///
    /// Draining always runs to the declared length; this only bounds what
    /// is logged.
    pub capture_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for TransferLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            send_chunk: 2_147_483_646,
            receive_chunk: 512_000,
            drain_chunk: 1024,
            capture_size: 5096,

            _priv: (),
        }
    }
}
