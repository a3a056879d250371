use crate::{http::message::ParsedMessage, server::connection::Connection};
use std::{borrow::Cow, fmt, sync::Arc};

/// What the worker does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handled {
    /// Frame the next message on the same connection.
    KeepAlive,
    /// End the exchange with an active shutdown: pending data is flushed and
    /// FIN is sent.
    Close,
    /// The handler saw the peer close: run the peer shutdown sequence.
    PeerClosed,
    /// Fatal failure: release the connection immediately. The value is only
    /// logged.
    Fail(i32),
}

impl From<i32> for Handled {
    /// Maps integer outcomes: negative is a failure, `0` a peer close,
    /// `i32::MAX` a close, anything else keeps the connection.
    #[inline]
    fn from(code: i32) -> Self {
        match code {
            i32::MAX => Handled::Close,
            0 => Handled::PeerClosed,
            code if code < 0 => Handled::Fail(code),
            _ => Handled::KeepAlive,
        }
    }
}

/// Processes messages whose path starts with the prefix it was registered for.
///
/// The implementor's own fields are its context: use `&self` for shared
/// state such as a document root. The handler owns the request body (the
/// declared [`content_length`](ParsedMessage::content_length) bytes are
/// still on the socket) and must write its own response.
///
/// Closures with the same signature implement this trait.
///
/// # Examples
///
/// ```
/// use halfclose_web::{Handled, Handler, HandlerPacket, ParsedMessage, ResponseHead, StatusCode};
/// use std::path::PathBuf;
///
/// struct Files {
///     root: PathBuf,
/// }
///
/// impl Handler for Files {
///     fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
///         let name = &message.path()[packet.route().len()..];
///         let head = ResponseHead::new(StatusCode::Ok, 0).mime("application/octet-stream");
///
///         match packet.connection().send_file(self.root.join(name), head) {
///             Ok(_) => Handled::KeepAlive,
///             Err(_) => Handled::Fail(-1),
///         }
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled;
}

impl<F> Handler for F
where
    F: Fn(&ParsedMessage, &HandlerPacket<'_>) -> Handled + Send + Sync + 'static,
{
    #[inline]
    fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
        self(message, packet)
    }
}

/// Per-dispatch view handed to a [`Handler`].
pub struct HandlerPacket<'a> {
    pub(crate) connection: &'a Connection,
    pub(crate) route: &'a str,
}

impl<'a> HandlerPacket<'a> {
    /// The connection the message arrived on.
    #[inline(always)]
    pub fn connection(&self) -> &'a Connection {
        self.connection
    }

    /// The prefix the handler was selected by.
    #[inline(always)]
    pub fn route(&self) -> &'a str {
        self.route
    }
}

/// A handler registered for a path prefix.
///
/// An empty prefix never matches.
#[derive(Clone)]
pub struct HttpHandler {
    path_contains: Cow<'static, str>,
    handler: Arc<dyn Handler>,
}

impl HttpHandler {
    #[inline]
    pub fn new(path_contains: impl Into<Cow<'static, str>>, handler: impl Handler) -> Self {
        Self {
            path_contains: path_contains.into(),
            handler: Arc::new(handler),
        }
    }

    /// Same as [`new`](Self::new) for a closure, with the argument types
    /// inferred.
    #[inline]
    pub fn from_fn<F>(path_contains: impl Into<Cow<'static, str>>, handler: F) -> Self
    where
        F: Fn(&ParsedMessage, &HandlerPacket<'_>) -> Handled + Send + Sync + 'static,
    {
        Self::new(path_contains, handler)
    }

    #[inline(always)]
    pub fn path_contains(&self) -> &str {
        &self.path_contains
    }

    #[inline(always)]
    pub(crate) fn handle(&self, message: &ParsedMessage, packet: &HandlerPacket<'_>) -> Handled {
        self.handler.handle(message, packet)
    }
}

impl fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandler")
            .field("path_contains", &self.path_contains)
            .finish_non_exhaustive()
    }
}

/// The immutable handler set of a server.
#[derive(Debug, Default, Clone)]
pub(crate) struct Router {
    handlers: Vec<HttpHandler>,
}

impl Router {
    #[inline]
    pub(crate) fn new(handlers: Vec<HttpHandler>) -> Self {
        Self { handlers }
    }

    /// The handler with the longest non-empty prefix of `path`.
    ///
    /// Equal lengths resolve to the one registered last.
    pub(crate) fn select(&self, path: &str) -> Option<&HttpHandler> {
        let mut best: Option<&HttpHandler> = None;

        for handler in &self.handlers {
            let pattern = handler.path_contains();
            if pattern.is_empty() || !path.starts_with(pattern) {
                continue;
            }

            if best.map_or(true, |b| pattern.len() >= b.path_contains().len()) {
                best = Some(handler);
            }
        }

        best
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(pattern: &'static str, tag: i32) -> HttpHandler {
        HttpHandler::from_fn(pattern, move |_, _| Handled::Fail(tag))
    }

    fn selected(router: &Router, path: &str) -> Option<i32> {
        let handler = router.select(path)?;
        let (connection, _client) = crate::server::connection::test_pair::pair();
        let packet = HandlerPacket {
            connection: &connection,
            route: handler.path_contains(),
        };

        match handler.handle(&ParsedMessage::get(path), &packet) {
            Handled::Fail(tag) => Some(tag),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn longest_prefix() {
        let router = Router::new(vec![
            tagged("/", 1),
            tagged("/files/", 2),
            tagged("/files/reports/", 3),
            tagged("/api", 4),
        ]);

        #[rustfmt::skip]
        let cases = [
            ("/",                       Some(1)),
            ("/index.html",             Some(1)),
            ("/files/a.txt",            Some(2)),
            ("/files/reports/q3.csv",   Some(3)),
            ("/files/reports",          Some(2)),
            ("/apiary",                 Some(4)),
        ];

        for (path, expected) in cases {
            assert_eq!(selected(&router, path), expected, "{path}");
        }
    }

    #[test]
    fn ties_resolve_to_last() {
        let router = Router::new(vec![
            tagged("/a/", 1),
            tagged("/b/", 2),
            tagged("/a/", 3),
            tagged("/a", 4),
        ]);

        assert_eq!(selected(&router, "/a/x"), Some(3));
        assert_eq!(selected(&router, "/b/x"), Some(2));
        assert_eq!(selected(&router, "/ab"), Some(4));
    }

    #[test]
    fn empty_pattern_never_matches() {
        let router = Router::new(vec![tagged("", 1)]);
        assert!(router.select("/").is_none());
        assert!(router.select("").is_none());

        let router = Router::new(vec![tagged("/x", 1), tagged("", 2)]);
        assert!(router.select("/y").is_none());
        assert_eq!(selected(&router, "/x"), Some(1));
    }

    #[test]
    fn integer_outcomes() {
        #[rustfmt::skip]
        let cases = [
            (i32::MAX, Handled::Close),
            (0,        Handled::PeerClosed),
            (-1,       Handled::Fail(-1)),
            (i32::MIN, Handled::Fail(i32::MIN)),
            (1,        Handled::KeepAlive),
            (200,      Handled::KeepAlive),
        ];

        for (code, expected) in cases {
            assert_eq!(Handled::from(code), expected);
        }
    }
}
