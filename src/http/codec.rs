//! Message framing and decoding.
//!
//! The worker never looks at HTTP grammar itself. It hands a
//! [`ByteGenerator`] to a [`MessageCodec`], which pulls single bytes until it
//! has one complete message head, and then asks the same codec to decode
//! that head into a [`ParsedMessage`].

use crate::{
    errors::ErrorKind,
    http::{
        message::ParsedMessage,
        query::Query,
        types::{slice_to_u64, Header, Method, Version},
    },
    limits::ReqLimits,
};
use memchr::{memchr, memmem};
use std::{collections::TryReserveError, io};

/// The connection preface of HTTP/2 (RFC 9113, Section 3.4) up to its first line break.
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n";

/// Growth step of the head buffer.
const HEAD_CHUNK: usize = 256;

/// What the last pull of a [`ByteGenerator`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorSignal {
    /// Nothing has been read yet.
    Idle,
    /// The last read produced a byte.
    Byte,
    /// The last read returned zero: the peer sent FIN.
    Closed,
    /// The last read failed, timeouts included.
    Failed(io::ErrorKind),
}

/// Pull-based single byte supplier over a blocking reader.
///
/// Every call to [`next`](Iterator::next) performs one read of one byte, so
/// the reader's timeout bounds each pull. Once `None` is returned,
/// [`last_signal`](Self::last_signal) tells a clean end of input apart from a
/// transport failure.
///
/// # Examples
/// ```
/// use halfclose_web::{ByteGenerator, GeneratorSignal};
///
/// let mut bytes = ByteGenerator::new(&b"ab"[..]);
/// assert_eq!(bytes.next(), Some(b'a'));
/// assert_eq!(bytes.next(), Some(b'b'));
/// assert_eq!(bytes.next(), None);
/// assert_eq!(bytes.last_signal(), GeneratorSignal::Closed);
/// ```
#[derive(Debug)]
pub struct ByteGenerator<R> {
    reader: R,
    last: GeneratorSignal,
}

impl<R: io::Read> ByteGenerator<R> {
    #[inline]
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            last: GeneratorSignal::Idle,
        }
    }

    #[inline(always)]
    pub fn last_signal(&self) -> GeneratorSignal {
        self.last
    }
}

impl<R: io::Read> Iterator for ByteGenerator<R> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => {
                    self.last = GeneratorSignal::Closed;
                    return None;
                }
                Ok(_) => {
                    self.last = GeneratorSignal::Byte;
                    return Some(byte[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.last = GeneratorSignal::Failed(e.kind());
                    return None;
                }
            }
        }
    }
}

/// Result of scanning for one message boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// One complete head, terminating blank line included.
    Complete(Vec<u8>),
    /// The input cannot be a valid head.
    Malformed(ErrorKind),
    /// The head buffer could not grow.
    OutOfMemory,
    /// The generator ran dry after `consumed` bytes.
    Exhausted { consumed: usize },
    /// The stream can not be served at all.
    Fatal(&'static str),
}

/// Result of decoding one framed head.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Message(ParsedMessage),
    Invalid(ErrorKind),
    OutOfMemory,
}

/// Framing and decoding of request heads.
///
/// [`HttpCodec`] is used unless the builder is given another implementation.
pub trait MessageCodec: Send + Sync + 'static {
    /// Pulls bytes from `source` until one message head is complete.
    ///
    /// Must not pull past the end of the head, nor past the byte that breaks
    /// a limit: anything after it belongs to the body or to the next message.
    fn frame(&self, source: &mut dyn Iterator<Item = u8>) -> FrameOutcome;

    /// Turns a head produced by [`frame`](Self::frame) into a message.
    fn decode(&self, head: &[u8]) -> Decoded;
}

/// HTTP/1.x head codec driven by [`ReqLimits`].
#[derive(Debug, Clone, Default)]
pub struct HttpCodec {
    limits: ReqLimits,
}

impl HttpCodec {
    #[inline]
    pub fn new(limits: ReqLimits) -> Self {
        Self { limits }
    }
}

impl MessageCodec for HttpCodec {
    fn frame(&self, source: &mut dyn Iterator<Item = u8>) -> FrameOutcome {
        let mut head: Vec<u8> = Vec::new();
        let mut consumed = 0;

        for byte in source {
            consumed += 1;

            // Empty lines before a request line are ignored (RFC 9112, Section 2.2)
            if head.is_empty() && (byte == b'\r' || byte == b'\n') {
                continue;
            }
            if head.len() == head.capacity() && head.try_reserve(HEAD_CHUNK).is_err() {
                return FrameOutcome::OutOfMemory;
            }

            head.push(byte);

            if head.as_slice() == HTTP2_PREFACE {
                return FrameOutcome::Fatal("HTTP/2 connection preface");
            }
            if head.ends_with(b"\r\n\r\n") {
                return FrameOutcome::Complete(head);
            }
            // Checked before the next pull so nothing past the limit is read
            if head.len() >= self.limits.max_head_size {
                return FrameOutcome::Malformed(ErrorKind::HeadTooLarge);
            }
        }

        FrameOutcome::Exhausted { consumed }
    }

    fn decode(&self, head: &[u8]) -> Decoded {
        match self.parse(head) {
            Ok(message) => Decoded::Message(message),
            Err(Failure::Invalid(kind)) => Decoded::Invalid(kind),
            Err(Failure::OutOfMemory) => Decoded::OutOfMemory,
        }
    }
}

enum Failure {
    Invalid(ErrorKind),
    OutOfMemory,
}

impl From<ErrorKind> for Failure {
    fn from(kind: ErrorKind) -> Self {
        Failure::Invalid(kind)
    }
}

impl From<TryReserveError> for Failure {
    fn from(_: TryReserveError) -> Self {
        Failure::OutOfMemory
    }
}

impl HttpCodec {
    fn parse(&self, head: &[u8]) -> Result<ParsedMessage, Failure> {
        let text = simdutf8::basic::from_utf8(head).map_err(|_| ErrorKind::InvalidEncoding)?;
        let mut rest = text;

        // REQUEST LINE
        let line = next_line(&mut rest).ok_or(ErrorKind::InvalidMethod)?;
        let (method, line) = split_once(line, b' ').ok_or(ErrorKind::InvalidMethod)?;
        let method = Method::from_bytes(method.as_bytes())?;
        let (target, version) = split_once(line, b' ').ok_or(ErrorKind::InvalidUrl)?;
        let (version, mut keep_alive) = Version::from_bytes(version.as_bytes())?;

        if !target.starts_with('/') || target.len() > self.limits.url_size {
            return Err(ErrorKind::InvalidUrl.into());
        }
        if target.bytes().any(|b| b.is_ascii_control()) {
            return Err(ErrorKind::InvalidUrl.into());
        }

        // URL
        let (before_fragment, fragment_str) = match memchr(b'#', target.as_bytes()) {
            Some(pos) => (&target[..pos], Some(&target[pos..])),
            None => (target, None),
        };
        let (path, query_str) = match memchr(b'?', before_fragment.as_bytes()) {
            Some(pos) => (&before_fragment[..pos], Some(&before_fragment[pos..])),
            None => (before_fragment, None),
        };

        let mut query = Vec::new();
        if let Some(query_str) = query_str {
            Query::parse_into(&mut query, query_str, self.limits.url_query_parts)
                .map_err(ErrorKind::from)?;
        }
        let mut fragment = Vec::new();
        if let Some(fragment_str) = fragment_str {
            Query::parse_into(&mut fragment, fragment_str, self.limits.url_query_parts)
                .map_err(ErrorKind::from)?;
        }

        // HEADERS
        let mut headers: Vec<Header> = Vec::new();
        let mut content_length: Option<u64> = None;

        loop {
            let line = next_line(&mut rest).ok_or(ErrorKind::InvalidHeader)?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= self.limits.header_count {
                return Err(ErrorKind::TooManyHeaders.into());
            }

            let colon = memchr(b':', line.as_bytes()).ok_or(ErrorKind::InvalidHeader)?;
            let name = &line[..colon];
            let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');

            if name.is_empty()
                || name.len() > self.limits.header_name_size
                || !name.bytes().all(is_token)
                || value.len() > self.limits.header_value_size
            {
                return Err(ErrorKind::InvalidHeader.into());
            }

            if name.eq_ignore_ascii_case("content-length") {
                let length =
                    slice_to_u64(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?;
                match content_length {
                    Some(previous) if previous != length => {
                        return Err(ErrorKind::InvalidContentLength.into())
                    }
                    _ => content_length = Some(length),
                }
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                return Err(ErrorKind::UnsupportedTransferEncoding.into());
            } else if name.eq_ignore_ascii_case("connection") {
                keep_alive = connection_mode(value, keep_alive)?;
            }

            headers.try_reserve(1)?;
            headers.push(Header::new(name, value));
        }

        Ok(ParsedMessage {
            method,
            target: target.to_owned(),
            path: path.to_owned(),
            query,
            fragment,
            version,
            headers,
            content_length: content_length.unwrap_or(0),
            keep_alive,
        })
    }
}

#[inline]
fn next_line<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let pos = memmem::find(rest.as_bytes(), b"\r\n")?;
    let line = &rest[..pos];
    *rest = &rest[pos + 2..];
    Some(line)
}

#[inline]
fn split_once(src: &str, byte: u8) -> Option<(&str, &str)> {
    let pos = memchr(byte, src.as_bytes())?;
    Some((&src[..pos], &src[pos + 1..]))
}

// RFC 9110, Section 5.6.2
#[rustfmt::skip]
#[inline(always)]
fn is_token(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(
        byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' |
        b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
    )
}

fn connection_mode(value: &str, current: bool) -> Result<bool, ErrorKind> {
    let mut mode = current;
    let mut seen = false;

    for option in value.split(',').map(str::trim).filter(|o| !o.is_empty()) {
        seen = true;
        if option.eq_ignore_ascii_case("close") {
            return Ok(false);
        }
        if option.eq_ignore_ascii_case("keep-alive") {
            mode = true;
        }
    }

    match seen {
        true => Ok(mode),
        false => Err(ErrorKind::InvalidConnection),
    }
}


#[cfg(test)]
mod decoder_tests {
    use super::*;

    fn decode(head: &str) -> Decoded {
        HttpCodec::default().decode(head.as_bytes())
    }

    macro_rules! message {
        ($head:expr) => {
            match decode($head) {
                Decoded::Message(message) => message,
                other => panic!("{:?} for {:?}", other, $head),
            }
        };
    }

    #[test]
    fn request_line() {
        let message = message!("POST /files/report?format=csv&v=2#page=3 HTTP/1.0\r\n\r\n");

        assert_eq!(message.method(), Method::Post);
        assert_eq!(message.target(), "/files/report?format=csv&v=2#page=3");
        assert_eq!(message.path(), "/files/report");
        assert_eq!(message.query_value("format"), Some("csv"));
        assert_eq!(message.query().len(), 2);
        assert_eq!(message.fragment(), &[("page".to_string(), "3".to_string())]);
        assert_eq!(message.version(), Version::Http10);
        assert!(!message.is_keep_alive());
        assert_eq!(message.content_length(), 0);
    }

    #[test]
    fn headers() {
        let message = message!(
            "PUT /u HTTP/1.1\r\nHost:  example.com \r\nX-Tag: a\r\nx-tag:b\r\n\
             Content-Length: 12\r\ncontent-length: 12\r\n\r\n"
        );

        assert_eq!(message.headers().len(), 5);
        assert_eq!(message.header("host"), Some("example.com"));
        assert_eq!(message.headers()[2].value(), "b");
        assert_eq!(message.content_length(), 12);
        assert!(message.is_keep_alive());
    }

    #[test]
    fn connection_header() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n",             Some(false)),
            ("GET / HTTP/1.1\r\nConnection: Upgrade, close\r\n\r\n",    Some(false)),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",        Some(true)),
            ("GET / HTTP/1.0\r\nConnection: upgrade\r\n\r\n",           Some(false)),
            ("GET / HTTP/1.1\r\nConnection: \r\n\r\n",                  None),
        ];

        for (head, expected) in cases {
            match (decode(head), expected) {
                (Decoded::Message(message), Some(keep_alive)) => {
                    assert_eq!(message.is_keep_alive(), keep_alive, "{head:?}")
                }
                (Decoded::Invalid(kind), None) => assert_eq!(kind, ErrorKind::InvalidConnection),
                (other, _) => panic!("{other:?} for {head:?}"),
            }
        }
    }

    #[test]
    fn invalid() {
        #[rustfmt::skip]
        let cases = [
            ("get / HTTP/1.1\r\n\r\n",                              ErrorKind::InvalidMethod),
            ("TRACE / HTTP/1.1\r\n\r\n",                            ErrorKind::InvalidMethod),
            ("GET\r\n\r\n",                                         ErrorKind::InvalidMethod),
            ("GET /\r\n\r\n",                                       ErrorKind::InvalidUrl),
            ("GET index.html HTTP/1.1\r\n\r\n",                     ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\n\r\n",                              ErrorKind::UnsupportedVersion),
            ("GET / a b HTTP/1.1\r\n\r\n",                          ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n",                   ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: empty\r\n\r\n",                   ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nBad Name: x\r\n\r\n",               ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",        ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n",
                                                                    ErrorKind::InvalidContentLength),
            ("GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
                                                                    ErrorKind::UnsupportedTransferEncoding),
        ];

        for (head, expected) in cases {
            assert_eq!(decode(head), Decoded::Invalid(expected), "{head:?}");
        }
    }

    #[test]
    fn limits() {
        let codec = HttpCodec::new(ReqLimits {
            url_size: 8,
            url_query_parts: 1,
            header_count: 1,
            ..ReqLimits::default()
        });

        #[rustfmt::skip]
        let cases = [
            ("GET /123456789 HTTP/1.1\r\n\r\n",      ErrorKind::InvalidUrl),
            ("GET /?a&b HTTP/1.1\r\n\r\n",           ErrorKind::Query(crate::query::Error::OverLimit(1))),
            ("GET / HTTP/1.1\r\nA: 1\r\nB: 2\r\n\r\n", ErrorKind::TooManyHeaders),
        ];

        for (head, expected) in cases {
            assert_eq!(codec.decode(head.as_bytes()), Decoded::Invalid(expected), "{head:?}");
        }
    }

    #[test]
    fn encoding() {
        let head = b"GET /\xff HTTP/1.1\r\n\r\n";
        assert_eq!(
            HttpCodec::default().decode(head),
            Decoded::Invalid(ErrorKind::InvalidEncoding)
        );
    }
}
