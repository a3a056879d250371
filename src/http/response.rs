//! Response head rendering and the fallback pages.

use crate::http::types::{charset, mime, StatusCode};
use std::{borrow::Cow, io::Write};

/// Everything needed to render one response head.
///
/// The rendered head always carries `connection` and `content-length`;
/// `content-type` is added when a MIME type is set and
/// `content-disposition: attachment` when a download name is set.
///
/// # Examples
/// ```
/// use halfclose_web::{ResponseHead, StatusCode};
///
/// let head = ResponseHead::new(StatusCode::Ok, 5)
///     .mime("text/plain")
///     .charset("utf-8");
///
/// let mut buf = Vec::new();
/// head.render(&mut buf);
/// assert_eq!(
///     buf,
///     b"HTTP/1.1 200 OK\r\n\
///       connection: keep-alive\r\n\
///       content-length: 5\r\n\
///       content-type: text/plain; charset=utf-8\r\n\
///       \r\n"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct ResponseHead<'a> {
    status: StatusCode,
    phrase: Option<&'a str>,
    keep_alive: bool,
    content_length: u64,
    mime: Option<&'a str>,
    charset: Option<&'a str>,
    download: Option<&'a str>,
}

impl<'a> ResponseHead<'a> {
    /// A keep-alive head without content type.
    #[inline]
    pub fn new(status: StatusCode, content_length: u64) -> Self {
        Self {
            status,
            phrase: None,
            keep_alive: true,
            content_length,
            mime: None,
            charset: None,
            download: None,
        }
    }

    /// Replaces the canonical reason phrase of the status.
    #[inline(always)]
    pub fn phrase(mut self, phrase: &'a str) -> Self {
        self.phrase = Some(phrase);
        self
    }

    #[inline(always)]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[inline(always)]
    pub fn mime(mut self, mime: &'a str) -> Self {
        self.mime = Some(mime);
        self
    }

    /// Charset parameter of `content-type`, ignored without [`mime`](Self::mime).
    #[inline(always)]
    pub fn charset(mut self, charset: &'a str) -> Self {
        self.charset = Some(charset);
        self
    }

    /// Marks the body as a download saved under `name`.
    #[inline(always)]
    pub fn download(mut self, name: &'a str) -> Self {
        self.download = Some(name);
        self
    }

    #[inline(always)]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[inline(always)]
    pub fn content_length(mut self, content_length: u64) -> Self {
        self.content_length = content_length;
        self
    }

    #[inline(always)]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Appends the rendered head, blank line included, to `buf`.
    pub fn render(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"HTTP/1.1");
        buf.extend_from_slice(self.status.as_code_bytes());
        buf.extend_from_slice(self.phrase.unwrap_or(self.status.reason()).as_bytes());
        buf.extend_from_slice(b"\r\n");

        buf.extend_from_slice(match self.keep_alive {
            true => b"connection: keep-alive\r\n",
            false => b"connection: close\r\n",
        });

        // Writing into a Vec never fails
        let _ = write!(buf, "content-length: {}\r\n", self.content_length);

        if let Some(mime) = self.mime {
            buf.extend_from_slice(b"content-type: ");
            buf.extend_from_slice(mime.as_bytes());
            if let Some(charset) = self.charset {
                buf.extend_from_slice(b"; charset=");
                buf.extend_from_slice(charset.as_bytes());
            }
            buf.extend_from_slice(b"\r\n");
        }

        if let Some(name) = self.download {
            buf.extend_from_slice(b"content-disposition: attachment; filename*=UTF-8''");
            percent_encode(name, buf);
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");
    }
}

// RFC 5987, Section 3.2.1 `attr-char`
fn percent_encode(src: &str, buf: &mut Vec<u8>) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    for &byte in src.as_bytes() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(
                byte,
                b'!' | b'#' | b'$' | b'&' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
            );

        match plain {
            true => buf.push(byte),
            false => buf.extend_from_slice(&[
                b'%',
                HEX[(byte >> 4) as usize],
                HEX[(byte & 0x0F) as usize],
            ]),
        }
    }
}

/// A reason phrase and an HTML body answered on a fixed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub phrase: Cow<'static, str>,
    pub html: Cow<'static, str>,
}

impl Page {
    #[inline]
    pub fn new(phrase: impl Into<Cow<'static, str>>, html: impl Into<Cow<'static, str>>) -> Self {
        Self {
            phrase: phrase.into(),
            html: html.into(),
        }
    }

    /// Head of this page on `status`, typed as UTF-8 HTML.
    #[inline]
    pub fn head(&self, status: StatusCode, keep_alive: bool) -> ResponseHead<'_> {
        ResponseHead::new(status, self.html.len() as u64)
            .phrase(&self.phrase)
            .keep_alive(keep_alive)
            .mime(mime::HTML)
            .charset(charset::UTF_8)
    }
}

/// Pages the server answers with on its own.
///
/// - `ok`: unhandled requests and completed uploads
/// - `bad_request`: heads the decoder rejects
/// - `not_found`: files that cannot be opened
/// - `internal_error`: decoder allocation failures, unsafe upload paths,
///   failed file I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPages {
    pub ok: Page,
    pub bad_request: Page,
    pub not_found: Page,
    pub internal_error: Page,
}

impl FallbackPages {
    /// The page answered on `status`, if any.
    #[inline]
    pub fn for_status(&self, status: StatusCode) -> Option<&Page> {
        match status {
            StatusCode::Ok => Some(&self.ok),
            StatusCode::BadRequest => Some(&self.bad_request),
            StatusCode::NotFound => Some(&self.not_found),
            StatusCode::InternalServerError => Some(&self.internal_error),
            _ => None,
        }
    }
}

impl Default for FallbackPages {
    fn default() -> Self {
        Self {
            ok: Page::new("OK", "<html><body><h1>200 OK</h1></body></html>"),
            bad_request: Page::new(
                "Bad Request",
                "<html><body><h1>400 Bad Request</h1></body></html>",
            ),
            not_found: Page::new(
                "Not Found",
                "<html><body><h1>404 Not Found</h1></body></html>",
            ),
            internal_error: Page::new(
                "Internal Server Error",
                "<html><body><h1>500 Internal Server Error</h1></body></html>",
            ),
        }
    }
}


#[cfg(test)]
mod page_tests {
    use super::*;

    #[test]
    fn default_pages() {
        let pages = FallbackPages::default();

        #[rustfmt::skip]
        let cases = [
            (StatusCode::Ok,                  Some("OK")),
            (StatusCode::BadRequest,          Some("Bad Request")),
            (StatusCode::NotFound,            Some("Not Found")),
            (StatusCode::InternalServerError, Some("Internal Server Error")),
            (StatusCode::Forbidden,           None),
        ];

        for (status, phrase) in cases {
            assert_eq!(pages.for_status(status).map(|p| p.phrase.as_ref()), phrase);
        }
    }

    #[test]
    fn page_head_length() {
        let page = Page::new("Fine", "<p>fine</p>");
        let mut buf = Vec::new();
        page.head(StatusCode::Ok, true).render(&mut buf);

        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 Fine\r\n"));
        assert!(text.contains("content-length: 11\r\n"));
        assert!(text.contains("content-type: text/html; charset=utf-8\r\n"));
    }
}
