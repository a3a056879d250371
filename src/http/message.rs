use crate::http::types::{Header, Method, Version};

/// A decoded request head.
///
/// Owned by the connection worker for one request cycle and dropped before
/// the next message is framed. The body, if any, is still on the socket:
/// [`content_length`](Self::content_length) bytes follow the head.
///
/// # Examples
///
/// For the head
/// ```text
/// GET /files/report?format=csv&v=2#page=3 HTTP/1.1\r
/// Host: example.com\r
/// \r
/// ```
/// - [`path`](Self::path): `/files/report`
/// - [`target`](Self::target): `/files/report?format=csv&v=2#page=3`
/// - [`query`](Self::query): `[("format", "csv"), ("v", "2")]`
/// - [`fragment`](Self::fragment): `[("page", "3")]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) fragment: Vec<(String, String)>,
    pub(crate) version: Version,
    pub(crate) headers: Vec<Header>,
    pub(crate) content_length: u64,
    pub(crate) keep_alive: bool,
}

impl ParsedMessage {
    #[inline(always)]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target exactly as sent.
    #[inline(always)]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target without query string and fragment.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters in order of appearance. Keys may repeat.
    #[inline(always)]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First value of the query parameter `key`.
    #[inline]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parameters of the URL fragment (`#a=1&b=2`) in order of appearance.
    #[inline(always)]
    pub fn fragment(&self) -> &[(String, String)] {
        &self.fragment
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.version
    }

    /// All header lines in order of appearance. Names may repeat.
    #[inline(always)]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Value of the first header named `name`, compared case-insensitively.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Declared body length, `0` when the head carries no `Content-Length`.
    #[inline(always)]
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Whether the client expects the connection to stay open.
    #[inline(always)]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }
}

#[cfg(test)]
impl ParsedMessage {
    pub(crate) fn get(path: &str) -> Self {
        Self {
            method: Method::Get,
            target: path.to_owned(),
            path: path.to_owned(),
            query: Vec::new(),
            fragment: Vec::new(),
            version: Version::Http11,
            headers: Vec::new(),
            content_length: 0,
            keep_alive: true,
        }
    }
}
