//! `key=value&key=value` splitter shared by the query string and the URL fragment.

use memchr::memchr;
use std::{error, fmt};

/// Splitter for URL query strings and fragment parameter lists.
///
/// Pairs are appended in input order and keys need not be unique. There is
/// no percent-decoding: values are returned exactly as they appear on the wire.
///
/// # Examples
/// ```rust
/// use halfclose_web::query::Query;
///
/// let mut params = Vec::new();
/// Query::parse_into(&mut params, "debug&name=&=Qwe&key=sda&&", 10).unwrap();
///
/// assert_eq!(params.len(), 5);
/// assert_eq!(params[0], ("debug".to_string(), String::new()));
/// assert_eq!(params[2], (String::new(), "Qwe".to_string()));
/// assert_eq!(params[3], ("key".to_string(), "sda".to_string()));
/// ```
pub struct Query;

impl Query {
    /// Parses `query` into a new vector.
    ///
    /// A single leading `?` or `#` is skipped, so `?a=1`, `#a=1` and `a=1`
    /// are equivalent.
    #[inline]
    pub fn parse(query: &str, limit: usize) -> Result<Vec<(String, String)>, Error> {
        let mut result = Vec::new();
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Appends the pairs of `query` to `result`.
    ///
    /// `limit` bounds the total length of `result`, including pairs that were
    /// already present.
    pub fn parse_into(
        result: &mut Vec<(String, String)>,
        query: &str,
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.as_bytes().first().ok_or(Error::Empty)? {
            b'?' | b'#' => &query[1..],
            _ => query,
        };
        let bytes = data.as_bytes();

        let mut start = 0;
        while start < bytes.len() {
            if result.len() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let end = memchr(b'&', &bytes[start..])
                .map(|pos| start + pos)
                .unwrap_or(bytes.len());
            let split = memchr(b'=', &bytes[start..end])
                .map(|pos| start + pos)
                .unwrap_or(end);

            let key = &data[start..split];
            let value = match split < end {
                true => &data[split + 1..end],
                false => "",
            };

            result.push((key.to_owned(), value.to_owned()));
            start = end + 1;
        }

        Ok(())
    }
}

/// Error types that can occur during query parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// More parameters than the limit passed to the parser.
    OverLimit(usize),

    /// The input is empty. A lone `?`/`#` marker is not an error and yields no pairs.
    Empty,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Empty => {
                write!(f, "Query string is empty or contains no parameters")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn basic() {
        let cases = ["a=1&b=2", "?a=1&b=2", "#a=1&b=2"];

        for line in cases {
            let params = Query::parse(line, 8).unwrap();

            assert_eq!(params.len(), 2);
            assert_eq!(pair(&params[0]), ("a", "1"));
            assert_eq!(pair(&params[1]), ("b", "2"));
        }
    }

    #[test]
    fn full() {
        let params = Query::parse("flag&empty=&=val&&key=value&key=again", 10).unwrap();

        #[rustfmt::skip]
        let expected = [
            ("flag", ""),
            ("empty", ""),
            ("", "val"),
            ("", ""),
            ("key", "value"),
            ("key", "again"),
        ];

        assert_eq!(params.len(), expected.len());
        for (param, expected) in params.iter().zip(expected) {
            assert_eq!(pair(param), expected);
        }
    }

    #[test]
    fn appends() {
        let mut params = Vec::new();
        Query::parse_into(&mut params, "a=1", 10).unwrap();
        Query::parse_into(&mut params, "#b=2", 10).unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(pair(&params[1]), ("b", "2"));
    }

    #[test]
    fn errors() {
        assert_eq!(Query::parse("a&a", 1), Err(Error::OverLimit(1)));
        assert_eq!(Query::parse("", 10), Err(Error::Empty));
        assert_eq!(Query::parse("?", 10), Ok(Vec::new()));
    }
}
