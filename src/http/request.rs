//! HTTP/1.1 request-head parsing using the [`httparse`] crate.
//!
//! The connection read loop parses heads with [`RequestHead::parse`] and
//! slices the body out of its own buffer once `Content-Length` bytes have
//! arrived, so a head never owns body bytes itself.

use std::str;

use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request head incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A parsed HTTP/1.1 request head: method, target, version, and headers.
///
/// # Examples
///
/// ```
/// use quiesce::http::RequestHead;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (head, offset) = RequestHead::parse(raw).unwrap();
///
/// assert_eq!(head.method().as_str(), "GET");
/// assert_eq!(head.path(), "/hello");
/// assert_eq!(head.query(), Some("name=world"));
/// assert_eq!(offset, raw.len());
/// ```
#[derive(Debug)]
pub struct RequestHead {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
}

impl RequestHead {
    /// Maximum number of headers supported per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from a byte slice.
    ///
    /// Returns the parsed head and the byte offset at which the body begins
    /// (immediately after the `\r\n\r\n` terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed for a complete head.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path, or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Request::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = raw
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap_or(Method::Get); // FromStr is infallible

        let target = raw
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match target.find('?') {
            Some(pos) => (target[..pos].to_owned(), Some(target[pos + 1..].to_owned())),
            None => (target.to_owned(), None),
        };

        let version = raw
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the HTTP minor version (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the `Content-Length` header parsed as `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method().as_str(), "GET");
        assert_eq!(head.path(), "/");
        assert_eq!(head.version(), 1);
        assert_eq!(head.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_query() {
        let raw = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.path(), "/search");
        assert_eq!(head.query(), Some("q=rust"));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            RequestHead::parse(raw),
            Err(RequestError::Incomplete)
        ));
    }

    #[test]
    fn malformed_head() {
        let raw = b"not an http request\r\n\r\n";
        assert!(matches!(
            RequestHead::parse(raw),
            Err(RequestError::Parse(_))
        ));
    }

    #[test]
    fn keep_alive_defaults() {
        let (head, _) = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(head.is_keep_alive());
        let (head, _) =
            RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.is_keep_alive());
        let (head, _) = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.is_keep_alive());
    }

    #[test]
    fn content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let (head, body_offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.content_length(), Some(5));
        assert_eq!(&raw[body_offset..], b"hello");
    }
}
