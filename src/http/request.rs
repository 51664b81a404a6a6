//! HTTP/1.1 request parsing.
//!
//! The request line is split by hand so that a missing protocol version can
//! default to `HTTP/1.1`; the header block is handed to [`httparse`].

use std::net::{Ipv4Addr, SocketAddr};
use std::time::SystemTime;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method, StatusCode};
use crate::context::PathParams;
use crate::server::ConnHandle;

/// Errors that can occur while parsing an HTTP/1.1 request.
///
/// Everything except [`ParseError::Incomplete`] means the bytes can never form
/// a valid request; the connection should be answered with
/// [`ParseError::status`] and closed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("missing request line")]
    MissingRequestLine,

    #[error("malformed request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid method token: {0:?}")]
    InvalidMethod(String),

    #[error("unsupported protocol version: {0:?}")]
    InvalidVersion(String),

    #[error("malformed header block: {0}")]
    InvalidHeader(#[from] httparse::Error),

    #[error("too many headers (limit {max})")]
    TooManyHeaders { max: usize },

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("Transfer-Encoding is not supported")]
    UnsupportedTransferEncoding,

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
}

impl ParseError {
    /// The status code a server should answer this error with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge { .. } => StatusCode::PayloadTooLarge,
            Self::TooManyHeaders { .. } => StatusCode::RequestHeaderFieldsTooLarge,
            Self::UnsupportedTransferEncoding => StatusCode::NotImplemented,
            _ => StatusCode::BadRequest,
        }
    }

    /// Returns `true` for every error other than [`ParseError::Incomplete`].
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::Incomplete)
    }
}

/// Limits applied while parsing a request.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    /// Maximum number of header lines.
    pub max_headers: usize,
    /// Maximum declared `Content-Length`.
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_headers: 64,
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

/// Credentials decoded from an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Decoded query string: keys in first-seen order, each with every value it
/// was given.
///
/// # Examples
///
/// ```
/// use evserve::http::QueryParams;
///
/// let q = QueryParams::parse("tag=a&page=2&tag=b+c");
/// assert_eq!(q.get("page"), Some("2"));
/// assert_eq!(q.get_all("tag"), &["a".to_owned(), "b c".to_owned()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, Vec<String>)>,
}

impl QueryParams {
    /// Parses a raw query string with `application/x-www-form-urlencoded` rules.
    pub fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.push(key.into_owned(), value.into_owned());
        }
        params
    }

    fn push(&mut self, key: String, value: String) {
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.pairs.push((key, vec![value])),
        }
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// Returns every value for `key`, in order of appearance.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Iterates over `(key, values)` in first-seen key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. The body is stored
/// as a [`Bytes`] buffer. Header names are stored lower-cased.
///
/// # Examples
///
/// ```
/// use evserve::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, consumed) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// assert_eq!(consumed, raw.len());
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    raw_query: Option<String>,
    query: QueryParams,
    host: Option<String>,
    cookies: Vec<(String, String)>,
    basic_auth: Option<BasicCredentials>,
    body: Bytes,
    params: PathParams,
    remote_addr: SocketAddr,
    received_at: SystemTime,
    connection: Option<ConnHandle>,
}

impl Request {
    /// Parse one request from the front of `buf` using [`ParseLimits::default`].
    ///
    /// Returns the parsed `Request` and the number of bytes it occupied, so a
    /// caller holding pipelined data can advance past it.
    ///
    /// # Errors
    ///
    /// - [`ParseError::Incomplete`]: the header terminator or the declared body
    ///   has not arrived yet; buffer more bytes and retry.
    /// - any other variant: the data is malformed (see [`ParseError::status`]).
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        Self::parse_with(buf, &ParseLimits::default())
    }

    /// Parse one request from the front of `buf` under explicit limits.
    pub fn parse_with(buf: &[u8], limits: &ParseLimits) -> Result<(Self, usize), ParseError> {
        let (head_end, body_start) = find_boundary(buf).ok_or(ParseError::Incomplete)?;

        // RFC 9112 §2.2: ignore empty lines preceding the request line.
        let mut line_start = 0;
        while line_start < head_end && matches!(buf[line_start], b'\r' | b'\n') {
            line_start += 1;
        }
        if line_start >= head_end {
            return Err(ParseError::MissingRequestLine);
        }

        let line_end = buf[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| line_start + p)
            .unwrap_or(head_end);
        let line = std::str::from_utf8(&buf[line_start..line_end.min(head_end)])
            .map_err(|_| ParseError::InvalidRequestLine("<non-UTF-8>".to_owned()))?
            .trim_end_matches('\r');

        let mut tokens = line.split_whitespace();
        let method_token = tokens.next().ok_or(ParseError::MissingRequestLine)?;
        let target = tokens
            .next()
            .ok_or_else(|| ParseError::InvalidRequestLine(line.to_owned()))?;
        let version = parse_version(tokens.next().unwrap_or("HTTP/1.1"))?;
        if tokens.next().is_some() {
            return Err(ParseError::InvalidRequestLine(line.to_owned()));
        }

        if !Method::is_valid_token(method_token) {
            return Err(ParseError::InvalidMethod(method_token.to_owned()));
        }
        let Ok(method) = method_token.parse::<Method>();

        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        let query = raw_query.as_deref().map(QueryParams::parse).unwrap_or_default();

        let headers = parse_header_block(&buf[(line_end + 1).min(body_start)..body_start], limits)?;

        if headers.contains("transfer-encoding") {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        let content_length = match headers.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?,
            None => 0,
        };
        if content_length > limits.max_body_size {
            return Err(ParseError::BodyTooLarge {
                max_bytes: limits.max_body_size,
            });
        }
        let consumed = body_start
            .checked_add(content_length)
            .ok_or(ParseError::InvalidContentLength)?;
        if buf.len() < consumed {
            return Err(ParseError::Incomplete);
        }

        let host = headers.get("host").map(str::to_owned);
        let cookies = headers
            .get_all("cookie")
            .flat_map(parse_cookies)
            .collect();
        let basic_auth = headers.get("authorization").and_then(parse_basic_auth);

        Ok((
            Self {
                method,
                path,
                version,
                headers,
                raw_query,
                query,
                host,
                cookies,
                basic_auth,
                body: Bytes::copy_from_slice(&buf[body_start..consumed]),
                params: PathParams::new(),
                remote_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                received_at: SystemTime::now(),
                connection: None,
            },
            consumed,
        ))
    }

    /// Binds this request to the connection it arrived on, taking the remote
    /// address from the connection handle.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnHandle) -> Self {
        self.remote_addr = connection.remote_addr();
        self.connection = Some(connection);
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Replaces the method (used by method-override middleware).
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replaces the path (used by path-normalizing middleware).
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the first value of header `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Returns the decoded query parameters.
    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    /// Returns the first decoded value of query parameter `key`.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key)
    }

    /// Returns the `Host` header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Returns all cookies in header order.
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// Returns the value of cookie `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns decoded Basic credentials, if the request carried any.
    pub fn basic_auth(&self) -> Option<&BasicCredentials> {
        self.basic_auth.as_ref()
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the path parameters bound by the router.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Returns the path parameter `name`, if bound.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub(crate) fn params_mut(&mut self) -> &mut PathParams {
        &mut self.params
    }

    /// Returns the peer address (`0.0.0.0:0` for a request never bound to a
    /// connection).
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Overrides the peer address (used by trusted-proxy middleware).
    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = addr;
    }

    /// Returns the time the request finished parsing.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Returns the connection the request arrived on.
    pub fn connection(&self) -> Option<&ConnHandle> {
        self.connection.as_ref()
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) if has_token(conn, "close") => false,
            Some(conn) if has_token(conn, "keep-alive") => true,
            _ => self.version == 1,
        }
    }

    /// Returns `true` if this request asks for a WebSocket upgrade.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .is_some_and(|v| has_token(v, "websocket"))
            && self
                .headers
                .get("connection")
                .is_some_and(|v| has_token(v, "upgrade"))
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

/// Returns `true` if the comma-separated header `value` contains `token`
/// (case-insensitive).
pub(crate) fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Locates the end of the header section.
///
/// Returns `(head_end, body_start)`: the index where the terminating blank line
/// begins and the index just past it. Whichever of `\r\n\r\n` and a bare
/// `\n\n` comes first ends the head, so a lenient request pipelined ahead of
/// a CRLF one is not merged into it.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|pos| {
        let rest = &buf[pos..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((pos, pos + 4))
        } else if rest.starts_with(b"\n\n") {
            Some((pos, pos + 2))
        } else {
            None
        }
    })
}

fn parse_version(token: &str) -> Result<u8, ParseError> {
    match token {
        "HTTP/1.1" => Ok(1),
        "HTTP/1.0" => Ok(0),
        other => Err(ParseError::InvalidVersion(other.to_owned())),
    }
}

fn parse_header_block(block: &[u8], limits: &ParseLimits) -> Result<Headers, ParseError> {
    let mut raw = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let parsed = match httparse::parse_headers(block, &mut raw) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        // The block always ends with the blank line found by `find_boundary`.
        Ok(httparse::Status::Partial) => return Err(ParseError::InvalidHeader(httparse::Error::Token)),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(ParseError::TooManyHeaders {
                max: limits.max_headers,
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut headers = Headers::with_capacity(parsed.len());
    for header in parsed.iter() {
        let value = String::from_utf8_lossy(header.value);
        headers.insert(header.name.to_ascii_lowercase(), value.trim());
    }
    Ok(headers)
}

fn parse_cookies(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_owned(), value.trim().trim_matches('"').to_owned()))
    })
}

fn parse_basic_auth(header: &str) -> Option<BasicCredentials> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}
