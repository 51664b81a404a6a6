//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::{Headers, Request, StatusCode};
use crate::realtime::WebSocket;
use crate::security::CorsConfig;

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use evserve::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
    upgrade: Option<Arc<WebSocket>>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
            upgrade: None,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a header in-place, replacing any existing values.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns the body bytes.
    pub fn content(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the body in-place.
    pub fn set_content(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Attaches the WebSocket produced by a successful handshake. The engine
    /// switches the connection to frame mode after writing this response.
    #[must_use]
    pub(crate) fn with_upgrade(mut self, socket: Arc<WebSocket>) -> Self {
        self.upgrade = Some(socket);
        self
    }

    /// Returns the attached WebSocket, if this is a successful upgrade response.
    pub fn upgrade(&self) -> Option<&Arc<WebSocket>> {
        self.upgrade.as_ref()
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<Arc<WebSocket>> {
        self.upgrade.take()
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Headers are written in the order they were added. Automatically adds:
    /// - `Content-Length: <n>` when absent, for non-empty bodies and for every
    ///   status that permits a body.
    /// - `Connection: keep-alive` or `Connection: close` when absent.
    pub fn into_bytes(self) -> BytesMut {
        self.serialize(true)
    }

    /// Serializes the response for a `HEAD` request: identical headers
    /// (including the `Content-Length` of the body that would have been sent),
    /// no body.
    pub fn into_head_bytes(self) -> BytesMut {
        self.serialize(false)
    }

    fn serialize(mut self, include_body: bool) -> BytesMut {
        let content_length = self.body.len();

        if !self.headers.contains("content-length")
            && (content_length > 0 || self.status.permits_body())
        {
            self.headers
                .insert("Content-Length", content_length.to_string());
        }

        if !self.headers.contains("connection") {
            let connection = if self.keep_alive {
                "keep-alive"
            } else {
                "close"
            };
            self.headers.insert("Connection", connection);
        }

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if include_body && !self.body.is_empty() {
            buf.put(self.body.as_slice());
        }

        buf
    }
}

// ── Helper constructors ───────────────────────────────────────────────────────

impl Response {
    /// `200 OK` with a JSON body. Falls back to a `500` if `value` cannot be
    /// serialized.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        Self::json_with_status(StatusCode::Ok, value)
    }

    /// JSON body with an explicit status.
    pub fn json_with_status<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError)
                    .header("Content-Type", "application/json")
                    .body(r#"{"error":"failed to serialize response"}"#)
            }
        }
    }

    /// `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// `200 OK` with a `text/html` body.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(body)
    }

    /// `200 OK` carrying raw file bytes with an explicit content type.
    pub fn file(bytes: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self::new(StatusCode::Ok)
            .header("Content-Type", content_type)
            .body_bytes(bytes)
    }

    /// A redirect to `location`. `status` should be a 3xx code.
    pub fn redirect(location: &str, status: StatusCode) -> Self {
        Self::new(status).header("Location", location)
    }

    fn plain(status: StatusCode, body: &str) -> Self {
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    pub fn bad_request() -> Self {
        Self::plain(StatusCode::BadRequest, "Bad Request")
    }

    /// `401` with a `WWW-Authenticate: Basic realm="<realm>"` challenge.
    pub fn unauthorized(realm: &str) -> Self {
        Self::plain(StatusCode::Unauthorized, "Unauthorized")
            .header("WWW-Authenticate", format!("Basic realm=\"{realm}\""))
    }

    pub fn forbidden() -> Self {
        Self::plain(StatusCode::Forbidden, "Forbidden")
    }

    pub fn not_found() -> Self {
        Self::plain(StatusCode::NotFound, "Not Found")
    }

    /// `405` listing the methods the path does support.
    pub fn method_not_allowed(allow: &[&str]) -> Self {
        Self::plain(StatusCode::MethodNotAllowed, "Method Not Allowed")
            .header("Allow", allow.join(", "))
    }

    pub fn request_timeout() -> Self {
        Self::plain(StatusCode::RequestTimeout, "Request Timeout")
    }

    pub fn payload_too_large() -> Self {
        Self::plain(StatusCode::PayloadTooLarge, "Payload Too Large")
    }

    /// `429` with a `Retry-After` hint in whole seconds.
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        Self::plain(StatusCode::TooManyRequests, "Too Many Requests")
            .header("Retry-After", retry_after_secs.to_string())
    }

    pub fn internal_error() -> Self {
        Self::plain(StatusCode::InternalServerError, "Internal Server Error")
    }

    pub fn not_implemented() -> Self {
        Self::plain(StatusCode::NotImplemented, "Not Implemented")
    }

    pub fn service_unavailable() -> Self {
        Self::plain(StatusCode::ServiceUnavailable, "Service Unavailable")
    }

    /// `204 No Content` answering a CORS preflight for `request`.
    ///
    /// `Access-Control-Allow-Origin` is the request's `Origin` when it is on
    /// the allow-list (or when the allow-list is `*`); otherwise the header is
    /// omitted and the browser will fail the preflight.
    pub fn cors_preflight(request: &Request, config: &CorsConfig) -> Self {
        let mut response = Self::new(StatusCode::NoContent);
        if let Some(origin) = request
            .header("origin")
            .and_then(|origin| config.allowed_origin(origin))
        {
            response.add_header("Access-Control-Allow-Origin", origin);
            response.add_header("Vary", "Origin");
        }
        response.add_header("Access-Control-Allow-Methods", config.methods_header());
        response.add_header("Access-Control-Allow-Headers", config.headers_header());
        response.add_header("Access-Control-Max-Age", config.max_age_secs().to_string());
        if config.allows_credentials() {
            response.add_header("Access-Control-Allow-Credentials", "true");
        }
        response
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn headers_written_in_order() {
        let r = Response::new(StatusCode::Ok)
            .header("X-First", "1")
            .header("X-Second", "2")
            .body("ok");
        let s = to_string(r.into_bytes());
        let first = s.find("X-First").unwrap();
        let second = s.find("X-Second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn explicit_length_and_connection_not_duplicated() {
        let r = Response::new(StatusCode::Ok)
            .header("Content-Length", "2")
            .header("Connection", "Upgrade")
            .body("ok");
        let s = to_string(r.into_bytes());
        assert_eq!(s.matches("Content-Length").count(), 1);
        assert_eq!(s.matches("Connection").count(), 1);
        assert!(s.contains("Connection: Upgrade\r\n"));
    }

    #[test]
    fn no_body_statuses_have_no_length() {
        let s = to_string(Response::new(StatusCode::NoContent).into_bytes());
        assert!(!s.contains("Content-Length"));
        assert!(!s.contains("Content-Type"));

        let s = to_string(Response::new(StatusCode::SwitchingProtocols).into_bytes());
        assert!(!s.contains("Content-Length"));
    }

    #[test]
    fn empty_ok_has_zero_length() {
        let s = to_string(Response::new(StatusCode::Ok).into_bytes());
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn head_bytes_omit_body() {
        let s = to_string(Response::text("hello").into_head_bytes());
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn json_helper() {
        let r = Response::json(&serde_json::json!({ "ok": true }));
        assert_eq!(r.headers().get("content-type"), Some("application/json"));
        assert_eq!(r.content(), br#"{"ok":true}"#);
    }

    #[test]
    fn json_failure_degrades_to_500() {
        use std::collections::HashMap;
        // Non-string map keys cannot be serialized as JSON object keys.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let r = Response::json(&bad);
        assert_eq!(r.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn redirect_and_status_helpers() {
        let r = Response::redirect("/login", StatusCode::Found);
        assert_eq!(r.headers().get("location"), Some("/login"));

        let r = Response::unauthorized("Restricted");
        assert_eq!(
            r.headers().get("www-authenticate"),
            Some("Basic realm=\"Restricted\"")
        );

        let r = Response::method_not_allowed(&["GET", "POST"]);
        assert_eq!(r.headers().get("allow"), Some("GET, POST"));

        let r = Response::too_many_requests(3);
        assert_eq!(r.headers().get("retry-after"), Some("3"));

        let r = Response::file(vec![0x89, b'P', b'N', b'G'], "image/png");
        assert_eq!(r.content().len(), 4);
    }

    #[test]
    fn not_found() {
        let r = Response::not_found();
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn cors_preflight_reflects_wildcard_origin() {
        let raw = b"OPTIONS /api HTTP/1.1\r\nOrigin: https://app.example\r\nAccess-Control-Request-Method: PUT\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        let config = CorsConfig::default().max_age(600);
        let r = Response::cors_preflight(&req, &config);
        assert_eq!(r.status(), StatusCode::NoContent);
        assert_eq!(
            r.headers().get("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert_eq!(r.headers().get("access-control-max-age"), Some("600"));
    }

    #[test]
    fn cors_preflight_rejects_unlisted_origin() {
        let raw = b"OPTIONS /api HTTP/1.1\r\nOrigin: https://evil.example\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        let config = CorsConfig::default().allow_origin("https://app.example");
        let r = Response::cors_preflight(&req, &config);
        assert!(r.headers().get("access-control-allow-origin").is_none());
    }
}
