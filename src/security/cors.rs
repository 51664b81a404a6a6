use std::sync::Arc;

use serde::Deserialize;

use crate::{
    Method, Response,
    context::Context,
    middleware::{BoxResponseFuture, Middleware, Next},
};

/// Cross-origin policy shared by [`CorsMiddleware`] and
/// [`Response::cors_preflight`].
///
/// The defaults are:
///
/// | Setting          | Default value                                  |
/// |------------------|------------------------------------------------|
/// | Allowed origins  | `*` (all origins)                              |
/// | Allowed methods  | `GET`, `POST`, `PUT`, `PATCH`, `DELETE`        |
/// | Allowed headers  | `Content-Type`, `Authorization`                |
/// | Max age          | 3600 seconds                                   |
/// | Credentials      | not allowed                                    |
///
/// Because browsers reject `Access-Control-Allow-Origin: *` on credentialed
/// requests, a permitted origin is always echoed back verbatim.
///
/// The struct deserializes from configuration with the same defaults:
///
/// ```toml
/// allowed_origins = ["https://app.example.com"]
/// max_age = 600
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u64,
    allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE"]
                .map(String::from)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            max_age: 3600,
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    /// Adds an allowed origin. The first explicit origin replaces the default
    /// wildcard; passing `"*"` goes back to allowing every origin.
    ///
    /// ```rust
    /// use evserve::security::CorsConfig;
    ///
    /// let cors = CorsConfig::default()
    ///     .allow_origin("https://app.example.com")
    ///     .allow_origin("https://staging.example.com");
    /// assert!(cors.allowed_origin("https://app.example.com").is_some());
    /// assert!(cors.allowed_origin("https://evil.example.com").is_none());
    /// ```
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin == "*" {
            self.allowed_origins = vec![origin];
            return self;
        }
        self.allowed_origins.retain(|o| o != "*");
        self.allowed_origins.push(origin);
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in
    /// `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in
    /// `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// How long browsers may cache a preflight answer.
    #[must_use]
    pub fn max_age(mut self, secs: u64) -> Self {
        self.max_age = secs;
        self
    }

    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    /// Returns `origin` if the policy permits it.
    pub fn allowed_origin<'a>(&self, origin: &'a str) -> Option<&'a str> {
        self.allowed_origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin))
            .then_some(origin)
    }

    pub fn methods_header(&self) -> String {
        self.allowed_methods.join(", ")
    }

    pub fn headers_header(&self) -> String {
        self.allowed_headers.join(", ")
    }

    pub fn max_age_secs(&self) -> u64 {
        self.max_age
    }

    pub fn allows_credentials(&self) -> bool {
        self.allow_credentials
    }
}

/// CORS middleware: validates the `Origin` header, handles preflight requests,
/// and injects `Access-Control-*` headers on actual responses.
///
/// # Behavior
///
/// - If no `Origin` header is present the request passes through unmodified.
/// - `OPTIONS` requests carrying `Access-Control-Request-Method` are preflights:
///   they are answered with [`Response::cors_preflight`] and the downstream
///   handler is **not** called. A disallowed origin still gets the `204`, just
///   without `Access-Control-Allow-Origin`, so the browser refuses.
/// - For all other requests the handler runs normally; if the origin is allowed,
///   `Access-Control-Allow-Origin` (and `Vary: Origin`) are appended.
///
/// # Examples
///
/// ```rust,no_run
/// use evserve::security::{CorsConfig, CorsMiddleware};
///
/// let cors = CorsMiddleware::new(
///     CorsConfig::default()
///         .allow_origin("https://example.com")
///         .allow_method("OPTIONS")
///         .allow_header("X-Custom-Header"),
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct CorsMiddleware {
    config: Arc<CorsConfig>,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            let request = ctx.request();
            let Some(origin) = request.header("origin").map(str::to_owned) else {
                return next.run(ctx).await;
            };

            let is_preflight = request.method() == &Method::Options
                && request.headers().contains("access-control-request-method");
            if is_preflight {
                return Response::cors_preflight(request, &config);
            }

            let mut response = next.run(ctx).await;
            if let Some(allowed) = config.allowed_origin(&origin) {
                response.add_header("Access-Control-Allow-Origin", allowed);
                response.add_header("Vary", "Origin");
                if config.allows_credentials() {
                    response.add_header("Access-Control-Allow-Credentials", "true");
                }
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{ok_handler, request, run};

    fn cors(config: CorsConfig) -> crate::middleware::MiddlewareHandler {
        from_middleware(Arc::new(CorsMiddleware::new(config)))
    }

    #[test]
    fn explicit_origin_replaces_wildcard() {
        let config = CorsConfig::default().allow_origin("https://a.example");
        assert_eq!(config.allowed_origin("https://a.example"), Some("https://a.example"));
        assert_eq!(config.allowed_origin("https://b.example"), None);

        let config = config.allow_origin("*");
        assert!(config.allowed_origin("https://b.example").is_some());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: CorsConfig =
            serde_json::from_str(r#"{"allowed_origins":["https://a.example"],"max_age":60}"#)
                .unwrap();
        assert_eq!(config.max_age_secs(), 60);
        assert_eq!(config.headers_header(), "Content-Type, Authorization");
        assert!(config.allowed_origin("https://b.example").is_none());
    }

    #[tokio::test]
    async fn no_origin_passes_through() {
        let res = run(
            vec![cors(CorsConfig::default())],
            ok_handler(),
            request("GET / HTTP/1.1\r\n\r\n"),
        )
        .await;
        assert!(res.headers().get("access-control-allow-origin").is_none());
        assert_eq!(res.content(), b"ok");
    }

    #[tokio::test]
    async fn preflight_short_circuits() {
        let ctx = request(
            "OPTIONS /api HTTP/1.1\r\nOrigin: https://a.example\r\n\
             Access-Control-Request-Method: PUT\r\n\r\n",
        );
        let res = run(vec![cors(CorsConfig::default())], ok_handler(), ctx).await;
        assert_eq!(res.status(), StatusCode::NoContent);
        assert_eq!(
            res.headers().get("access-control-allow-methods"),
            Some("GET, POST, PUT, PATCH, DELETE")
        );
        assert!(res.content().is_empty());
    }

    #[tokio::test]
    async fn actual_request_gets_origin_echoed() {
        let config = CorsConfig::default()
            .allow_origin("https://a.example")
            .allow_credentials(true);
        let ctx = request("GET /api HTTP/1.1\r\nOrigin: https://a.example\r\n\r\n");
        let res = run(vec![cors(config)], ok_handler(), ctx).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://a.example")
        );
        assert_eq!(res.headers().get("vary"), Some("Origin"));
        assert_eq!(res.headers().get("access-control-allow-credentials"), Some("true"));
    }

    #[tokio::test]
    async fn disallowed_origin_gets_no_cors_headers() {
        let config = CorsConfig::default().allow_origin("https://a.example");
        let ctx = request("GET /api HTTP/1.1\r\nOrigin: https://evil.example\r\n\r\n");
        let res = run(vec![cors(config)], ok_handler(), ctx).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert!(res.headers().get("access-control-allow-origin").is_none());
    }
}
