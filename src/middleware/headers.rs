use std::sync::Arc;

use super::{BoxResponseFuture, Middleware, Next};
use crate::context::Context;

/// Adds a fixed set of headers to every response.
///
/// Headers the handler already set are left alone, so a route can override
/// a default (for example a looser `Content-Security-Policy` on one page).
///
/// ```rust,no_run
/// use evserve::middleware::HeadersMiddleware;
///
/// let headers = HeadersMiddleware::security().header("X-Served-By", "edge-1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeadersMiddleware {
    headers: Arc<Vec<(String, String)>>,
}

impl HeadersMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conservative browser-hardening headers.
    pub fn security() -> Self {
        Self::new()
            .header("X-Content-Type-Options", "nosniff")
            .header("X-Frame-Options", "DENY")
            .header("X-XSS-Protection", "0")
            .header("Referrer-Policy", "strict-origin-when-cross-origin")
            .header("Strict-Transport-Security", "max-age=31536000; includeSubDomains")
            .header("Content-Security-Policy", "default-src 'self'")
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.headers).push((name.into(), value.into()));
        self
    }
}

impl Middleware for HeadersMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let headers = Arc::clone(&self.headers);
        Box::pin(async move {
            let mut response = next.run(ctx).await;
            for (name, value) in headers.iter() {
                if !response.headers().contains(name) {
                    response.add_header(name.as_str(), value.as_str());
                }
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Response;
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{get, ok_handler, run};
    use crate::router::Handler;

    #[tokio::test]
    async fn security_preset_is_applied() {
        let mw = from_middleware(Arc::new(HeadersMiddleware::security()));
        let res = run(vec![mw], ok_handler(), get("/")).await;
        assert_eq!(res.headers().get("x-content-type-options"), Some("nosniff"));
        assert_eq!(res.headers().get("x-frame-options"), Some("DENY"));
        assert!(res.headers().contains("content-security-policy"));
    }

    #[tokio::test]
    async fn handler_headers_win() {
        let handler: Handler = Arc::new(|_ctx| {
            Box::pin(async { Response::text("framed").header("X-Frame-Options", "SAMEORIGIN") })
        });
        let mw = from_middleware(Arc::new(HeadersMiddleware::security().header("X-Extra", "1")));
        let res = run(vec![mw], handler, get("/")).await;
        assert_eq!(res.headers().get_all("x-frame-options").count(), 1);
        assert_eq!(res.headers().get("x-frame-options"), Some("SAMEORIGIN"));
        assert_eq!(res.headers().get("x-extra"), Some("1"));
    }
}
