//! Middleware that adjusts the request before it reaches the router.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::{BoxResponseFuture, Middleware, Next};
use crate::{Method, Response, context::Context};

/// Replaces the request's remote address with the client address reported by
/// a trusted reverse proxy.
///
/// Only peers listed with [`trust`](Self::trust) are believed. For those, the
/// leftmost address in `X-Forwarded-For` wins, then `X-Real-IP`. Unparseable
/// values are ignored and the peer address is kept.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyMiddleware {
    trusted: Arc<HashSet<IpAddr>>,
}

impl TrustedProxyMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn trust(mut self, proxy: IpAddr) -> Self {
        Arc::make_mut(&mut self.trusted).insert(proxy);
        self
    }

    fn client_ip(&self, ctx: &Context) -> Option<IpAddr> {
        let request = ctx.request();
        if !self.trusted.contains(&request.remote_addr().ip()) {
            return None;
        }
        let forwarded = request
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        forwarded.or_else(|| request.header("x-real-ip")?.trim().parse().ok())
    }
}

impl Middleware for TrustedProxyMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        if let Some(ip) = self.client_ip(&ctx) {
            let port = ctx.request().remote_addr().port();
            ctx.request_mut().set_remote_addr(SocketAddr::new(ip, port));
        }
        next.run(ctx)
    }
}

/// Rejects requests whose body exceeds `max_bytes` with `413`.
///
/// Both the declared `Content-Length` and the buffered body are checked, so
/// the limit holds regardless of how the request was framed.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimitMiddleware {
    max_bytes: usize,
}

impl BodyLimitMiddleware {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Middleware for BodyLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let request = ctx.request();
        let declared = request.content_length().unwrap_or(0);
        if declared > self.max_bytes || request.body().len() > self.max_bytes {
            tracing::debug!(
                path = request.path(),
                limit = self.max_bytes,
                declared,
                "request body over limit"
            );
            return Box::pin(async { Response::payload_too_large() });
        }
        next.run(ctx)
    }
}

/// Strips trailing slashes so `/users/` routes like `/users`. The root path
/// is left alone.
pub struct TrailingSlashMiddleware;

impl Middleware for TrailingSlashMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        let path = ctx.request().path();
        if path.len() > 1 && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/');
            let trimmed = if trimmed.is_empty() { "/" } else { trimmed }.to_owned();
            ctx.request_mut().set_path(trimmed);
        }
        next.run(ctx)
    }
}

/// Lets clients that can only send `POST` tunnel `PUT`, `PATCH` and `DELETE`
/// through the `X-HTTP-Method-Override` header.
pub struct MethodOverrideMiddleware;

impl Middleware for MethodOverrideMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        if ctx.request().method() == &Method::Post {
            let overridden = ctx
                .request()
                .header("x-http-method-override")
                .map(|v| v.trim().to_ascii_uppercase());
            if let Some(token) = overridden {
                let Ok(method) = token.parse::<Method>();
                if matches!(method, Method::Put | Method::Patch | Method::Delete) {
                    ctx.request_mut().set_method(method);
                }
            }
        }
        next.run(ctx)
    }
}
