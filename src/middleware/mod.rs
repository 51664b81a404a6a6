//! Middleware pipeline: composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] / [`from_fn`]: build a [`MiddlewareHandler`].
//! - [`chain`]: compose several middleware into one; the first is outermost.
//!
//! ## Provided middleware
//!
//! | Type | Purpose |
//! |---|---|
//! | [`LoggerMiddleware`] | structured access log |
//! | [`RecoveryMiddleware`] | handler panic → `500` |
//! | [`TimeoutMiddleware`] | deadline → `408`, cancels the request token |
//! | [`CompressionMiddleware`] | gzip / deflate response bodies |
//! | [`HeadersMiddleware`] | static header injection, security preset |
//! | [`TrustedProxyMiddleware`] | client IP from `X-Forwarded-For` |
//! | [`BodyLimitMiddleware`] | `413` above a body size |
//! | [`TrailingSlashMiddleware`] | `/a/` → `/a` before routing |
//! | [`MethodOverrideMiddleware`] | `X-HTTP-Method-Override` on `POST` |
//!
//! CORS, Basic auth and rate limiting live in [`crate::security`].

mod compress;
mod headers;
mod recovery;
mod rewrite;

pub use compress::CompressionMiddleware;
pub use headers::HeadersMiddleware;
pub use recovery::{RecoveryMiddleware, TimeoutMiddleware};
pub use rewrite::{
    BodyLimitMiddleware, MethodOverrideMiddleware, TrailingSlashMiddleware,
    TrustedProxyMiddleware,
};

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context, router::Handler};

/// Boxed future returned by every middleware.
pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// What runs once a [`Next`] has no middleware left.
enum Tail {
    /// The route handler.
    Handler(Handler),
    /// The continuation of an enclosing chain (see [`chain`]).
    Outer(Box<Next>),
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the endpoint once the chain is exhausted.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
///
/// # Examples
///
/// ```rust,no_run
/// use evserve::{Response, context::Context, middleware::{BoxResponseFuture, Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    tail: Tail,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> BoxResponseFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use evserve::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Converts an async closure into a [`MiddlewareHandler`].
///
/// ```rust,no_run
/// use evserve::middleware::from_fn;
///
/// let tag = from_fn(|ctx, next| async move {
///     let mut response = next.run(ctx).await;
///     response.add_header("X-Served-By", "evserve");
///     response
/// });
/// ```
pub fn from_fn<F, Fut>(f: F) -> MiddlewareHandler
where
    F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, next: Next| Box::pin(f(ctx, next)))
}

/// Composes `middlewares` into a single middleware. The first element is the
/// outermost layer: it sees the request first and the response last.
pub fn chain(middlewares: Vec<MiddlewareHandler>) -> MiddlewareHandler {
    let inner: Arc<[MiddlewareHandler]> = middlewares.into();
    Arc::new(move |ctx: Context, outer: Next| {
        let next = Next {
            middlewares: Arc::clone(&inner),
            index: 0,
            tail: Tail::Outer(Box::new(outer)),
        };
        next.run(ctx)
    })
}

impl Next {
    /// Creates a new `Next` positioned at the start of `middlewares`, ending in
    /// `endpoint`.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            middlewares,
            index: 0,
            tail: Tail::Handler(endpoint),
        }
    }

    /// Invokes the next middleware in the chain and returns its response future.
    ///
    /// Advances the internal cursor by one and calls the handler at the current
    /// position. Once the middleware list is exhausted the endpoint runs.
    pub fn run(mut self, ctx: Context) -> BoxResponseFuture {
        if self.index < self.middlewares.len() {
            let handler = Arc::clone(&self.middlewares[self.index]);
            self.index += 1;
            return handler(ctx, self);
        }
        match self.tail {
            Tail::Handler(endpoint) => endpoint(ctx),
            Tail::Outer(outer) => outer.run(ctx),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture;
}

/// Access-log middleware: one structured `info` event per request.
///
/// Fields: `method`, `path`, `status`, `remote`, `elapsed`.
/// `LoggerMiddleware` does not short-circuit.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();
            let remote = ctx.request().remote_addr();

            let response = next.run(ctx).await;

            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                %remote,
                elapsed = ?start.elapsed(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::context::Context;
    use crate::http::{Request, Response, StatusCode};
    use crate::router::Handler;

    use super::{MiddlewareHandler, Next};

    pub fn request(raw: &str) -> Context {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    pub fn get(path: &str) -> Context {
        request(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
    }

    pub fn ok_handler() -> Handler {
        Arc::new(|_ctx| Box::pin(async { Response::text("ok") }))
    }

    pub fn status_handler(status: StatusCode) -> Handler {
        Arc::new(move |_ctx| Box::pin(async move { Response::new(status) }))
    }

    pub async fn run(middlewares: Vec<MiddlewareHandler>, endpoint: Handler, ctx: Context) -> Response {
        Next::new(middlewares.into(), endpoint).run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::test_support::{get, ok_handler, run};
    use super::*;
    use crate::StatusCode;

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> MiddlewareHandler {
        from_fn(move |ctx, next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{name}:in"));
                let response = next.run(ctx).await;
                log.lock().unwrap().push(format!("{name}:out"));
                response
            }
        })
    }

    #[tokio::test]
    async fn empty_chain_runs_endpoint() {
        let res = run(vec![], ok_handler(), get("/")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn chain_first_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composed = chain(vec![
            recorder("a", Arc::clone(&log)),
            recorder("b", Arc::clone(&log)),
        ]);
        let outer = recorder("outer", Arc::clone(&log));
        let inner = recorder("inner", Arc::clone(&log));

        run(vec![outer, composed, inner], ok_handler(), get("/")).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:in", "a:in", "b:in", "inner:in", "inner:out", "b:out", "a:out",
                "outer:out"
            ]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let deny = from_fn(|_ctx, _next| async { Response::new(StatusCode::Forbidden) });
        let res = run(vec![deny], ok_handler(), get("/")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let logger = from_middleware(Arc::new(LoggerMiddleware));
        let res = run(vec![logger], ok_handler(), get("/logged")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.content(), b"ok");
    }
}
