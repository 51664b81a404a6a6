//! Fault isolation: panic recovery and handler deadlines.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use super::{BoxResponseFuture, Middleware, Next};
use crate::{Response, context::Context};

/// Converts a panic anywhere further down the chain into a `500` response.
///
/// The panic is logged at `error` with the request's method and path; the
/// connection stays usable.
pub struct RecoveryMiddleware;

impl Middleware for RecoveryMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        Box::pin(async move {
            let method = ctx.request().method().clone();
            let path = ctx.request().path().to_owned();

            // `run` calls into the next layer synchronously, so it has to
            // happen inside the guarded future.
            match AssertUnwindSafe(async move { next.run(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(response) => response,
                Err(panic) => {
                    tracing::error!(
                        %method,
                        %path,
                        panic = panic_message(panic.as_ref()),
                        "handler panicked"
                    );
                    Response::internal_error()
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Races the rest of the chain against a deadline and answers `408` when the
/// deadline wins.
///
/// On timeout the downstream future is dropped, which stops it at its next
/// `.await`, and the request's [`Context::cancellation`] token is cancelled so
/// work the handler spawned elsewhere can observe it and stop. Synchronous
/// code that blocks inside a handler cannot be interrupted and keeps its
/// thread until it returns.
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Middleware for TimeoutMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let duration = self.duration;
        Box::pin(async move {
            let token = ctx.cancellation().clone();
            let path = ctx.request().path().to_owned();
            match tokio::time::timeout(duration, next.run(ctx)).await {
                Ok(response) => response,
                Err(_) => {
                    token.cancel();
                    tracing::warn!(%path, timeout = ?duration, "handler timed out");
                    Response::request_timeout()
                }
            }
        })
    }
}
