use std::io::Write;

use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};

use super::{BoxResponseFuture, Middleware, Next};
use crate::{Response, context::Context, http::request::has_token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Compresses response bodies with gzip or deflate according to the
/// request's `Accept-Encoding`.
///
/// A response is left untouched when its status carries no body (1xx, 204,
/// 304) or its body is empty, when it already carries `Content-Encoding`,
/// when its body is shorter than [`min_size`](Self::min_size), or when its
/// `Content-Type` is a format that is already compressed (images, audio,
/// video, archives).
pub struct CompressionMiddleware {
    min_size: usize,
    level: Compression,
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionMiddleware {
    pub fn new() -> Self {
        Self {
            min_size: 1024,
            level: Compression::default(),
        }
    }

    /// Bodies shorter than `bytes` are sent uncompressed. Defaults to 1 KiB.
    #[must_use]
    pub fn min_size(mut self, bytes: usize) -> Self {
        self.min_size = bytes;
        self
    }

    /// Compression level from 0 (none) to 9 (best).
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl Middleware for CompressionMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let min_size = self.min_size;
        let level = self.level;
        Box::pin(async move {
            let encoding = ctx
                .request()
                .header("accept-encoding")
                .and_then(negotiate);

            let mut response = next.run(ctx).await;
            let Some(encoding) = encoding else {
                return response;
            };
            if !response.status().permits_body()
                || response.content().is_empty()
                || response.content().len() < min_size
                || response.headers().contains("content-encoding")
                || response
                    .headers()
                    .get("content-type")
                    .is_some_and(is_precompressed)
            {
                return response;
            }

            match encode(encoding, level, response.content()) {
                Ok(compressed) => {
                    response.set_header("Content-Encoding", encoding.as_str());
                    response.add_header("Vary", "Accept-Encoding");
                    if response.headers().contains("content-length") {
                        response.set_header("Content-Length", compressed.len().to_string());
                    }
                    response.set_content(compressed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, encoding = encoding.as_str(), "compression failed");
                }
            }
            response
        })
    }
}

/// Picks gzip over deflate; a coding listed with `q=0` is refused.
fn negotiate(accept: &str) -> Option<Encoding> {
    let mut deflate = false;
    for item in accept.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim();
        let refused = parts.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            continue;
        }
        if coding.eq_ignore_ascii_case("gzip") || coding == "*" {
            return Some(Encoding::Gzip);
        }
        if coding.eq_ignore_ascii_case("deflate") {
            deflate = true;
        }
    }
    deflate.then_some(Encoding::Deflate)
}

fn is_precompressed(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if mime == "image/svg+xml" {
        return false;
    }
    mime.starts_with("image/")
        || mime.starts_with("video/")
        || mime.starts_with("audio/")
        || has_token(
            "application/zip, application/gzip, application/x-gzip, application/zstd, \
             application/x-7z-compressed, application/x-rar-compressed, font/woff2",
            &mime,
        )
}

fn encode(encoding: Encoding, level: Compression, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
            encoder.write_all(body)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), level);
            encoder.write_all(body)?;
            encoder.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use flate2::read::{GzDecoder, ZlibDecoder};

    use super::*;
    use crate::middleware::from_middleware;
    use crate::middleware::test_support::{request, run, status_handler};
    use crate::router::Handler;

    fn body_handler(content_type: &'static str, len: usize) -> Handler {
        Arc::new(move |_ctx| {
            Box::pin(async move {
                Response::new(crate::StatusCode::Ok)
                    .header("Content-Type", content_type)
                    .body("a".repeat(len))
            })
        })
    }

    fn with_accept(accept: &str) -> Context {
        request(&format!(
            "GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: {accept}\r\n\r\n"
        ))
    }

    #[test]
    fn negotiation_prefers_gzip_and_honours_q_zero() {
        assert_eq!(negotiate("deflate, gzip"), Some(Encoding::Gzip));
        assert_eq!(negotiate("deflate"), Some(Encoding::Deflate));
        assert_eq!(negotiate("gzip;q=0, deflate"), Some(Encoding::Deflate));
        assert_eq!(negotiate("br"), None);
        assert_eq!(negotiate("identity"), None);
    }

    #[test]
    fn precompressed_types() {
        assert!(is_precompressed("image/png"));
        assert!(is_precompressed("application/zip"));
        assert!(!is_precompressed("image/svg+xml"));
        assert!(!is_precompressed("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn gzip_round_trips() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(10)));
        let res = run(vec![mw], body_handler("text/plain", 2000), with_accept("gzip")).await;
        assert_eq!(res.headers().get("content-encoding"), Some("gzip"));
        assert_eq!(res.headers().get("vary"), Some("Accept-Encoding"));

        let mut decoded = String::new();
        GzDecoder::new(res.content()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "a".repeat(2000));
    }

    #[tokio::test]
    async fn deflate_round_trips() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(10)));
        let res = run(vec![mw], body_handler("application/json", 500), with_accept("deflate")).await;
        assert_eq!(res.headers().get("content-encoding"), Some("deflate"));

        let mut decoded = String::new();
        ZlibDecoder::new(res.content()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded.len(), 500);
    }

    #[tokio::test]
    async fn small_or_precompressed_bodies_are_untouched() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new()));
        let res = run(vec![mw.clone()], body_handler("text/plain", 100), with_accept("gzip")).await;
        assert!(res.headers().get("content-encoding").is_none());

        let res = run(vec![mw], body_handler("image/png", 4096), with_accept("gzip")).await;
        assert!(res.headers().get("content-encoding").is_none());
        assert_eq!(res.content().len(), 4096);
    }

    #[tokio::test]
    async fn bodyless_statuses_are_never_compressed() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(0)));
        for status in [
            crate::StatusCode::SwitchingProtocols,
            crate::StatusCode::NoContent,
            crate::StatusCode::NotModified,
        ] {
            let res = run(vec![mw.clone()], status_handler(status), with_accept("gzip")).await;
            assert!(res.headers().get("content-encoding").is_none());
            assert!(res.content().is_empty());
        }
    }

    #[tokio::test]
    async fn upgrade_response_passes_through_untouched() {
        let upgrade: Handler = Arc::new(|_ctx| {
            Box::pin(async {
                Response::new(crate::StatusCode::SwitchingProtocols)
                    .header("Upgrade", "websocket")
                    .header("Connection", "Upgrade")
            })
        });
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(0)));
        let res = run(vec![mw], upgrade, with_accept("gzip, deflate")).await;
        assert!(res.content().is_empty());
        let wire = String::from_utf8(res.into_bytes().to_vec()).unwrap();
        assert!(wire.ends_with("\r\n\r\n"));
        assert!(!wire.contains("Content-Encoding"));
        assert!(!wire.contains("Content-Length"));
    }

    #[tokio::test]
    async fn empty_ok_body_is_not_compressed() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(0)));
        let res = run(vec![mw], body_handler("text/plain", 0), with_accept("gzip")).await;
        assert!(res.headers().get("content-encoding").is_none());
        assert!(res.content().is_empty());
    }

    #[tokio::test]
    async fn no_accept_encoding_means_identity() {
        let mw = from_middleware(Arc::new(CompressionMiddleware::new().min_size(0)));
        let res = run(
            vec![mw],
            body_handler("text/plain", 4096),
            request("GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
        )
        .await;
        assert!(res.headers().get("content-encoding").is_none());
    }
}
