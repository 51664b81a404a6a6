//! Broadcast chat: every message a client sends is relayed to all clients.
//!
//! ```text
//! cargo run --example chat
//! ```
//!
//! Set `EVSERVE_CONFIG` to a TOML file to override engine settings.

use std::sync::{Arc, Weak};
use std::time::Duration;

use evserve::middleware::{
    CompressionMiddleware, HeadersMiddleware, LoggerMiddleware, RecoveryMiddleware,
    from_middleware,
};
use evserve::realtime::{Hub, Message, Upgrader, WebSocket};
use evserve::security::{RateLimitMiddleware, RateLimiter};
use evserve::{Context, Engine, EngineConfig, Response, Router, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PAGE: &str = r#"<!doctype html>
<title>evserve chat</title>
<ul id="log"></ul>
<input id="msg" autofocus>
<script>
  const ws = new WebSocket(`ws://${location.host}/ws`, "chat");
  ws.onmessage = (e) => {
    const li = document.createElement("li");
    li.textContent = e.data;
    document.getElementById("log").append(li);
  };
  document.getElementById("msg").onkeydown = (e) => {
    if (e.key === "Enter") { ws.send(e.target.value); e.target.value = ""; }
  };
</script>
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evserve=debug,chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("EVSERVE_CONFIG") {
        Ok(path) => EngineConfig::from_file(path)?,
        Err(_) => EngineConfig::default(),
    };

    let hub = Hub::spawn();
    let limiter = Arc::new(RateLimiter::new(120, Duration::from_secs(60)));
    let _cleanup = limiter.spawn_cleanup(Duration::from_secs(30));

    let relay = hub.clone();
    let upgrader = Upgrader::with_config(&config.websocket)
        .subprotocols(["chat"])
        .on_message(move |ws: &Arc<WebSocket>, msg: Message| {
            if let Message::Text(text) = msg {
                let line = format!("{}: {text}", ws.remote_addr());
                if let Err(e) = relay.broadcast_text(line) {
                    tracing::warn!(error = %e, "relay failed");
                }
            }
        })
        .on_close(|ws, _frame| tracing::info!(socket = %ws.id(), "client left"));

    let mut router = Router::new();
    router.use_middleware(from_middleware(Arc::new(LoggerMiddleware)));
    router.use_middleware(from_middleware(Arc::new(RecoveryMiddleware)));
    router.use_middleware(from_middleware(Arc::new(HeadersMiddleware::security())));
    router.use_middleware(from_middleware(Arc::new(CompressionMiddleware::new())));
    router.use_middleware(from_middleware(Arc::new(RateLimitMiddleware::new(limiter))));
    router.get("/", |_ctx| async { Response::html(PAGE) });
    router.websocket("/ws", upgrader);

    let shutdown_timeout = config.shutdown_timeout();
    let engine = Arc::new(Engine::new(router, config).with_hub(hub.clone()));

    let stats_engine: Weak<Engine> = Arc::downgrade(&engine);
    let stats_hub = hub.clone();
    engine.update_routes(move |router| {
        router.get("/stats", move |_ctx: Context| {
            let engine = stats_engine.clone();
            let hub = stats_hub.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return Response::service_unavailable();
                };
                let sockets = hub.len().await.unwrap_or_default();
                Response::json(&serde_json::json!({
                    "active_connections": engine.active_connections(),
                    "total_requests": engine.total_requests(),
                    "websockets": sockets,
                }))
            }
        });
    });

    let server = Server::bind("127.0.0.1:8080").await?;
    tracing::info!(address = %server.local_addr(), "chat demo ready");
    server
        .run_until(Arc::clone(&engine), async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    engine.shutdown(shutdown_timeout).await?;
    Ok(())
}
