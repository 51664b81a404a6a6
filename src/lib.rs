//! # evserve
//!
//! An embedded, event-driven HTTP/1.1 and WebSocket server core.
//!
//! Raw bytes from a connection are parsed into [`Request`]s, routed through a
//! segment-trie [`Router`] and its middleware, and answered with serialized
//! [`Response`]s. Upgrade requests become [`WebSocket`](realtime::WebSocket)s
//! that a [`Hub`](realtime::Hub) can broadcast to. The [`Engine`] ties this to
//! any reactor implementing [`server::EventHandler`]; [`server::Server`] is a
//! ready-made tokio reactor.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use evserve::{Context, Engine, EngineConfig, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/users/{id}", |ctx: Context| async move {
//!         let id = ctx.params().get("id").unwrap_or_default().to_owned();
//!         Response::text(format!("user {id}"))
//!     });
//!
//!     let engine = Arc::new(Engine::new(router, EngineConfig::default()));
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(engine).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod router;
pub mod security;
pub mod server;

pub use config::{ConfigError, EngineConfig};
pub use context::Context;
pub use engine::{Engine, EngineError};
pub use http::{Headers, Method, ParseError, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
