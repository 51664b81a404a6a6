//! The HTTP/WebSocket engine: an [`EventHandler`] that turns connection
//! traffic into routed requests and, after an upgrade, into WebSocket frames.
//!
//! Per connection the engine keeps a [`ConnState`] whose buffer accumulates
//! bytes until a complete request is available, so requests may arrive split
//! across any number of reads, and several pipelined requests may arrive in
//! one read. Responses are written in request order.

mod state;

pub use state::{ConnState, SUBPROTOCOL_ATTRIBUTE};

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::context::Context;
use crate::http::request::has_token;
use crate::http::{ParseError, ParseLimits};
use crate::realtime::{BufferPool, Frame, FrameError, Hub, WebSocket};
use crate::server::{Action, Conn, ConnHandle, EventHandler, TrafficFuture};
use crate::{Method, Request, Response, Router, StatusCode};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("shutdown deadline passed with {in_flight} request(s) still running")]
    ShutdownTimeout { in_flight: usize },
}

/// Serves a [`Router`] over any reactor that drives [`EventHandler`].
///
/// The route table is an immutable snapshot; [`update_routes`](Self::update_routes)
/// publishes a new one without blocking requests in progress.
pub struct Engine {
    routes: ArcSwap<Router>,
    route_writer: Mutex<()>,
    config: EngineConfig,
    limits: ParseLimits,
    hub: Option<Hub>,
    pool: BufferPool,
    active: AtomicUsize,
    total: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown: CancellationToken,
}

/// Counts one request as in flight until dropped.
struct InFlight<'a>(&'a Engine);

impl<'a> InFlight<'a> {
    fn enter(engine: &'a Engine) -> Self {
        engine.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(engine)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Engine {
    pub fn new(mut router: Router, config: EngineConfig) -> Self {
        if let Some(body) = &config.not_found_body {
            router.not_found_body(body.clone());
        }
        Self {
            routes: ArcSwap::from_pointee(router),
            route_writer: Mutex::new(()),
            limits: config.parse_limits(),
            pool: BufferPool::new(config.buffer_pool_capacity, config.initial_buffer_size),
            config,
            hub: None,
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers every upgraded socket with `hub` and unregisters it when
    /// the connection closes.
    #[must_use]
    pub fn with_hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn hub(&self) -> Option<&Hub> {
        self.hub.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Applies `update` to a copy of the current routes and publishes it.
    /// Requests already dispatched finish on the old table.
    pub fn update_routes(&self, update: impl FnOnce(&mut Router)) {
        let _writer = self.route_writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Router::clone(&self.routes.load());
        update(&mut next);
        debug!(routes = next.len(), "route table updated");
        self.routes.store(Arc::new(next));
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Requests parsed since the engine started.
    pub fn total_requests(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Requests whose handlers are still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting requests and waits up to `deadline` for in-flight
    /// ones to finish. New requests get `503`; the hub, if any, closes its
    /// sockets with `1001`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), EngineError> {
        self.shutdown.cancel();
        if let Some(hub) = &self.hub {
            if let Err(e) = hub.shutdown().await {
                debug!(error = %e, "hub already stopped");
            }
        }

        let drained = tokio::time::timeout(deadline, async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                debug!("engine drained");
                Ok(())
            }
            Err(_) => {
                let in_flight = self.in_flight();
                warn!(in_flight, "shutdown deadline passed");
                Err(EngineError::ShutdownTimeout { in_flight })
            }
        }
    }

    async fn handle_traffic(&self, conn: &mut Conn, data: &[u8]) -> Action {
        let handle = conn.handle().clone();
        if conn.context::<ConnState>().is_none() {
            conn.set_context(ConnState::new(handle.remote_addr(), self.pool.checkout()));
        }
        let Some(state) = conn.context_mut::<ConnState>() else {
            return Action::Close;
        };
        state.touch();

        if let Some(socket) = state.websocket.clone() {
            state.buffer.extend_from_slice(data);
            return self.process_frames(&socket, state);
        }

        state.buffer.extend_from_slice(data);
        loop {
            if state.buffer.is_empty() {
                return Action::Continue;
            }
            let (request, consumed) = match Request::parse_with(&state.buffer, &self.limits) {
                Ok(parsed) => parsed,
                Err(ParseError::Incomplete) => {
                    if state.buffer.len() > self.config.max_request_size {
                        warn!(
                            peer = %handle.remote_addr(),
                            buffered = state.buffer.len(),
                            "request exceeds max_request_size"
                        );
                        write_final(&handle, Response::payload_too_large());
                        return Action::Close;
                    }
                    return Action::Continue;
                }
                Err(e) => {
                    warn!(peer = %handle.remote_addr(), error = %e, "malformed request");
                    let status = e.status();
                    let response = Response::new(status)
                        .header("Content-Type", "text/plain; charset=utf-8")
                        .body(status.canonical_reason());
                    write_final(&handle, response);
                    return Action::Close;
                }
            };
            state.buffer.advance(consumed);

            if self.serve(&handle, state, request).await == Action::Close {
                return Action::Close;
            }
            if let Some(socket) = state.websocket.clone() {
                return self.process_frames(&socket, state);
            }
        }
    }

    /// Runs one request through the router and writes its response.
    async fn serve(&self, handle: &ConnHandle, state: &mut ConnState, request: Request) -> Action {
        self.total.fetch_add(1, Ordering::Relaxed);
        let is_head = *request.method() == Method::Head;
        let client_keep_alive = request.is_keep_alive();

        if self.is_shutting_down() {
            write_final(handle, Response::service_unavailable());
            return Action::Close;
        }

        let request = request.with_connection(handle.clone());
        let ctx = Context::with_cancellation(request, self.shutdown.child_token());
        let mut response = {
            let _in_flight = InFlight::enter(self);
            let router = self.routes.load_full();
            router.dispatch(ctx).await
        };

        if let Some(socket) = response.take_upgrade() {
            if response.status() == StatusCode::SwitchingProtocols {
                return self.switch_protocols(handle, state, response, socket);
            }
        }

        let keep_alive = client_keep_alive
            && response.is_keep_alive()
            && !response
                .headers()
                .get("connection")
                .is_some_and(|v| has_token(v, "close"))
            && !self.is_shutting_down();
        response.set_keep_alive(keep_alive);

        let bytes = if is_head {
            response.into_head_bytes()
        } else {
            response.into_bytes()
        };
        if handle.write(bytes.freeze()).is_err() || !keep_alive {
            return Action::Close;
        }
        Action::Continue
    }

    fn switch_protocols(
        &self,
        handle: &ConnHandle,
        state: &mut ConnState,
        response: Response,
        socket: Arc<WebSocket>,
    ) -> Action {
        if handle.write(response.into_bytes().freeze()).is_err() {
            return Action::Close;
        }
        socket.mark_handshake_complete();
        if let Some(protocol) = socket.subprotocol() {
            state.set_attribute(SUBPROTOCOL_ATTRIBUTE, protocol);
        }
        if let Some(hub) = &self.hub {
            if let Err(e) = hub.register(Arc::clone(&socket)) {
                warn!(socket = %socket.id(), error = %e, "hub registration failed");
            }
        }
        debug!(peer = %handle.remote_addr(), socket = %socket.id(), "connection switched to websocket");
        state.websocket = Some(socket);
        Action::Continue
    }

    fn process_frames(&self, socket: &Arc<WebSocket>, state: &mut ConnState) -> Action {
        loop {
            if state.buffer.is_empty() {
                return Action::Continue;
            }
            match Frame::parse_with_limit(&state.buffer, socket.read_buffer_size()) {
                Ok((frame, used)) => {
                    state.buffer.advance(used);
                    if socket.handle_frame(frame) == Action::Close {
                        return Action::Close;
                    }
                }
                Err(FrameError::Incomplete) => return Action::Continue,
                Err(e) => return socket.fail(e.close_code(), &e.to_string()),
            }
        }
    }
}

/// Writes a response that ends the connection.
fn write_final(handle: &ConnHandle, response: Response) {
    let bytes: Bytes = response.keep_alive(false).into_bytes().freeze();
    if handle.write(bytes).is_err() {
        debug!(peer = %handle.remote_addr(), "connection closed before final response");
    }
}

impl EventHandler for Engine {
    fn on_open(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        conn.set_context(ConnState::new(conn.remote_addr(), self.pool.checkout()));
        debug!(peer = %conn.remote_addr(), id = conn.id(), active, "connection opened");
        (None, Action::Continue)
    }

    fn on_traffic<'a>(&'a self, conn: &'a mut Conn, data: &'a [u8]) -> TrafficFuture<'a> {
        Box::pin(self.handle_traffic(conn, data))
    }

    fn on_close(&self, conn: &mut Conn, err: Option<&io::Error>) {
        if let Some(state) = conn.take_context::<ConnState>() {
            let ConnState {
                buffer, websocket, ..
            } = *state;
            if let Some(socket) = websocket {
                socket.notify_closed(None);
                if let Some(hub) = &self.hub {
                    if let Err(e) = hub.unregister(socket.id()) {
                        debug!(socket = %socket.id(), error = %e, "hub unregister failed");
                    }
                }
            }
            self.pool.give_back(buffer);
        }
        let active = self
            .active
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        match err {
            Some(e) => debug!(peer = %conn.remote_addr(), error = %e, active, "connection closed with error"),
            None => debug!(peer = %conn.remote_addr(), active, "connection closed"),
        }
    }

    fn on_tick(&self) -> Option<Duration> {
        trace!(
            active = self.active_connections(),
            total = self.total_requests(),
            in_flight = self.in_flight(),
            idle_buffers = self.pool.idle(),
            "engine stats"
        );
        Some(self.config.tick_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{CloseCode, CloseFrame, Message, OpCode, Role, Upgrader};
    use crate::server::Outbox;

    fn engine(router: Router) -> Engine {
        Engine::new(router, EngineConfig::default())
    }

    fn open(engine: &Engine) -> (Conn, Outbox) {
        let (mut conn, outbox) = Conn::detached("127.0.0.1:6000".parse().unwrap());
        engine.on_open(&mut conn);
        (conn, outbox)
    }

    fn text(outbox: &mut Outbox) -> String {
        String::from_utf8(outbox.drain().to_vec()).unwrap()
    }

    fn hello_router() -> Router {
        let mut router = Router::new();
        router.get("/hello", |_ctx| async { Response::text("hi") });
        router.post("/echo", |ctx: Context| async move {
            Response::new(StatusCode::Ok).body_bytes(ctx.request().body().to_vec())
        });
        router
    }

    #[tokio::test]
    async fn request_split_across_reads() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);

        for chunk in ["GET /hel", "lo HTTP/1.1\r\nHo", "st: x\r\n", "\r\n"] {
            assert_eq!(engine.on_traffic(&mut conn, chunk.as_bytes()).await, Action::Continue);
        }
        let wire = text(&mut out);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.ends_with("\r\n\r\nhi"));
        assert_eq!(engine.total_requests(), 1);
        assert_eq!(conn.context::<ConnState>().unwrap().buffered(), 0);
    }

    #[tokio::test]
    async fn pipelined_requests_answer_in_order() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);
        let raw = "POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nfirstGET /hello HTTP/1.1\r\n\r\nGET /hel";
        engine.on_traffic(&mut conn, raw.as_bytes()).await;

        let wire = text(&mut out);
        let first = wire.find("first").unwrap();
        let second = wire.find("\r\n\r\nhi").unwrap();
        assert!(first < second);
        assert_eq!(engine.total_requests(), 2);
        assert_eq!(conn.context::<ConnState>().unwrap().buffered(), 8);
    }

    #[tokio::test]
    async fn not_found_uses_configured_body() {
        let config = EngineConfig {
            not_found_body: Some("nothing here".into()),
            ..EngineConfig::default()
        };
        let engine = Engine::new(hello_router(), config);
        let (mut conn, mut out) = open(&engine);
        engine.on_traffic(&mut conn, b"GET /missing HTTP/1.1\r\n\r\n").await;

        let wire = text(&mut out);
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.ends_with("nothing here"));
    }

    #[tokio::test]
    async fn malformed_request_closes_with_400() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);
        let action = engine.on_traffic(&mut conn, b"GARBAGE\r\n\r\n").await;
        assert_eq!(action, Action::Close);
        let wire = text(&mut out);
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(wire.contains("Connection: close"));
    }

    #[tokio::test]
    async fn oversized_request_gets_413() {
        let config = EngineConfig {
            max_request_size: 64,
            max_body_size: 64,
            ..EngineConfig::default()
        };
        let engine = Engine::new(hello_router(), config);
        let (mut conn, mut out) = open(&engine);
        let header = format!("GET /hello HTTP/1.1\r\nX-Pad: {}", "a".repeat(100));
        let action = engine.on_traffic(&mut conn, header.as_bytes()).await;
        assert_eq!(action, Action::Close);
        assert!(text(&mut out).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn head_omits_body() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);
        engine.on_traffic(&mut conn, b"HEAD /hello HTTP/1.1\r\n\r\n").await;
        let wire = text(&mut out);
        assert!(wire.contains("Content-Length: 2\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn connection_close_is_honoured() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);
        let action = engine
            .on_traffic(&mut conn, b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await;
        assert_eq!(action, Action::Close);
        assert!(text(&mut out).contains("Connection: close\r\n"));

        let (mut conn, mut out) = open(&engine);
        let action = engine.on_traffic(&mut conn, b"GET /hello HTTP/1.0\r\n\r\n").await;
        assert_eq!(action, Action::Close);
        assert!(text(&mut out).contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn routes_update_while_serving() {
        let engine = engine(hello_router());
        let (mut conn, mut out) = open(&engine);
        engine.on_traffic(&mut conn, b"GET /late HTTP/1.1\r\n\r\n").await;
        assert!(text(&mut out).starts_with("HTTP/1.1 404"));

        engine.update_routes(|router| router.get("/late", |_ctx| async { Response::text("now") }));
        engine.on_traffic(&mut conn, b"GET /late HTTP/1.1\r\n\r\n").await;
        assert!(text(&mut out).ends_with("now"));
    }

    #[tokio::test]
    async fn close_returns_buffer_and_counts() {
        let engine = engine(hello_router());
        let (mut conn, _out) = open(&engine);
        assert_eq!(engine.active_connections(), 1);
        engine.on_traffic(&mut conn, b"GET /hel").await;
        engine.on_close(&mut conn, None);
        assert_eq!(engine.active_connections(), 0);
        assert!(conn.context::<ConnState>().is_none());
        assert_eq!(engine.pool.idle(), 1);
    }

    #[tokio::test]
    async fn upgrade_switches_to_frames() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let upgrader = Upgrader::new()
            .subprotocols(["chat"])
            .on_message(move |ws: &Arc<WebSocket>, msg: Message| {
                sink.lock().unwrap().push(msg.clone());
                let _ = ws.send(msg);
            });
        let mut router = Router::new();
        router.websocket("/ws", upgrader);
        let hub = Hub::spawn();
        let engine = engine(router).with_hub(hub.clone());
        let (mut conn, mut out) = open(&engine);

        let mut raw = b"GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: chat\r\n\r\n"
            .to_vec();
        raw.extend_from_slice(&Frame::text("ping?").to_bytes(Role::Client));
        assert_eq!(engine.on_traffic(&mut conn, &raw).await, Action::Continue);

        let wire = out.drain();
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = std::str::from_utf8(&wire[..head_end]).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        let (echo, _) = Frame::parse(&wire[head_end..]).unwrap();
        assert_eq!(&echo.payload[..], b"ping?");
        assert_eq!(*received.lock().unwrap(), vec![Message::Text("ping?".into())]);

        let state = conn.context::<ConnState>().unwrap();
        assert_eq!(state.attribute(SUBPROTOCOL_ATTRIBUTE), Some("chat"));
        assert!(state.websocket().unwrap().is_handshake_complete());
        assert_eq!(hub.len().await.unwrap(), 1);

        // Frames split across reads are reassembled from the buffer.
        let ping = Frame::ping(Bytes::from_static(b"p")).to_bytes(Role::Client);
        engine.on_traffic(&mut conn, &ping[..3]).await;
        assert!(out.drain().is_empty());
        engine.on_traffic(&mut conn, &ping[3..]).await;
        let (pong, _) = Frame::parse(&out.drain()).unwrap();
        assert_eq!(pong.opcode, OpCode::Pong);

        let close = Frame::close(CloseCode::NORMAL, "").to_bytes(Role::Client);
        assert_eq!(engine.on_traffic(&mut conn, &close).await, Action::Close);
        engine.on_close(&mut conn, None);
        assert_eq!(hub.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_after_hub_stopped_still_releases_state() {
        let mut router = Router::new();
        router.websocket("/ws", Upgrader::new());
        let hub = Hub::spawn();
        let engine = engine(router).with_hub(hub.clone());
        let (mut conn, mut out) = open(&engine);
        engine
            .on_traffic(
                &mut conn,
                b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await;
        assert!(text(&mut out).starts_with("HTTP/1.1 101"));

        hub.shutdown().await.unwrap();
        engine.on_close(&mut conn, None);
        assert_eq!(engine.active_connections(), 0);
        assert!(conn.context::<ConnState>().is_none());
        assert_eq!(engine.pool.idle(), 1);
    }

    #[tokio::test]
    async fn oversized_frame_closes_with_1009() {
        let mut router = Router::new();
        router.websocket("/ws", Upgrader::new().read_buffer_size(16));
        let engine = engine(router);
        let (mut conn, mut out) = open(&engine);
        engine
            .on_traffic(
                &mut conn,
                b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await;
        let _ = out.drain();

        let big = Frame::binary(vec![0u8; 64]).to_bytes(Role::Client);
        assert_eq!(engine.on_traffic(&mut conn, &big).await, Action::Close);
        let (frame, _) = Frame::parse(&out.drain()).unwrap();
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::MESSAGE_TOO_BIG);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let engine = engine(hello_router());
        engine.shutdown(Duration::from_millis(10)).await.unwrap();
        let (mut conn, mut out) = open(&engine);
        let action = engine.on_traffic(&mut conn, b"GET /hello HTTP/1.1\r\n\r\n").await;
        assert_eq!(action, Action::Close);
        assert!(text(&mut out).starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_times_out_on_stuck_handler() {
        let mut router = Router::new();
        router.get("/slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Response::text("late")
        });
        let engine = Arc::new(engine(router));

        let worker = Arc::clone(&engine);
        let request = tokio::spawn(async move {
            let (mut conn, _out) = open(&worker);
            worker.on_traffic(&mut conn, b"GET /slow HTTP/1.1\r\n\r\n").await
        });
        while engine.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let err = engine.shutdown(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::ShutdownTimeout { in_flight: 1 }));

        request.await.unwrap();
        assert_eq!(engine.in_flight(), 0);
    }
}
