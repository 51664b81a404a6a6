//! Event-driven TCP reactor using Tokio.
//!
//! The reactor owns sockets and knows nothing about HTTP: it reports
//! connection events to an [`EventHandler`] and writes whatever bytes the
//! handler queues on a [`ConnHandle`]. [`Engine`](crate::engine::Engine) is the
//! handler that speaks HTTP and WebSocket.
//!
//! Each accepted connection gets one task that reads and invokes the
//! handler, so callbacks for a single connection never overlap, plus one
//! writer task draining the connection's outbound queue. A separate task
//! drives [`EventHandler::on_tick`].

use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Returned by [`ConnHandle::write`] once the connection is closing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection is closed")]
pub struct ConnClosed;

/// Initial read buffer capacity per connection.
const READ_BUF_SIZE: usize = 4096;

/// What the reactor should do with a connection after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Close,
}

/// Boxed future returned by [`EventHandler::on_traffic`].
pub type TrafficFuture<'a> = Pin<Box<dyn Future<Output = Action> + Send + 'a>>;

/// Callbacks the reactor invokes for each connection.
///
/// For one connection the callbacks run strictly in sequence:
/// `on_open`, any number of `on_traffic`, then `on_close` exactly once.
pub trait EventHandler: Send + Sync + 'static {
    /// A connection was accepted. Returned bytes are written before anything
    /// else.
    fn on_open(&self, conn: &mut Conn) -> (Option<Bytes>, Action) {
        let _ = conn;
        (None, Action::Continue)
    }

    /// Bytes arrived. `data` is only valid for this call; keep what you need.
    fn on_traffic<'a>(&'a self, conn: &'a mut Conn, data: &'a [u8]) -> TrafficFuture<'a>;

    /// The connection is gone. `err` is set when a read failed.
    fn on_close(&self, conn: &mut Conn, err: Option<&io::Error>) {
        let _ = (conn, err);
    }

    /// Periodic housekeeping. Returns the delay until the next tick, or
    /// `None` to stop ticking.
    fn on_tick(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug)]
struct HandleInner {
    id: u64,
    remote_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    closed: CancellationToken,
}

/// Cloneable reference to a live connection: queue writes, request close.
///
/// Writes are queued in order and flushed by the connection's writer task.
/// After [`close`](Self::close), queued bytes are still flushed and then the
/// socket is shut down.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    inner: Arc<HandleInner>,
}

impl ConnHandle {
    fn new(
        id: u64,
        remote_addr: SocketAddr,
        closed: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = HandleInner {
            id,
            remote_addr,
            tx,
            closed,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Queues `data` for the peer.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), ConnClosed> {
        if self.is_closed() {
            return Err(ConnClosed);
        }
        self.inner.tx.send(data.into()).map_err(|_| ConnClosed)
    }

    /// Closes the connection once pending writes are flushed.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

/// A connection as seen by an [`EventHandler`]: its handle plus one slot of
/// handler-owned state.
pub struct Conn {
    handle: ConnHandle,
    context: Option<Box<dyn Any + Send>>,
}

impl Conn {
    fn new(handle: ConnHandle) -> Self {
        Self {
            handle,
            context: None,
        }
    }

    /// A connection with no socket behind it. Everything written to it can be
    /// read back from the returned [`Outbox`]; useful for driving a handler
    /// in tests.
    pub fn detached(remote_addr: SocketAddr) -> (Self, Outbox) {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let closed = CancellationToken::new();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = ConnHandle::new(id, remote_addr, closed.clone());
        (Self::new(handle), Outbox { rx, closed })
    }

    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.handle.remote_addr()
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref()
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut()
    }

    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    pub fn take_context<T: Any>(&mut self) -> Option<Box<T>> {
        match self.context.take()?.downcast::<T>() {
            Ok(value) => Some(value),
            Err(other) => {
                self.context = Some(other);
                None
            }
        }
    }
}

/// The peer side of a [`Conn::detached`] connection.
#[derive(Debug)]
pub struct Outbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
}

impl Outbox {
    /// Everything written so far, concatenated.
    pub fn drain(&mut self) -> BytesMut {
        let mut out = BytesMut::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Waits for the next write.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Whether the handler asked for the connection to be closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// The TCP reactor.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use evserve::{Engine, EngineConfig, Router, Response, server::Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/", |_ctx| async { Response::text("Hello!") });
///
///     let engine = Arc::new(Engine::new(router, EngineConfig::default()));
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(engine).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    next_id: AtomicU64,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            next_id: AtomicU64::new(1),
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until the process is terminated.
    pub async fn run<H: EventHandler>(self, handler: Arc<H>) -> Result<(), ServerError> {
        self.run_until(handler, std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves, then stops accepting and
    /// closes every open connection.
    pub async fn run_until<H, F>(self, handler: Arc<H>, shutdown: F) -> Result<(), ServerError>
    where
        H: EventHandler,
        F: Future<Output = ()>,
    {
        let stop = CancellationToken::new();
        info!(address = %self.local_addr, "evserve listening");

        tokio::spawn(tick_loop(Arc::clone(&handler), stop.clone()));

        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer_addr, id, "connection accepted");
            let (handle, rx) = ConnHandle::new(id, peer_addr, stop.child_token());
            tokio::spawn(serve_connection(stream, handle, rx, Arc::clone(&handler)));
        }

        info!(address = %self.local_addr, "listener stopped");
        stop.cancel();
        Ok(())
    }
}

async fn tick_loop<H: EventHandler>(handler: Arc<H>, stop: CancellationToken) {
    while let Some(delay) = handler.on_tick() {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drives one connection from accept to close.
async fn serve_connection<H: EventHandler>(
    stream: TcpStream,
    handle: ConnHandle,
    rx: mpsc::UnboundedReceiver<Bytes>,
    handler: Arc<H>,
) {
    let peer = handle.remote_addr();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    let (mut reader, writer) = stream.into_split();
    let writer = tokio::spawn(write_loop(writer, rx, handle.clone()));

    let mut conn = Conn::new(handle.clone());
    let (greeting, action) = handler.on_open(&mut conn);
    if let Some(bytes) = greeting {
        if let Err(e) = handle.write(bytes) {
            debug!(peer = %peer, error = %e, "greeting not sent");
        }
    }
    if action == Action::Close {
        handle.close();
    }

    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    let mut failure = None;
    while !handle.is_closed() {
        buf.clear();
        buf.reserve(READ_BUF_SIZE);
        tokio::select! {
            _ = handle.closed() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(peer = %peer, "connection closed by peer");
                    break;
                }
                Ok(_) => {
                    if handler.on_traffic(&mut conn, &buf).await == Action::Close {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "read failed");
                    failure = Some(e);
                    break;
                }
            },
        }
    }

    handle.close();
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "write failed"),
        Err(e) => warn!(peer = %peer, error = %e, "writer task failed"),
    }
    handler.on_close(&mut conn, failure.as_ref());
    debug!(peer = %peer, "connection finished");
}

/// Writes queued chunks in order; once the handle is closed, flushes what is
/// left and shuts the socket down.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    handle: ConnHandle,
) -> io::Result<()> {
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(chunk) => writer.write_all(&chunk).await?,
                None => break,
            },
            _ = handle.closed() => {
                while let Ok(chunk) = rx.try_recv() {
                    writer.write_all(&chunk).await?;
                }
                break;
            }
        }
    }
    writer.flush().await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Echoes every chunk back, upper-cased; closes on `quit`.
    #[derive(Default)]
    struct Shout {
        closed: Mutex<Vec<u64>>,
    }

    impl EventHandler for Shout {
        fn on_open(&self, _conn: &mut Conn) -> (Option<Bytes>, Action) {
            (Some(Bytes::from_static(b"hi\n")), Action::Continue)
        }

        fn on_traffic<'a>(&'a self, conn: &'a mut Conn, data: &'a [u8]) -> TrafficFuture<'a> {
            Box::pin(async move {
                if data.starts_with(b"quit") {
                    let _ = conn.handle().write(Bytes::from_static(b"bye\n"));
                    return Action::Close;
                }
                let _ = conn.handle().write(data.to_ascii_uppercase());
                Action::Continue
            })
        }

        fn on_close(&self, conn: &mut Conn, _err: Option<&io::Error>) {
            self.closed.lock().unwrap().push(conn.id());
        }
    }

    #[tokio::test]
    async fn detached_connection_records_writes() {
        let (mut conn, mut outbox) = Conn::detached("127.0.0.1:9".parse().unwrap());
        conn.handle().write(&b"abc"[..]).unwrap();
        conn.handle().write(&b"def"[..]).unwrap();
        assert_eq!(&outbox.drain()[..], b"abcdef");

        conn.set_context(7u32);
        assert_eq!(conn.context::<u32>(), Some(&7));
        *conn.context_mut::<u32>().unwrap() += 1;
        assert!(conn.take_context::<String>().is_none());
        assert_eq!(conn.take_context::<u32>().map(|b| *b), Some(8));

        conn.handle().close();
        assert!(outbox.is_closed());
        assert_eq!(conn.handle().write(&b"late"[..]), Err(ConnClosed));
    }

    #[tokio::test]
    async fn serves_events_over_tcp() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let handler = Arc::new(Shout::default());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(Arc::clone(&handler), async {
            let _ = stop_rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 8];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hi\nHELLO");

        client.write_all(b"quit").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bye\n");

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        for _ in 0..50 {
            if !handler.closed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let err = Server::bind("definitely-not-an-address").await.err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
