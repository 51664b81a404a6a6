use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

use super::frame::{CloseCode, CloseFrame, Frame, OpCode, Role};
use crate::server::{Action, ConnHandle};

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket is closed")]
    Closed,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub(crate) type MessageCallback = Arc<dyn Fn(&Arc<WebSocket>, Message) + Send + Sync>;
pub(crate) type ControlCallback = Arc<dyn Fn(&Arc<WebSocket>, &[u8]) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<WebSocket>, Option<&CloseFrame>) + Send + Sync>;

/// Application callbacks attached to every socket an
/// [`Upgrader`](super::Upgrader) produces.
#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub(crate) on_message: Option<MessageCallback>,
    pub(crate) on_ping: Option<ControlCallback>,
    pub(crate) on_pong: Option<ControlCallback>,
    pub(crate) on_close: Option<CloseCallback>,
}

/// Settings a socket is created with.
#[derive(Debug, Clone)]
pub(crate) struct SocketOptions {
    pub(crate) subprotocol: Option<String>,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_buffer_size: usize,
}

/// One upgraded WebSocket connection.
///
/// Shared between the connection that owns the socket and the
/// [`Hub`](super::Hub); every method takes `&self`. Outbound frames are sent
/// unmasked, as the server side of the protocol requires. Inbound frames must
/// be masked, and fragmented messages are refused with close code `1003`.
pub struct WebSocket {
    id: String,
    conn: ConnHandle,
    options: SocketOptions,
    callbacks: Callbacks,
    handshake_complete: AtomicBool,
    // Set once a close frame has been sent.
    closing: AtomicBool,
    // Set once the close callback has run.
    close_notified: AtomicBool,
    last_pong: Mutex<Option<Instant>>,
    store: Mutex<HashMap<String, String>>,
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.id)
            .field("remote_addr", &self.conn.remote_addr())
            .field("subprotocol", &self.options.subprotocol)
            .field("handshake_complete", &self.is_handshake_complete())
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WebSocket {
    pub(crate) fn new(conn: ConnHandle, options: SocketOptions, callbacks: Callbacks) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            id: format!("{}-{}", conn.remote_addr(), nanos),
            conn,
            options,
            callbacks,
            handshake_complete: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_notified: AtomicBool::new(false),
            last_pong: Mutex::new(None),
            store: Mutex::new(HashMap::new()),
        }
    }

    /// `<remote-addr>-<unix-nanos>` of the moment the socket was created.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.options.subprotocol.as_deref()
    }

    /// Largest inbound payload accepted; bigger frames close with `1009`.
    pub fn read_buffer_size(&self) -> usize {
        self.options.read_buffer_size
    }

    pub fn write_buffer_size(&self) -> usize {
        self.options.write_buffer_size
    }

    /// Always `false`: no compression extension is negotiated.
    pub fn compression(&self) -> bool {
        false
    }

    /// Whether the `101` response has been handed to the connection.
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    pub(crate) fn mark_handshake_complete(&self) {
        self.handshake_complete.store(true, Ordering::Release);
    }

    /// Whether a close frame has been sent.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// When the last pong arrived.
    pub fn last_pong(&self) -> Option<Instant> {
        *lock(&self.last_pong)
    }

    /// Stores a value in the socket's key-value store.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.store).insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        lock(&self.store).get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        lock(&self.store).remove(key)
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), WsError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len(Role::Server));
        frame.encode(Role::Server, &mut buf);
        self.conn.write(buf.freeze()).map_err(|_| WsError::Closed)
    }

    /// Sends `message` as a single frame.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), WsError> {
        if self.is_closing() {
            return Err(WsError::Closed);
        }
        self.write_frame(&message.into().into_frame())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WsError> {
        self.send(Message::Binary(data.into()))
    }

    /// Serializes `value` and sends it as a text frame.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), WsError> {
        self.send(Message::Text(serde_json::to_string(value)?))
    }

    pub fn ping(&self, payload: impl Into<Bytes>) -> Result<(), WsError> {
        if self.is_closing() {
            return Err(WsError::Closed);
        }
        self.write_frame(&Frame::ping(payload))
    }

    pub fn pong(&self, payload: impl Into<Bytes>) -> Result<(), WsError> {
        if self.is_closing() {
            return Err(WsError::Closed);
        }
        self.write_frame(&Frame::pong(payload))
    }

    /// Starts the closing handshake. Only the first call sends a frame;
    /// later calls succeed without doing anything. The connection stays open
    /// until the peer answers with its own close frame.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_frame(&Frame::close(code, reason))
    }

    /// Closes the underlying connection without waiting for the peer.
    pub fn terminate(&self) {
        self.conn.close();
    }

    /// Runs the close callback unless it already ran.
    pub(crate) fn notify_closed(self: &Arc<Self>, frame: Option<&CloseFrame>) {
        if self.close_notified.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = &self.callbacks.on_close {
            callback(self, frame);
        }
    }

    /// Sends a close frame for a protocol violation and asks for the
    /// connection to be dropped.
    pub(crate) fn fail(self: &Arc<Self>, code: CloseCode, reason: &str) -> Action {
        tracing::warn!(socket = %self.id, code = %code, reason, "websocket protocol violation");
        if let Err(e) = self.close(code, reason) {
            tracing::debug!(socket = %self.id, error = %e, "close frame not sent");
        }
        self.notify_closed(None);
        self.terminate();
        Action::Close
    }

    /// Handles one inbound frame from the peer.
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: Frame) -> Action {
        if !frame.masked {
            return self.fail(CloseCode::PROTOCOL_ERROR, "client frames must be masked");
        }
        if !frame.fin || frame.opcode == OpCode::Continuation {
            return self.fail(
                CloseCode::UNSUPPORTED_DATA,
                "fragmented messages are not supported",
            );
        }

        match frame.opcode {
            OpCode::Text => match String::from_utf8(frame.payload.to_vec()) {
                Ok(text) => self.deliver(Message::Text(text)),
                Err(_) => self.fail(CloseCode::INVALID_PAYLOAD, "text frame is not valid UTF-8"),
            },
            OpCode::Binary => self.deliver(Message::Binary(frame.payload)),
            OpCode::Ping => {
                if !self.is_closing() {
                    if let Err(e) = self.pong(frame.payload.clone()) {
                        tracing::debug!(socket = %self.id, error = %e, "pong not sent");
                    }
                }
                if let Some(callback) = &self.callbacks.on_ping {
                    callback(self, &frame.payload);
                }
                Action::Continue
            }
            OpCode::Pong => {
                *lock(&self.last_pong) = Some(Instant::now());
                if let Some(callback) = &self.callbacks.on_pong {
                    callback(self, &frame.payload);
                }
                Action::Continue
            }
            OpCode::Close => self.handle_close(&frame.payload),
            OpCode::Continuation => Action::Close,
        }
    }

    fn deliver(self: &Arc<Self>, message: Message) -> Action {
        if let Some(callback) = &self.callbacks.on_message {
            callback(self, message);
        }
        Action::Continue
    }

    fn handle_close(self: &Arc<Self>, payload: &[u8]) -> Action {
        let close = match CloseFrame::parse(payload) {
            Ok(close) => close,
            Err(e) => {
                let code = e.close_code();
                return self.fail(code, &e.to_string());
            }
        };

        tracing::debug!(
            socket = %self.id,
            code = close.as_ref().map(|c| c.code.0),
            "peer closed websocket"
        );
        let echo = close.as_ref().map_or(CloseCode::NORMAL, |c| c.code);
        if let Err(e) = self.close(echo, "") {
            tracing::debug!(socket = %self.id, error = %e, "close echo not sent");
        }
        self.notify_closed(close.as_ref());
        self.terminate();
        Action::Close
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicU16;

    use super::*;
    use crate::server::{Conn, Outbox};

    /// A socket on a detached connection. Each call uses a fresh peer port
    /// so ids never collide.
    pub fn socket_with(callbacks: Callbacks) -> (Arc<WebSocket>, Conn, Outbox) {
        static NEXT_PORT: AtomicU16 = AtomicU16::new(5555);
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let (conn, outbox) = Conn::detached(SocketAddr::from(([127, 0, 0, 1], port)));
        let options = SocketOptions {
            subprotocol: None,
            read_buffer_size: 1024,
            write_buffer_size: 1024,
        };
        let socket = Arc::new(WebSocket::new(conn.handle().clone(), options, callbacks));
        (socket, conn, outbox)
    }

    /// Parses every server frame in `wire`.
    pub fn frames(wire: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut rest = wire;
        while !rest.is_empty() {
            let (frame, used) = Frame::parse(rest).unwrap();
            out.push(frame);
            rest = &rest[used..];
        }
        out
    }

    /// A frame as a client would send it.
    pub fn from_client(frame: Frame) -> Frame {
        let wire = frame.to_bytes(Role::Client);
        Frame::parse(&wire).unwrap().0
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{frames, from_client, socket_with};
    use super::*;

    fn recording() -> (Callbacks, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (m, c) = (Arc::clone(&log), Arc::clone(&log));
        let callbacks = Callbacks {
            on_message: Some(Arc::new(move |_ws: &Arc<WebSocket>, msg: Message| {
                m.lock().unwrap().push(format!("{msg:?}"));
            })),
            on_close: Some(Arc::new(move |_ws: &Arc<WebSocket>, frame: Option<&CloseFrame>| {
                c.lock().unwrap().push(format!("close {:?}", frame.map(|f| f.code.0)));
            })),
            ..Callbacks::default()
        };
        (callbacks, log)
    }

    #[test]
    fn id_includes_remote_address() {
        let (socket, _conn, _out) = socket_with(Callbacks::default());
        assert!(socket.id().starts_with(&format!("{}-", socket.remote_addr())));
        assert!(!socket.compression());
        assert!(!socket.is_handshake_complete());
    }

    #[test]
    fn sends_unmasked_frames() {
        let (socket, _conn, mut out) = socket_with(Callbacks::default());
        socket.send_text("hi").unwrap();
        socket.send_json(&serde_json::json!({"n": 1})).unwrap();
        socket.send_binary(Bytes::from_static(b"\x00\x01")).unwrap();

        let sent = frames(&out.drain());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|f| !f.masked && f.fin));
        assert_eq!(&sent[0].payload[..], b"hi");
        assert_eq!(&sent[1].payload[..], br#"{"n":1}"#);
        assert_eq!(sent[2].opcode, OpCode::Binary);
    }

    #[test]
    fn text_and_binary_reach_callback() {
        let (callbacks, log) = recording();
        let (socket, _conn, _out) = socket_with(callbacks);
        assert_eq!(socket.handle_frame(from_client(Frame::text("hello"))), Action::Continue);
        assert_eq!(
            socket.handle_frame(from_client(Frame::binary(Bytes::from_static(b"\x01")))),
            Action::Continue
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec![r#"Text("hello")"#.to_string(), "Binary(b\"\\x01\")".to_string()]
        );
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let (socket, _conn, mut out) = socket_with(Callbacks::default());
        socket.handle_frame(from_client(Frame::ping(Bytes::from_static(b"beat"))));
        let sent = frames(&out.drain());
        assert_eq!(sent[0].opcode, OpCode::Pong);
        assert_eq!(&sent[0].payload[..], b"beat");

        assert!(socket.last_pong().is_none());
        socket.handle_frame(from_client(Frame::pong(Bytes::new())));
        assert!(socket.last_pong().is_some());
    }

    #[test]
    fn ping_after_transport_closed_still_reaches_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = Callbacks {
            on_ping: Some(Arc::new(move |_ws: &Arc<WebSocket>, payload: &[u8]| {
                sink.lock().unwrap().push(payload.to_vec());
            })),
            ..Callbacks::default()
        };
        let (socket, conn, mut out) = socket_with(callbacks);
        conn.handle().close();

        let action = socket.handle_frame(from_client(Frame::ping(Bytes::from_static(b"late"))));
        assert_eq!(action, Action::Continue);
        assert!(out.drain().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![b"late".to_vec()]);
    }

    #[test]
    fn peer_close_is_echoed_once() {
        let (callbacks, log) = recording();
        let (socket, conn, mut out) = socket_with(callbacks);
        let action = socket.handle_frame(from_client(Frame::close(CloseCode(4000), "done")));
        assert_eq!(action, Action::Close);
        assert!(conn.handle().is_closed());

        let sent = frames(&out.drain());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, OpCode::Close);
        assert_eq!(&sent[0].payload[..2], &4000u16.to_be_bytes());
        assert_eq!(*log.lock().unwrap(), vec!["close Some(4000)".to_string()]);

        socket.notify_closed(None);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(matches!(socket.send_text("late"), Err(WsError::Closed)));
    }

    #[test]
    fn invalid_close_code_fails_with_protocol_error() {
        let (socket, conn, mut out) = socket_with(Callbacks::default());
        let frame = from_client(Frame::new(OpCode::Close, Bytes::from_static(&[0x03, 0xed])));
        assert_eq!(socket.handle_frame(frame), Action::Close);
        assert!(conn.handle().is_closed());

        let sent = frames(&out.drain());
        let close = CloseFrame::parse(&sent[0].payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::PROTOCOL_ERROR);
    }

    #[test]
    fn protocol_violations() {
        let cases = [
            (Frame::text("plain"), CloseCode::PROTOCOL_ERROR, false),
            (
                Frame {
                    fin: false,
                    ..Frame::text("part")
                },
                CloseCode::UNSUPPORTED_DATA,
                true,
            ),
            (
                Frame::new(OpCode::Continuation, Bytes::from_static(b"more")),
                CloseCode::UNSUPPORTED_DATA,
                true,
            ),
            (
                Frame::new(OpCode::Text, Bytes::from_static(&[0xff, 0xfe])),
                CloseCode::INVALID_PAYLOAD,
                true,
            ),
        ];
        for (frame, expected, masked) in cases {
            let (socket, _conn, mut out) = socket_with(Callbacks::default());
            let frame = if masked {
                Frame {
                    masked: true,
                    ..frame
                }
            } else {
                frame
            };
            assert_eq!(socket.handle_frame(frame), Action::Close);
            let sent = frames(&out.drain());
            let close = CloseFrame::parse(&sent[0].payload).unwrap().unwrap();
            assert_eq!(close.code, expected);
        }
    }

    #[test]
    fn close_is_sent_once() {
        let (socket, _conn, mut out) = socket_with(Callbacks::default());
        socket.close(CloseCode::NORMAL, "bye").unwrap();
        socket.close(CloseCode::GOING_AWAY, "again").unwrap();
        assert_eq!(frames(&out.drain()).len(), 1);
        assert!(socket.is_closing());
        assert!(socket.ping(Bytes::new()).is_err());
    }

    #[test]
    fn key_value_store() {
        let (socket, _conn, _out) = socket_with(Callbacks::default());
        socket.set("room", "lobby");
        assert_eq!(socket.get("room").as_deref(), Some("lobby"));
        assert_eq!(socket.remove("room").as_deref(), Some("lobby"));
        assert!(socket.get("room").is_none());
    }
}
