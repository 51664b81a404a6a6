use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;

use crate::realtime::WebSocket;

/// Attribute holding the negotiated WebSocket subprotocol.
pub const SUBPROTOCOL_ATTRIBUTE: &str = "subprotocol";

/// Per-connection state kept by the [`Engine`](super::Engine) in the
/// connection's context slot.
#[derive(Debug)]
pub struct ConnState {
    created_at: Instant,
    last_seen: Instant,
    remote_addr: SocketAddr,
    attributes: HashMap<String, String>,
    pub(super) buffer: BytesMut,
    pub(super) websocket: Option<Arc<WebSocket>>,
}

impl ConnState {
    pub(super) fn new(remote_addr: SocketAddr, buffer: BytesMut) -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_seen: now,
            remote_addr,
            attributes: HashMap::new(),
            buffer,
            websocket: None,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub(super) fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Bytes received but not yet consumed by a complete request or frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The upgraded socket, once the connection is in frame mode.
    pub fn websocket(&self) -> Option<&Arc<WebSocket>> {
        self.websocket.as_ref()
    }
}
