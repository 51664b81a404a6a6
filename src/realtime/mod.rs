//! Real-time communication over WebSocket (RFC 6455).
//!
//! - [`Upgrader`] validates upgrade requests and answers `101 Switching
//!   Protocols` with a live [`WebSocket`] attached.
//! - [`frame`] encodes and decodes single frames.
//! - [`WebSocket`] is one upgraded connection: send, ping, close, callbacks.
//! - [`Hub`] tracks live sockets and broadcasts to them.
//! - [`BufferPool`] recycles the scratch buffers connections accumulate into.

pub mod frame;
pub mod handshake;
pub mod hub;
pub mod pool;
pub mod websocket;

pub use frame::{CloseCode, CloseFrame, Frame, FrameError, OpCode, Role};
pub use handshake::{HandshakeError, HandshakeState, Upgrader, accept_key};
pub use hub::{Hub, HubError};
pub use pool::BufferPool;
pub use websocket::{Message, WebSocket, WsError};
