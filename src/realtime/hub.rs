//! Registry of live WebSockets with fan-out.
//!
//! A single task owns the map from socket id to [`WebSocket`]; every
//! operation is a message to that task, so no lock guards the registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::frame::CloseCode;
use super::websocket::{Message, WebSocket};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub has shut down")]
    Stopped,

    #[error("no websocket registered as {0}")]
    NotFound(String),

    #[error("websocket {0} is closed")]
    Closed(String),

    #[error("failed to serialize broadcast: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum Command {
    Register(Arc<WebSocket>),
    Unregister(String),
    Broadcast(Message),
    Send {
        id: String,
        message: Message,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Len(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the hub task. Clones talk to the same hub.
#[derive(Debug, Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// Starts the hub task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    fn submit(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).map_err(|_| HubError::Stopped)
    }

    pub fn register(&self, socket: Arc<WebSocket>) -> Result<(), HubError> {
        self.submit(Command::Register(socket))
    }

    /// Removes the socket and sends it a `1000` close frame if it has not
    /// started closing already.
    pub fn unregister(&self, id: impl Into<String>) -> Result<(), HubError> {
        self.submit(Command::Unregister(id.into()))
    }

    /// Sends `message` to every registered socket. Sockets that fail are
    /// logged and skipped.
    pub fn broadcast(&self, message: impl Into<Message>) -> Result<(), HubError> {
        self.submit(Command::Broadcast(message.into()))
    }

    pub fn broadcast_text(&self, text: impl Into<String>) -> Result<(), HubError> {
        self.broadcast(Message::Text(text.into()))
    }

    pub fn broadcast_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), HubError> {
        self.broadcast(Message::Text(serde_json::to_string(value)?))
    }

    /// Sends `message` to one socket.
    pub async fn send(&self, id: impl Into<String>, message: impl Into<Message>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send {
            id: id.into(),
            message: message.into(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Stopped)?
    }

    /// Number of registered sockets.
    pub async fn len(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Len(reply))?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Closes every socket with `1001 Going Away` and stops the hub.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Shutdown(reply))?;
        rx.await.map_err(|_| HubError::Stopped)
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sockets: HashMap<String, Arc<WebSocket>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Register(socket) => {
                tracing::debug!(socket = %socket.id(), "websocket registered");
                sockets.insert(socket.id().to_owned(), socket);
            }
            Command::Unregister(id) => {
                if let Some(socket) = sockets.remove(&id) {
                    if let Err(e) = socket.close(CloseCode::NORMAL, "") {
                        tracing::debug!(socket = %id, error = %e, "close frame not sent");
                    }
                    tracing::debug!(socket = %id, remaining = sockets.len(), "websocket unregistered");
                }
            }
            Command::Broadcast(message) => {
                let mut failed = 0usize;
                for (id, socket) in &sockets {
                    if let Err(e) = socket.send(message.clone()) {
                        failed += 1;
                        tracing::warn!(socket = %id, error = %e, "broadcast write failed");
                    }
                }
                tracing::trace!(recipients = sockets.len(), failed, "broadcast sent");
            }
            Command::Send { id, message, reply } => {
                let result = match sockets.get(&id) {
                    Some(socket) => socket.send(message).map_err(|_| HubError::Closed(id)),
                    None => Err(HubError::NotFound(id)),
                };
                let _ = reply.send(result);
            }
            Command::Len(reply) => {
                let _ = reply.send(sockets.len());
            }
            Command::Shutdown(reply) => {
                for (id, socket) in sockets.drain() {
                    if let Err(e) = socket.close(CloseCode::GOING_AWAY, "server shutting down") {
                        tracing::debug!(socket = %id, error = %e, "close frame not sent");
                    }
                }
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!("hub stopped");
}
