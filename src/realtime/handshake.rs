//! WebSocket opening handshake (RFC 6455 §4.2).

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use thiserror::Error;

use super::frame::CloseFrame;
use super::websocket::{Callbacks, Message, SocketOptions, WebSocket};
use crate::config::WebSocketConfig;
use crate::http::request::has_token;
use crate::{Request, Response, StatusCode};

/// Appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version spoken.
pub const WEBSOCKET_VERSION: &str = "13";

/// Why an upgrade request was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    #[error("unsupported websocket version {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("origin {0:?} is not allowed")]
    OriginRejected(Option<String>),

    #[error("missing Sec-WebSocket-Key")]
    MissingKey,

    #[error("request is not bound to a connection")]
    NoConnection,
}

impl HandshakeError {
    /// The HTTP response sent in place of the `101`.
    pub fn into_response(self) -> Response {
        match self {
            Self::NotUpgrade | Self::MissingKey => Response::bad_request(),
            Self::UnsupportedVersion(_) => {
                Response::bad_request().header("Sec-WebSocket-Version", WEBSOCKET_VERSION)
            }
            Self::OriginRejected(_) => Response::forbidden(),
            Self::NoConnection => Response::internal_error(),
        }
    }
}

/// Progress of one upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandshakeState {
    #[default]
    AwaitingUpgrade,
    HandshakeValidated {
        accept_key: String,
        subprotocol: Option<String>,
    },
    Upgraded,
    Rejected(HandshakeError),
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Splits a comma-separated header value, honouring double quotes and
/// dropping empty elements.
pub fn parse_header_list(value: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                push_item(&mut items, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push_item(&mut items, &current);
    items
}

fn push_item(items: &mut Vec<String>, item: &str) {
    let item = item.trim();
    if !item.is_empty() {
        items.push(item.to_owned());
    }
}

/// First protocol in `offered` (server preference order) the client asked for.
pub fn negotiate_subprotocol(requested: &[String], offered: &[String]) -> Option<String> {
    offered
        .iter()
        .find(|protocol| requested.iter().any(|r| r == *protocol))
        .cloned()
}

type OriginCheck = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Default origin policy: no `Origin` header, or an origin whose authority
/// matches `Host`.
fn same_origin(request: &Request) -> bool {
    let Some(origin) = request.header("origin") else {
        return true;
    };
    let Some(host) = request.host() else {
        return false;
    };
    let Ok(url) = url::Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = url.host_str() else {
        return false;
    };

    let (host_name, host_port) = match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    };
    let default_port = url.port_or_known_default();
    host_name.eq_ignore_ascii_case(origin_host)
        && host_port.or(default_port) == url.port().or(default_port)
}

/// Turns upgrade requests into live [`WebSocket`]s.
///
/// Register it with [`Router::websocket`](crate::Router::websocket) or call
/// [`respond`](Self::respond) from a handler. Cloning is cheap; clones share
/// callbacks.
///
/// ```rust
/// use std::sync::Arc;
/// use evserve::realtime::{Message, Upgrader, WebSocket};
///
/// let upgrader = Upgrader::new()
///     .subprotocols(["chat.v2", "chat.v1"])
///     .on_message(|ws: &Arc<WebSocket>, msg: Message| {
///         let _ = ws.send(msg);
///     });
/// ```
#[derive(Clone)]
pub struct Upgrader {
    subprotocols: Arc<[String]>,
    check_origin: OriginCheck,
    read_buffer_size: usize,
    write_buffer_size: usize,
    callbacks: Callbacks,
}

impl fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrader")
            .field("subprotocols", &self.subprotocols)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .finish_non_exhaustive()
    }
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::with_config(&WebSocketConfig::default())
    }
}

impl Upgrader {
    pub fn new() -> Self {
        Self::default()
    }

    /// An upgrader using the buffer sizes from `config`.
    pub fn with_config(config: &WebSocketConfig) -> Self {
        Self {
            subprotocols: Arc::from(Vec::new()),
            check_origin: Arc::new(same_origin),
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            callbacks: Callbacks::default(),
        }
    }

    /// Subprotocols the server speaks, most preferred first.
    pub fn subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the origin policy. Returning `false` answers `403`.
    pub fn check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Arc::new(check);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocket>, Message) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(callback));
        self
    }

    pub fn on_ping<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocket>, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.on_ping = Some(Arc::new(callback));
        self
    }

    pub fn on_pong<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocket>, &[u8]) + Send + Sync + 'static,
    {
        self.callbacks.on_pong = Some(Arc::new(callback));
        self
    }

    /// Runs once per socket, when the peer closes, a protocol error ends the
    /// socket, or the connection drops.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<WebSocket>, Option<&CloseFrame>) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(callback));
        self
    }

    /// Checks `request` without side effects. Returns
    /// [`HandshakeState::HandshakeValidated`] or
    /// [`HandshakeState::Rejected`].
    pub fn validate(&self, request: &Request) -> HandshakeState {
        match self.check(request) {
            Ok((accept_key, subprotocol)) => HandshakeState::HandshakeValidated {
                accept_key,
                subprotocol,
            },
            Err(e) => HandshakeState::Rejected(e),
        }
    }

    fn check(&self, request: &Request) -> Result<(String, Option<String>), HandshakeError> {
        let upgrade = request
            .header("upgrade")
            .is_some_and(|v| has_token(v, "websocket"));
        if !upgrade {
            return Err(HandshakeError::NotUpgrade);
        }

        let version = request.header("sec-websocket-version").map(str::trim);
        if version != Some(WEBSOCKET_VERSION) {
            return Err(HandshakeError::UnsupportedVersion(version.map(str::to_owned)));
        }

        if !(self.check_origin)(request) {
            return Err(HandshakeError::OriginRejected(
                request.header("origin").map(str::to_owned),
            ));
        }

        let key = request
            .header("sec-websocket-key")
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)?;

        let requested: Vec<String> = request
            .headers()
            .get_all("sec-websocket-protocol")
            .flat_map(parse_header_list)
            .collect();
        let subprotocol = negotiate_subprotocol(&requested, &self.subprotocols);

        Ok((accept_key(key), subprotocol))
    }

    /// Completes the handshake: the `101 Switching Protocols` response with
    /// the new socket attached, and the socket itself.
    pub fn upgrade(&self, request: &Request) -> Result<(Response, Arc<WebSocket>), HandshakeError> {
        let (accept, subprotocol) = match self.validate(request) {
            HandshakeState::HandshakeValidated {
                accept_key,
                subprotocol,
            } => (accept_key, subprotocol),
            HandshakeState::Rejected(e) => return Err(e),
            HandshakeState::AwaitingUpgrade | HandshakeState::Upgraded => {
                return Err(HandshakeError::NotUpgrade);
            }
        };
        let conn = request.connection().ok_or(HandshakeError::NoConnection)?;

        let options = SocketOptions {
            subprotocol: subprotocol.clone(),
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
        };
        let socket = Arc::new(WebSocket::new(conn.clone(), options, self.callbacks.clone()));

        let mut response = Response::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", accept);
        if let Some(protocol) = subprotocol {
            response.add_header("Sec-WebSocket-Protocol", protocol);
        }
        tracing::debug!(socket = %socket.id(), subprotocol = ?socket.subprotocol(), "websocket upgraded");
        Ok((response.with_upgrade(Arc::clone(&socket)), socket))
    }

    /// [`upgrade`](Self::upgrade) as a handler response: the `101` on
    /// success, the matching error response otherwise.
    pub fn respond(&self, request: &Request) -> Response {
        match self.upgrade(request) {
            Ok((response, _)) => response,
            Err(e) => {
                tracing::warn!(
                    peer = %request.remote_addr(),
                    path = request.path(),
                    error = %e,
                    "websocket handshake rejected"
                );
                e.into_response()
            }
        }
    }
}
