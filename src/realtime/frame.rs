//! WebSocket frame codec (RFC 6455 §5).
//!
//! Only single-frame messages are produced: every encoded frame has FIN set.
//! Inbound fragments parse fine, and reassembly is left to the caller (the
//! [`WebSocket`](super::WebSocket) connection refuses them with `1003`).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode. The four reserved data and five reserved control values are
/// rejected by [`OpCode::from_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        self.as_u8() >= Self::Close.as_u8()
    }

    /// Text and Binary. Continuation is neither data nor control.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// Which side of the connection is encoding. Clients must mask every frame
/// they send; servers must not mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Errors raised while decoding frames. Everything except
/// [`Incomplete`](Self::Incomplete) is a protocol violation that should end
/// the connection with [`close_code`](Self::close_code).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    #[error("control frame is fragmented")]
    FragmentedControl,

    #[error("invalid payload length")]
    InvalidLength,

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("close payload must be empty or at least two bytes")]
    InvalidClosePayload,

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// Close code to send when failing the connection for this error.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            Self::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// A close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    pub const INTERNAL_ERROR: Self = Self(1011);
    pub const SERVICE_RESTART: Self = Self(1012);
    pub const TRY_AGAIN_LATER: Self = Self(1013);

    /// Whether the code may appear on the wire. 1004–1006 and 1015 are
    /// reserved, 1014 and 1016–2999 are unassigned, 3000–4999 belong to
    /// applications.
    pub fn is_valid(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decoded close payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    /// Decodes a close payload. An empty payload carries no status (`None`).
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, FrameError> {
        match payload {
            [] => Ok(None),
            [_] => Err(FrameError::InvalidClosePayload),
            [hi, lo, reason @ ..] => {
                let code = CloseCode(u16::from_be_bytes([*hi, *lo]));
                if !code.is_valid() {
                    return Err(FrameError::InvalidCloseCode(code.0));
                }
                let reason = std::str::from_utf8(reason).map_err(|_| FrameError::InvalidUtf8)?;
                Ok(Some(Self {
                    code,
                    reason: reason.to_owned(),
                }))
            }
        }
    }
}

/// A single WebSocket frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    /// Whether the frame arrived masked. Ignored when encoding; the [`Role`]
    /// decides.
    pub masked: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// A close frame. The reason is cut at a character boundary so the
    /// payload stays within the control-frame limit.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code.0);
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(OpCode::Close, payload.freeze())
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self, role: Role) -> usize {
        let len = self.payload.len();
        let ext = match len {
            0..=125 => 0,
            126..=65535 => 2,
            _ => 8,
        };
        let mask = if role == Role::Client { 4 } else { 0 };
        2 + ext + mask + len
    }

    /// Appends the wire form of this frame to `dst`, always with FIN set and
    /// the shortest length encoding.
    pub fn encode(&self, role: Role, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(self.encoded_len(role));
        dst.put_u8(0x80 | self.opcode.as_u8());

        let mask_bit = if role == Role::Client { 0x80 } else { 0 };
        match len {
            0..=125 => dst.put_u8(mask_bit | len as u8),
            126..=65535 => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(len as u64);
            }
        }

        match role {
            Role::Server => dst.put_slice(&self.payload),
            Role::Client => {
                let key = fastrand::u32(..).to_be_bytes();
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
        }
    }

    pub fn to_bytes(&self, role: Role) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len(role));
        self.encode(role, &mut buf);
        buf.freeze()
    }

    /// Decodes one frame from the front of `buf`, returning it with the number
    /// of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        Self::parse_with_limit(buf, usize::MAX)
    }

    /// Like [`parse`](Self::parse), rejecting payloads longer than
    /// `max_payload` as soon as the header is readable.
    pub fn parse_with_limit(buf: &[u8], max_payload: usize) -> Result<(Self, usize), FrameError> {
        let [b0, b1, ..] = *buf else {
            return Err(FrameError::Incomplete);
        };

        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let opcode = OpCode::from_u8(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                let bytes = buf.get(2..4).ok_or(FrameError::Incomplete)?;
                (u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4)
            }
            127 => {
                let bytes: [u8; 8] = buf
                    .get(2..10)
                    .ok_or(FrameError::Incomplete)?
                    .try_into()
                    .map_err(|_| FrameError::InvalidLength)?;
                let len = u64::from_be_bytes(bytes);
                if len & (1 << 63) != 0 {
                    return Err(FrameError::InvalidLength);
                }
                (len, 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlFrameTooLarge);
            }
        }
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= max_payload)
            .ok_or(FrameError::PayloadTooLarge {
                len,
                max: max_payload,
            })?;

        let key = if masked {
            let bytes = buf
                .get(offset..offset + 4)
                .ok_or(FrameError::Incomplete)?;
            offset += 4;
            Some([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            None
        };

        let end = offset.checked_add(len).ok_or(FrameError::InvalidLength)?;
        let payload = buf.get(offset..end).ok_or(FrameError::Incomplete)?;
        let mut payload = BytesMut::from(payload);
        if let Some(key) = key {
            apply_mask(&mut payload, key);
        }

        Ok((
            Self {
                fin,
                opcode,
                masked,
                payload: payload.freeze(),
            },
            end,
        ))
    }
}

/// XORs `data` with the cycling 4-byte `key`. Applying it twice restores the
/// input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
