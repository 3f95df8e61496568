//! RFC 6455 frame codec: encode, decode, masking, message reassembly.
//!
//! The decoder consumes a byte slice and either produces a complete frame
//! plus the number of bytes consumed, or reports that more bytes are needed.
//! Payloads come out unmasked. Per-frame payloads are capped at 1 MiB;
//! messages (reassembled from fragments) are only bounded by connection
//! backpressure.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Largest accepted per-frame payload.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

/// RFC 6455 close codes used by the runtime.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Which side of the connection this codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Frame opcode (4-bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolError::Violation("reserved opcode")),
        }
    }

    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, Ping, and Pong are control opcodes.
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Wire-protocol violations detected while encoding, decoding, or
/// reassembling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Declared payload exceeds the per-frame cap.
    #[error("frame payload of {len} bytes exceeds the {max} byte cap")]
    Oversized { len: u64, max: usize },

    /// A structural RFC 6455 rule was broken.
    #[error("{0}")]
    Violation(&'static str),

    /// A complete text message was not valid UTF-8.
    #[error("invalid utf-8 in text message")]
    Utf8,
}

impl ProtocolError {
    /// Close code to send the peer for this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Oversized { .. } => close_code::MESSAGE_TOO_BIG,
            Self::Utf8 => close_code::INVALID_PAYLOAD,
            Self::Violation(_) => close_code::PROTOCOL_ERROR,
        }
    }
}

impl From<ProtocolError> for gale_core::Error {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// A single RFC 6455 frame with an unmasked payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// Close frame with a status code and UTF-8 reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }

    /// Close frame echoing a raw payload (code and reason as received).
    pub fn close_raw(payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }

    /// Status code of a Close frame, when present.
    pub fn close_status(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    /// Reason bytes of a Close frame (empty when absent).
    pub fn close_reason(&self) -> &[u8] {
        if self.opcode == Opcode::Close && self.payload.len() > 2 {
            &self.payload[2..]
        } else {
            &[]
        }
    }
}

/// XOR the 4-byte mask key over a payload in place.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Stateless frame encoder/decoder configured for one side of a connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    strict: bool,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            strict: false,
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// Strict mode additionally rejects masked server→client frames.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the decoded
    /// frame and the number of bytes consumed. Oversized declarations are
    /// rejected from the header alone, before the payload arrives.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        if b0 & 0x70 != 0 {
            return Err(ProtocolError::Violation("reserved bits set"));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = Opcode::from_bits(b0 & 0x0F)?;

        let b1 = buf[1];
        let masked = b1 & 0x80 != 0;
        match self.role {
            // Client→server frames must be masked.
            Role::Server if !masked => {
                return Err(ProtocolError::Violation("client frame not masked"));
            }
            // Server→client frames must not be masked; enforced only in
            // strict mode.
            Role::Client if masked && self.strict => {
                return Err(ProtocolError::Violation("masked server frame"));
            }
            _ => {}
        }

        let len7 = b1 & 0x7F;
        let (payload_len, extra) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 2)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(bytes);
                if len & (1 << 63) != 0 {
                    return Err(ProtocolError::Violation("length high bit set"));
                }
                (len, 8)
            }
            n => (u64::from(n), 0),
        };

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::Violation("fragmented control frame"));
            }
            if payload_len > 125 {
                return Err(ProtocolError::Violation("control payload exceeds 125 bytes"));
            }
        }

        if payload_len > self.max_payload as u64 {
            return Err(ProtocolError::Oversized {
                len: payload_len,
                max: self.max_payload,
            });
        }
        let payload_len = payload_len as usize;

        let header = 2 + extra + if masked { 4 } else { 0 };
        let total = header + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = buf[header..total].to_vec();
        if masked {
            let key = [
                buf[2 + extra],
                buf[3 + extra],
                buf[4 + extra],
                buf[5 + extra],
            ];
            apply_mask(&mut payload, key);
        }

        Ok(Some((
            Frame {
                fin,
                opcode,
                payload,
            },
            total,
        )))
    }

    /// Encodes a frame, masking the payload with a fresh random key when
    /// `mask` is set (client→server direction).
    pub fn encode(&self, frame: &Frame, mask: bool) -> Result<Vec<u8>, ProtocolError> {
        let len = frame.payload.len();
        if len > self.max_payload {
            return Err(ProtocolError::Oversized {
                len: len as u64,
                max: self.max_payload,
            });
        }
        if frame.opcode.is_control() && (!frame.fin || len > 125) {
            return Err(ProtocolError::Violation("invalid control frame"));
        }

        let mut out = Vec::with_capacity(14 + len);
        out.push((u8::from(frame.fin) << 7) | frame.opcode.bits());

        let mask_bit = if mask { 0x80 } else { 0 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if mask {
            // Fresh cryptographic key per frame; keys are never reused.
            let mut key = [0u8; 4];
            OsRng.fill_bytes(&mut key);
            out.extend_from_slice(&key);

            let start = out.len();
            out.extend_from_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        } else {
            out.extend_from_slice(&frame.payload);
        }

        Ok(out)
    }
}

/// A complete, reassembled data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `Text` or `Binary`.
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn is_text(&self) -> bool {
        self.opcode == Opcode::Text
    }

    /// Text payload as `&str`; `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }
}

/// Tracks the current message opcode across fragments and reassembles
/// payloads. Control frames must be handled before reaching the assembler.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    current: Option<Opcode>,
    payload: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a fragmented message is being collected.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Feeds a data frame; returns the completed message on a final
    /// fragment.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        debug_assert!(!frame.opcode.is_control(), "control frame in assembler");

        match frame.opcode {
            Opcode::Continuation => {
                let Some(opcode) = self.current else {
                    return Err(ProtocolError::Violation(
                        "continuation without a preceding data frame",
                    ));
                };
                self.payload.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.current = None;
                    let payload = std::mem::take(&mut self.payload);
                    Ok(Some(Self::complete(opcode, payload)?))
                } else {
                    Ok(None)
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.current.is_some() {
                    return Err(ProtocolError::Violation(
                        "new data frame inside a fragmented message",
                    ));
                }
                if frame.fin {
                    Ok(Some(Self::complete(frame.opcode, frame.payload)?))
                } else {
                    self.current = Some(frame.opcode);
                    self.payload = frame.payload;
                    Ok(None)
                }
            }
            _ => Err(ProtocolError::Violation("control frame in data stream")),
        }
    }

    fn complete(opcode: Opcode, payload: Vec<u8>) -> Result<Message, ProtocolError> {
        if opcode == Opcode::Text && std::str::from_utf8(&payload).is_err() {
            return Err(ProtocolError::Utf8);
        }
        Ok(Message { opcode, payload })
    }
}
