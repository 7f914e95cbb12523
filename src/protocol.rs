//! Wire frames exchanged between controllers, the bus and the terminal
//! runner.
//!
//! A frame is a single kind tag byte followed by the payload; the transport
//! (WebSocket) provides message framing, so no length prefix is needed. The
//! decoder only validates the tag — structural checks live in the typed
//! accessors so that the bus can forward any syntactically-tagged frame
//! without interpreting it.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opaque terminal bytes (controller keystrokes or child output).
    Data = 0x00,
    /// Window size change: `(cols, rows)` as two big-endian u16s.
    Resize = 0x01,
    /// Controller is prepared to render output.
    Ready = 0x02,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("invalid resize payload")]
    InvalidResize,
    #[error("expected {expected} frame, got {actual}")]
    WrongKind {
        expected: FrameKind,
        actual: FrameKind,
    },
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(FrameKind::Data),
            0x01 => Ok(FrameKind::Resize),
            0x02 => Ok(FrameKind::Ready),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameKind::Data => "data",
            FrameKind::Resize => "resize",
            FrameKind::Ready => "ready",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&cols.to_be_bytes());
        payload.extend_from_slice(&rows.to_be_bytes());
        Frame {
            kind: FrameKind::Resize,
            payload,
        }
    }

    pub fn ready() -> Self {
        Frame {
            kind: FrameKind::Ready,
            payload: Vec::new(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Parses an encoded frame. A lone tag byte is a valid frame with an
    /// empty payload.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = data.split_first().ok_or(ProtocolError::EmptyFrame)?;
        Ok(Frame {
            kind: FrameKind::from_byte(tag)?,
            payload: payload.to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decoded `(cols, rows)`; both dimensions must be at least 1.
    pub fn as_resize(&self) -> Result<(u16, u16), ProtocolError> {
        if self.kind != FrameKind::Resize || self.payload.len() < 4 {
            return Err(ProtocolError::InvalidResize);
        }
        let cols = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let rows = u16::from_be_bytes([self.payload[2], self.payload[3]]);
        if cols < 1 || rows < 1 {
            return Err(ProtocolError::InvalidResize);
        }
        Ok((cols, rows))
    }

    pub fn as_data(&self) -> Result<&[u8], ProtocolError> {
        if self.kind != FrameKind::Data {
            return Err(ProtocolError::WrongKind {
                expected: FrameKind::Data,
                actual: self.kind,
            });
        }
        Ok(&self.payload)
    }

    pub fn as_ready(&self) -> Result<(), ProtocolError> {
        if self.kind != FrameKind::Ready {
            return Err(ProtocolError::WrongKind {
                expected: FrameKind::Ready,
                actual: self.kind,
            });
        }
        Ok(())
    }
}
