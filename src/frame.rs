//! Length-prefixed framing for the ship↔offshore link.
//!
//! Every byte on the link belongs to a frame:
//!
//! ```text
//! ┌────────────┬────────┬──────────────────┐
//! │ length     │ type   │ payload          │
//! │ u32 BE     │ u8     │ `length` bytes   │
//! └────────────┴────────┴──────────────────┘
//! ```
//!
//! The length counts the payload only. There are no magic bytes, no version
//! field, and no checksum; boundary recovery relies entirely on the length
//! prefix, so a single malformed header poisons the whole stream and is fatal
//! to the link.

use bytes::{BufMut, Bytes, BytesMut};
use n0_error::stack_error;

/// Size of the frame header in bytes: a 4-byte length plus a 1-byte type.
pub const HEADER_LEN: usize = 5;

/// Default cap on a single frame payload.
///
/// The wire format allows up to `u32::MAX` bytes; anything past this cap is
/// treated as a framing violation so a corrupted length prefix cannot make
/// the decoder buffer gigabytes.
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Direction marker carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Ship → offshore: a serialized HTTP request, or tunnel bytes.
    Request = 0,
    /// Offshore → ship: a serialized HTTP response, or tunnel bytes.
    Response = 1,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            _ => None,
        }
    }
}

/// One decoded frame. Payload bytes are opaque to the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: FrameType,
    pub payload: Bytes,
}

/// Violations of the framing rules. All of these are fatal to the link.
#[stack_error(derive)]
pub enum FrameError {
    /// The header carried a type byte that is neither REQUEST nor RESPONSE.
    #[error("unknown frame type {value:#04x}")]
    UnknownType { value: u8 },
    /// The header advertised a payload larger than the configured cap.
    #[error("frame payload of {len} bytes exceeds maximum of {max}")]
    Oversize { len: u32, max: u32 },
    /// Data was pushed after [`FrameDecoder::close`].
    #[error("decoder is closed")]
    Closed,
}

/// Encodes one frame into a contiguous buffer of `HEADER_LEN + payload.len()`
/// bytes.
pub fn encode_frame(ty: FrameType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(ty as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame extractor.
///
/// Fed chunk-by-chunk from a socket; accumulates partial input and yields
/// every complete frame on each push. Single-producer, single-consumer: one
/// decoder belongs to exactly one link reader.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: u32,
    closed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            max_payload,
            closed: false,
        }
    }

    /// Appends `data` and extracts as many complete frames as are now
    /// buffered. Returns an empty vec while a frame is still partial.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, FrameError> {
        if self.closed {
            return Err(FrameError::Closed);
        }
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let ty = FrameType::from_u8(self.buf[4])
            .ok_or(FrameError::UnknownType { value: self.buf[4] })?;
        if len > self.max_payload {
            return Err(FrameError::Oversize {
                len,
                max: self.max_payload,
            });
        }
        if self.buf.len() < HEADER_LEN + len as usize {
            return Ok(None);
        }
        let _ = self.buf.split_to(HEADER_LEN);
        let payload = self.buf.split_to(len as usize).freeze();
        Ok(Some(Frame { ty, payload }))
    }

    /// Drops any buffered partial frame and refuses further input.
    pub fn close(&mut self) {
        self.buf.clear();
        self.closed = true;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
