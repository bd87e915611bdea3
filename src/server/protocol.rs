// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-adapter protocol parser (§3 `BindAdapter.protocol_parser`, §4.7.2).
//!
//! Each adapter names a `protocol` (default `tars`, §6) and is bound to a
//! parser that repeatedly splits accumulated wire bytes into whole request
//! frames. The wire protocol itself is out of this crate's scope (§1 names
//! "pluggable transports" as covered but the actual `tars` binary encoding
//! as a generated-stub concern); [`LengthPrefixed`] is the reference
//! implementation instantiated by the `protocol` config default so adapters
//! are runnable end-to-end without a generated codec.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Splits accumulated connection bytes into whole request frames.
///
/// Implementations must be side-effect free beyond consuming `buf`: a
/// malformed frame closes the connection (§7, error kind 4), it never
/// desyncs and tries to resynchronize.
pub trait ProtocolParser: Send + Sync {
    /// Attempts to extract one complete frame from the front of `buf`,
    /// advancing `buf` past it. Returns `Ok(None)` if `buf` holds only a
    /// partial frame so far.
    fn parse_one(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError>;

    /// Frames every whole request currently buffered.
    fn parse_all(&self, buf: &mut BytesMut) -> Result<Vec<Bytes>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(frame) = self.parse_one(buf)? {
            out.push(frame);
        }
        Ok(out)
    }
}

/// A 4-byte big-endian length prefix followed by the payload, the simplest
/// self-framing wire format and the stand-in for the `tars` protocol name
/// (§6's `protocol` default).
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthPrefixed {
    pub max_frame_len: usize,
}

impl LengthPrefixed {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl ProtocolParser for LengthPrefixed {
    fn parse_one(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        const PREFIX_LEN: usize = 4;
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[..PREFIX_LEN].try_into().expect("checked len")) as usize;
        if self.max_frame_len != 0 && len > self.max_frame_len {
            return Err(ProtocolError::Malformed(format!(
                "frame length {len} exceeds max {}",
                self.max_frame_len
            )));
        }
        if buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        buf.advance(PREFIX_LEN);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

/// Prefixes `payload` with its 4-byte big-endian length, the inverse of
/// [`LengthPrefixed::parse_one`]; used by the handle thread to frame a
/// reply and by the client to frame an outbound request.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}
