//! HTTP/3 frame encoding/decoding and QUIC variable-length integer codec.
//!
//! HTTP/3 frames consist of a varint type, varint length, and payload.
//! Control-stream frames are small and decoded whole with [`decode_frame`];
//! request streams are parsed header-first with [`decode_frame_header`] so
//! DATA payloads can be handed on without copying.

use bytes::Bytes;

use crate::error::H3Error;
use crate::settings::Settings;

// ── Frame type constants (RFC 9114 Section 7.2) ─────────────────────

pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_CANCEL_PUSH: u64 = 0x03;
pub const FRAME_SETTINGS: u64 = 0x04;
pub const FRAME_PUSH_PROMISE: u64 = 0x05;
pub const FRAME_GOAWAY: u64 = 0x07;
pub const FRAME_MAX_PUSH_ID: u64 = 0x0d;

/// HTTP/2 frame types that MUST NOT appear in HTTP/3 (RFC 9114 Section 7.2.8).
const RESERVED_H2_TYPES: &[u64] = &[0x02, 0x06, 0x08, 0x09];

// ── QUIC Variable-Length Integer (RFC 9000 Section 16) ──────────────

/// Encode a QUIC variable-length integer into `buf`.
///
/// Values 0..2^6 use 1 byte, 2^6..2^14 use 2, 2^14..2^30 use 4, 2^30..2^62 use 8.
pub fn encode_varint(buf: &mut Vec<u8>, value: u64) {
    debug_assert!(value < (1 << 62), "varint value too large");
    let len = varint_len(value);
    let tag: u8 = match len {
        1 => 0x00,
        2 => 0x40,
        4 => 0x80,
        _ => 0xc0,
    };
    let bytes = value.to_be_bytes();
    let start = buf.len();
    buf.extend_from_slice(&bytes[8 - len..]);
    buf[start] |= tag;
}

/// Decode a QUIC variable-length integer from the start of `buf`.
///
/// Returns `(value, bytes_consumed)` or `None` if the buffer is too short.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = 1usize << (first >> 6);
    let bytes = buf.get(..len)?;
    let value = bytes[1..]
        .iter()
        .fold(u64::from(first & 0x3f), |acc, &b| (acc << 8) | u64::from(b));
    Some((value, len))
}

/// Returns the encoded byte length for a varint value (1, 2, 4, or 8).
pub fn varint_len(value: u64) -> usize {
    match value {
        0..0x40 => 1,
        0x40..0x4000 => 2,
        0x4000..0x4000_0000 => 4,
        _ => 8,
    }
}

// ── Frame types ─────────────────────────────────────────────────────

/// An HTTP/3 frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// DATA frame (type 0x00): carries request or response body.
    Data { payload: Bytes },
    /// HEADERS frame (type 0x01): QPACK-encoded field section.
    Headers { encoded: Bytes },
    /// SETTINGS frame (type 0x04): configuration parameters.
    Settings(Settings),
    /// GOAWAY frame (type 0x07): the first request stream id the server
    /// will not process.
    GoAway { stream_id: u64 },
    /// Frame types this client neither sends nor acts on.
    Unknown { frame_type: u64, payload: Bytes },
}

/// Type and payload length of a frame whose payload may not have arrived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u64,
    pub len: u64,
}

// ── Frame encoding ──────────────────────────────────────────────────

/// Encode a frame header (type + length varints) into `buf`.
pub fn encode_frame_header(buf: &mut Vec<u8>, frame_type: u64, payload_len: u64) {
    encode_varint(buf, frame_type);
    encode_varint(buf, payload_len);
}

/// Byte length of a frame header for `frame_type` with `payload_len`.
pub fn frame_header_len(frame_type: u64, payload_len: u64) -> usize {
    varint_len(frame_type) + varint_len(payload_len)
}

impl Frame {
    /// Encode this frame into `buf` (header + payload).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data { payload } => {
                encode_frame_header(buf, FRAME_DATA, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
            Frame::Headers { encoded } => {
                encode_frame_header(buf, FRAME_HEADERS, encoded.len() as u64);
                buf.extend_from_slice(encoded);
            }
            Frame::Settings(settings) => {
                encode_frame_header(buf, FRAME_SETTINGS, settings.encoded_len() as u64);
                settings.encode(buf);
            }
            Frame::GoAway { stream_id } => {
                encode_frame_header(buf, FRAME_GOAWAY, varint_len(*stream_id) as u64);
                encode_varint(buf, *stream_id);
            }
            Frame::Unknown {
                frame_type,
                payload,
            } => {
                encode_frame_header(buf, *frame_type, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
        }
    }
}

// ── Frame decoding ──────────────────────────────────────────────────

/// Decode a frame header from the start of `buf`.
///
/// Returns `Ok(None)` while the header is incomplete. Reserved HTTP/2
/// frame types are rejected as soon as their type is known.
pub fn decode_frame_header(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, H3Error> {
    let Some((frame_type, type_len)) = decode_varint(buf) else {
        return Ok(None);
    };
    if RESERVED_H2_TYPES.contains(&frame_type) {
        return Err(H3Error::FrameUnexpected);
    }
    let Some((len, len_len)) = decode_varint(&buf[type_len..]) else {
        return Ok(None);
    };
    Ok(Some((FrameHeader { frame_type, len }, type_len + len_len)))
}

/// Decode one complete frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` on success,
/// `Ok(None)` if the buffer is incomplete (need more data),
/// or `Err` on protocol error.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, H3Error> {
    let Some((header, header_len)) = decode_frame_header(buf)? else {
        return Ok(None);
    };
    let total_len = header_len
        .checked_add(usize::try_from(header.len).map_err(|_| H3Error::FrameError)?)
        .ok_or(H3Error::FrameError)?;
    let Some(payload) = buf.get(header_len..total_len) else {
        return Ok(None);
    };

    let frame = match header.frame_type {
        FRAME_DATA => Frame::Data {
            payload: Bytes::copy_from_slice(payload),
        },
        FRAME_HEADERS => Frame::Headers {
            encoded: Bytes::copy_from_slice(payload),
        },
        FRAME_SETTINGS => Frame::Settings(Settings::decode(payload).ok_or(H3Error::FrameError)?),
        FRAME_GOAWAY => {
            let (stream_id, n) = decode_varint(payload).ok_or(H3Error::FrameError)?;
            if n != payload.len() {
                return Err(H3Error::FrameError);
            }
            Frame::GoAway { stream_id }
        }
        frame_type => Frame::Unknown {
            frame_type,
            payload: Bytes::copy_from_slice(payload),
        },
    };

    Ok(Some((frame, total_len)))
}
