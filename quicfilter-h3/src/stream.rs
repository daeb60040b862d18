//! Per-stream state for client request streams.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};
use quicfilter_quic::StreamId;

use crate::error::H3Error;
use crate::frame::{self, FrameHeader};
use crate::qpack::{self, HeaderField};

/// Longest possible frame header: two 8-byte varints.
const MAX_FRAME_HEADER: usize = 16;

/// HTTP/3 events surfaced per stream by [`H3Client::poll`](crate::H3Client::poll).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Event {
    /// A complete field section: the response headers, an informational
    /// response, or trailers.
    Headers { headers: Vec<HeaderField> },
    /// Body bytes became available after the buffer had been empty.
    Data,
    /// The server finished the stream and every body byte was consumed.
    Finished,
    /// The server reset the stream with this application error code.
    Reset(u64),
    /// The server will not process requests on this stream id or later.
    GoAway,
}

/// Where the receive-side frame parser stands.
#[derive(Debug)]
enum RecvState {
    /// Collecting the bytes of the next frame header.
    FrameHeader(Vec<u8>),
    /// Collecting a QPACK-encoded field section.
    Headers { remaining: usize, block: Vec<u8> },
    /// Passing DATA payload through to the body buffer.
    Data { remaining: u64 },
    /// Discarding an unknown frame.
    Skip { remaining: u64 },
}

pub(crate) struct RequestStream {
    pub id: StreamId,

    // ── send side ──
    /// Bytes accepted from the caller but not yet taken by QUIC.
    pub pending: VecDeque<Bytes>,
    /// FIN is owed once `pending` drains.
    pub fin_pending: bool,
    /// FIN handed to QUIC.
    pub local_fin: bool,
    /// The last write was refused for lack of credit.
    pub send_blocked: bool,

    // ── receive side ──
    state: RecvState,
    /// Zero-copy slices of DATA payload, in order.
    body: VecDeque<Bytes>,
    pub body_len: usize,
    /// Number of field sections seen.
    sections: u32,
    data_seen: bool,
    trailers_seen: bool,
    /// QUIC reported the end of the stream.
    pub remote_fin: bool,
    finished_emitted: bool,
    pub reset: Option<u64>,
    /// The application stopped reading.
    pub read_shut: bool,
}

impl RequestStream {
    pub fn new(id: StreamId) -> Self {
        Self {
            id,
            pending: VecDeque::new(),
            fin_pending: false,
            local_fin: false,
            send_blocked: false,
            state: RecvState::FrameHeader(Vec::with_capacity(MAX_FRAME_HEADER)),
            body: VecDeque::new(),
            body_len: 0,
            sections: 0,
            data_seen: false,
            trailers_seen: false,
            remote_fin: false,
            finished_emitted: false,
            reset: None,
            read_shut: false,
        }
    }

    pub fn key(&self) -> u64 {
        u64::from(self.id)
    }

    /// No more bytes need to be pulled from QUIC for this stream.
    pub fn read_done(&self) -> bool {
        self.remote_fin || self.reset.is_some() || self.read_shut
    }

    /// Largest read that cannot overshoot the body buffer by more than
    /// framing overhead.
    pub fn read_limit(&self, room: usize) -> usize {
        match self.state {
            RecvState::Data { remaining } | RecvState::Skip { remaining } => {
                clamp(room, remaining)
            }
            RecvState::FrameHeader(_) | RecvState::Headers { .. } => room,
        }
    }

    /// Both directions are over; the entry can be dropped.
    pub fn is_retired(&self) -> bool {
        let read_over = self.read_shut || self.finished_emitted || self.reset.is_some();
        read_over && self.local_fin
    }

    /// Run the frame parser over a chunk read from QUIC.
    pub fn feed(
        &mut self,
        mut chunk: Bytes,
        max_section: usize,
        events: &mut VecDeque<(u64, H3Event)>,
    ) -> Result<(), H3Error> {
        while !chunk.is_empty() {
            match &mut self.state {
                RecvState::FrameHeader(partial) => {
                    let before = partial.len();
                    let take = chunk.len().min(MAX_FRAME_HEADER - before);
                    partial.extend_from_slice(&chunk[..take]);
                    match frame::decode_frame_header(partial)? {
                        Some((header, n)) => {
                            chunk.advance(n - before);
                            self.state = self.next_state(header, max_section)?;
                        }
                        None => chunk.advance(take),
                    }
                }
                RecvState::Headers { remaining, block } => {
                    let take = chunk.len().min(*remaining);
                    block.extend_from_slice(&chunk.split_to(take));
                    *remaining -= take;
                    if *remaining == 0 {
                        let headers = qpack::decode(block)?;
                        self.state = RecvState::FrameHeader(Vec::new());
                        events.push_back((self.key(), H3Event::Headers { headers }));
                    }
                }
                RecvState::Data { remaining } => {
                    let take = clamp(chunk.len(), *remaining);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = RecvState::FrameHeader(Vec::new());
                    }
                    self.push_body(chunk.split_to(take), events);
                }
                RecvState::Skip { remaining } => {
                    let take = clamp(chunk.len(), *remaining);
                    chunk.advance(take);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = RecvState::FrameHeader(Vec::new());
                    }
                }
            }
        }
        Ok(())
    }

    fn next_state(
        &mut self,
        header: FrameHeader,
        max_section: usize,
    ) -> Result<RecvState, H3Error> {
        match header.frame_type {
            frame::FRAME_HEADERS => {
                if self.trailers_seen {
                    return Err(H3Error::FrameUnexpected);
                }
                let len = usize::try_from(header.len).map_err(|_| H3Error::ExcessiveLoad)?;
                if len == 0 {
                    return Err(H3Error::FrameError);
                }
                if len > max_section {
                    return Err(H3Error::ExcessiveLoad);
                }
                self.trailers_seen = self.data_seen;
                self.sections += 1;
                Ok(RecvState::Headers {
                    remaining: len,
                    block: Vec::with_capacity(len),
                })
            }
            frame::FRAME_DATA => {
                if self.sections == 0 || self.trailers_seen {
                    return Err(H3Error::FrameUnexpected);
                }
                self.data_seen = true;
                Ok(if header.len == 0 {
                    RecvState::FrameHeader(Vec::new())
                } else {
                    RecvState::Data {
                        remaining: header.len,
                    }
                })
            }
            frame::FRAME_SETTINGS
            | frame::FRAME_GOAWAY
            | frame::FRAME_MAX_PUSH_ID
            | frame::FRAME_CANCEL_PUSH
            | frame::FRAME_PUSH_PROMISE => Err(H3Error::FrameUnexpected),
            _ => Ok(if header.len == 0 {
                RecvState::FrameHeader(Vec::new())
            } else {
                RecvState::Skip {
                    remaining: header.len,
                }
            }),
        }
    }

    fn push_body(&mut self, bytes: Bytes, events: &mut VecDeque<(u64, H3Event)>) {
        if bytes.is_empty() {
            return;
        }
        let was_empty = self.body_len == 0;
        self.body_len += bytes.len();
        self.body.push_back(bytes);
        if was_empty {
            events.push_back((self.key(), H3Event::Data));
        }
    }

    /// QUIC delivered the end of the stream.
    pub fn on_remote_fin(
        &mut self,
        events: &mut VecDeque<(u64, H3Event)>,
    ) -> Result<(), H3Error> {
        self.remote_fin = true;
        match &self.state {
            RecvState::FrameHeader(partial) if partial.is_empty() => {}
            _ => return Err(H3Error::FrameError),
        }
        self.maybe_finish(events);
        Ok(())
    }

    pub fn on_reset(&mut self, code: u64, events: &mut VecDeque<(u64, H3Event)>) {
        self.reset = Some(code);
        self.body.clear();
        self.body_len = 0;
        events.push_back((self.key(), H3Event::Reset(code)));
    }

    /// Emit `Finished` once the end of stream is known and the body drained.
    pub fn maybe_finish(&mut self, events: &mut VecDeque<(u64, H3Event)>) {
        let drained = self.remote_fin && self.body_len == 0;
        if drained && !self.finished_emitted && self.reset.is_none() {
            self.finished_emitted = true;
            events.push_back((self.key(), H3Event::Finished));
        }
    }

    /// The next unread body slice.
    pub fn peek_body(&self) -> Option<&Bytes> {
        self.body.front()
    }

    /// Drop `n` bytes from the front of the body. Returns the bytes actually
    /// dropped.
    pub fn consume_body(&mut self, mut n: usize) -> usize {
        let mut dropped = 0;
        while n > 0 {
            let Some(front) = self.body.front_mut() else {
                break;
            };
            if n < front.len() {
                front.advance(n);
                dropped += n;
                break;
            }
            n -= front.len();
            dropped += front.len();
            self.body.pop_front();
        }
        self.body_len -= dropped;
        dropped
    }

    /// Copy body bytes into `out`, dropping what was copied.
    pub fn copy_body(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some(front) = self.body.front_mut() else {
                break;
            };
            let n = front.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&front[..n]);
            copied += n;
            front.advance(n);
            if front.is_empty() {
                self.body.pop_front();
            }
        }
        self.body_len -= copied;
        copied
    }

    pub fn drop_body(&mut self) {
        self.body.clear();
        self.body_len = 0;
    }
}

/// `n` limited to a frame's remaining length.
fn clamp(n: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(n, |r| n.min(r))
}
