//! Per-transfer request stream state.
//!
//! An [`H3Stream`] lives from the transfer's first send until the transfer
//! is done. It owns the request-head parser while the request is being
//! collected and, once the response arrives, a receive queue holding the
//! response head rendered as HTTP/1.1 text:
//!
//! ```text
//! HTTP/3 200 \r\n
//! content-type: text/plain\r\n
//! \r\n
//! ```
//!
//! Body bytes stay in the engine and are peeked from there, unless the
//! engine requires them to be copied out, in which case they are queued
//! here as owned chunks behind the head.

use quicfilter_bufq::{BufQueue, Chunk};
use quicfilter_h3::HeaderField;
use tracing::{debug, trace};

use crate::error::FilterError;
use crate::request::RequestParser;
use crate::scheduler::Interest;

/// Lifecycle of a request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing of the request seen yet.
    Unopened,
    /// Collecting the request head; no stream id yet.
    Opening,
    /// Request submitted under an engine stream id.
    Open,
    /// The response ended.
    Closed,
    /// The server reset the stream.
    Reset,
}

pub(crate) struct H3Stream {
    /// Engine stream id, assigned when the request head is submitted.
    pub id: Option<u64>,
    pub recvbuf: BufQueue<Vec<u8>>,
    pub parser: RequestParser,
    /// Request-head bytes of a submission refused for lack of stream
    /// credit. The caller offers the same bytes again on retry.
    pub blocked_head: Option<usize>,
    /// Application error code of a reset.
    pub error3: u64,
    pub opened: bool,
    pub closed: bool,
    pub reset: bool,
    pub send_closed: bool,
    pub resp_hds_complete: bool,
    pub resp_got_header: bool,
    pub flow_blocked: bool,
    /// Interest last reported to the scheduler.
    pub select: Interest,
}

impl H3Stream {
    pub fn new(parser: RequestParser, segment_slots: usize) -> Result<Self, FilterError> {
        Ok(Self {
            id: None,
            recvbuf: BufQueue::new(segment_slots)?,
            parser,
            blocked_head: None,
            error3: 0,
            opened: false,
            closed: false,
            reset: false,
            send_closed: false,
            resp_hds_complete: false,
            resp_got_header: false,
            flow_blocked: false,
            select: Interest::NONE,
        })
    }

    pub fn state(&self) -> StreamState {
        if self.reset {
            StreamState::Reset
        } else if self.closed {
            StreamState::Closed
        } else if self.opened {
            StreamState::Open
        } else if self.parser.is_started() {
            StreamState::Opening
        } else {
            StreamState::Unopened
        }
    }

    /// Stream id for log lines; `-1` until opened.
    pub fn log_id(&self) -> i64 {
        self.id.and_then(|id| i64::try_from(id).ok()).unwrap_or(-1)
    }

    /// Render a response field section into the receive queue.
    pub fn on_headers(&mut self, headers: &[HeaderField]) -> Result<(), FilterError> {
        if self.resp_hds_complete {
            trace!(stream = self.log_id(), fields = headers.len(), "ignoring trailers");
            return Ok(());
        }
        self.resp_got_header = true;

        let mut informational = false;
        for field in headers {
            check_field(field)?;
            if field.name == b":status" {
                informational = field.value.first() == Some(&b'1');
                self.recvbuf.write(Chunk::Static(b"HTTP/3 "))?;
                self.recvbuf.write(Chunk::Owned(field.value.clone()))?;
                self.recvbuf.write(Chunk::Static(b" \r\n"))?;
            } else {
                self.recvbuf.write(Chunk::Owned(field.name.clone()))?;
                self.recvbuf.write(Chunk::Static(b": "))?;
                self.recvbuf.write(Chunk::Owned(field.value.clone()))?;
                self.recvbuf.write(Chunk::Static(b"\r\n"))?;
            }
        }
        // A 1xx head is complete on its own; the final response follows.
        if informational {
            self.recvbuf.write(Chunk::Static(b"\r\n"))?;
        }
        debug!(stream = self.log_id(), "response headers received");
        Ok(())
    }

    /// Terminate the response head with the blank line, once.
    pub fn complete_head(&mut self) -> Result<(), FilterError> {
        if !self.resp_hds_complete {
            self.recvbuf.write(Chunk::Static(b"\r\n"))?;
            self.resp_hds_complete = true;
        }
        Ok(())
    }

    /// Queue body bytes copied out of the engine.
    pub fn push_body(&mut self, body: Vec<u8>) -> Result<(), FilterError> {
        self.recvbuf.write(Chunk::Owned(body))?;
        Ok(())
    }

    pub fn on_finished(&mut self) -> Result<(), FilterError> {
        self.complete_head()?;
        trace!(stream = self.log_id(), "response finished");
        self.closed = true;
        self.send_closed = true;
        Ok(())
    }

    pub fn on_reset(&mut self, code: u64) {
        debug!(stream = self.log_id(), code, "stream reset");
        self.error3 = code;
        self.mark_failed();
    }

    /// No more traffic in either direction.
    pub fn mark_failed(&mut self) {
        self.closed = true;
        self.reset = true;
        self.send_closed = true;
    }

    /// Socket interest the transfer has while this stream is active.
    pub fn drain_bits(&self) -> Interest {
        Interest {
            read: true,
            write: !self.send_closed,
        }
    }
}

/// CR, LF and NUL would break the rendered head.
fn check_field(field: &HeaderField) -> Result<(), FilterError> {
    let bad = |b: &u8| matches!(b, b'\r' | b'\n' | 0);
    if field.name.is_empty() || field.name.iter().any(bad) || field.value.iter().any(bad) {
        return Err(FilterError::MalformedHeaders(
            String::from_utf8_lossy(&field.name).into_owned(),
        ));
    }
    Ok(())
}

impl std::fmt::Debug for H3Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Stream")
            .field("id", &self.log_id())
            .field("state", &self.state())
            .field("send_closed", &self.send_closed)
            .field("flow_blocked", &self.flow_blocked)
            .field("queued", &self.recvbuf.len())
            .finish()
    }
}
