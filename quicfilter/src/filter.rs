//! The HTTP/3 protocol filter.
//!
//! One [`H3Filter`] owns one QUIC connection and multiplexes the request
//! streams of many transfers over it. Every call names the transfer it is
//! made for and takes the scheduler to wake transfers with. A call on
//! behalf of one transfer may advance, or fail, the streams of others as a
//! side effect of packet processing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use quicfilter_h3::Shutdown;
use tracing::{debug, info, trace, warn};

use crate::config::FilterConfig;
use crate::engine::Engine;
use crate::error::{EngineError, FilterError};
use crate::flow;
use crate::pump::SendBuffer;
use crate::request::RequestParser;
use crate::scheduler::{Interest, Scheduler, Timer};
use crate::socket::PacketSocket;
use crate::stream::{H3Stream, StreamState};
use crate::transfer::{Transfer, TransferId};

/// HTTP/3 over one QUIC connection, for many transfers.
pub struct H3Filter<E: Engine, S: PacketSocket> {
    pub(crate) config: FilterConfig,
    pub(crate) engine: E,
    pub(crate) socket: S,
    pub(crate) streams: HashMap<TransferId, H3Stream>,
    /// Owner of each opened engine stream.
    pub(crate) by_stream: HashMap<u64, TransferId>,
    pub(crate) sendbuf: SendBuffer,
    pub(crate) scratch: Vec<u8>,
    pub(crate) started_at: Option<Instant>,
    pub(crate) handshake_at: Option<Instant>,
    pub(crate) first_byte_at: Option<Instant>,
    pub(crate) connected: bool,
    pub(crate) goaway: bool,
    pub(crate) shutdown_started: bool,
    pub(crate) data_recvd: u64,
}

impl<E: Engine, S: PacketSocket> H3Filter<E, S> {
    pub fn new(config: FilterConfig, engine: E, socket: S) -> Result<Self, FilterError> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            socket,
            streams: HashMap::new(),
            by_stream: HashMap::new(),
            sendbuf: SendBuffer::default(),
            scratch: Vec::with_capacity(1500),
            started_at: None,
            handshake_at: None,
            first_byte_at: None,
            connected: false,
            goaway: false,
            shutdown_started: false,
            data_recvd: 0,
        })
    }

    // ── Connection setup ────────────────────────────────────────────

    /// Drive the handshake. Returns true once the connection is ready for
    /// requests.
    pub fn connect(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
    ) -> Result<bool, FilterError> {
        if self.connected {
            return Ok(true);
        }
        let result = self.drive_handshake(transfer.id, sched);
        if let Err(e) = &result
            && !e.is_again()
        {
            info!(peer = %self.socket.peer_addr(), error = %e, "QUIC connect failed");
        }
        result
    }

    fn drive_handshake(
        &mut self,
        transfer: TransferId,
        sched: &mut dyn Scheduler,
    ) -> Result<bool, FilterError> {
        let Some(started_at) = self.started_at else {
            self.started_at = Some(Instant::now());
            self.flush_egress(transfer, sched)?;
            info!(peer = %self.socket.peer_addr(), alpn = "h3", "sent QUIC client Initial");
            return Ok(false);
        };

        self.process_ingress(transfer, sched)?;
        self.flush_egress(transfer, sched)?;

        if self.engine.is_established() {
            let now = Instant::now();
            self.handshake_at = Some(now);
            debug!(
                elapsed_ms = now.saturating_duration_since(started_at).as_millis() as u64,
                "QUIC handshake complete"
            );
            self.engine
                .verify_peer()
                .map_err(FilterError::PeerVerification)?;
            self.engine
                .open_h3()
                .map_err(|e| FilterError::Protocol(e.to_string()))?;
            self.connected = true;
            info!(peer = %self.socket.peer_addr(), "HTTP/3 connection established");
            Ok(true)
        } else if self.engine.is_draining() {
            Err(FilterError::WeirdServerReply)
        } else {
            Ok(false)
        }
    }

    // ── Transfers ───────────────────────────────────────────────────

    /// Create the stream entry for a transfer.
    pub fn setup_transfer(&mut self, transfer: &Transfer) -> Result<(), FilterError> {
        self.stream_entry(transfer.id).map(|_| ())
    }

    fn stream_entry(&mut self, id: TransferId) -> Result<&mut H3Stream, FilterError> {
        let (max_line, max_block) = (self.config.max_header_line, self.config.max_header_block);
        let slots = self.config.segment_slots;
        match self.streams.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let stream = H3Stream::new(RequestParser::new(max_line, max_block), slots)?;
                trace!(transfer = %id, "stream set up");
                Ok(entry.insert(stream))
            }
        }
    }

    /// The transfer is finished with its stream: shut it down in both
    /// directions, then drop it together with whatever it still buffers.
    pub fn done_transfer(&mut self, transfer: &Transfer, sched: &mut dyn Scheduler) {
        let id = transfer.id;
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        trace!(transfer = %id, stream = stream.log_id(), "transfer done");

        let mut shut = false;
        if let Some(sid) = stream.id
            && self.engine.has_h3()
        {
            // The session ignores a shutdown of a side that is already over.
            let code = self.config.no_error_code;
            for how in [Shutdown::Read, Shutdown::Write] {
                if let Err(e) = self.engine.shutdown_stream(sid, how, code) {
                    trace!(stream = sid, ?how, error = %e, "stream shutdown failed");
                }
            }
            stream.closed = true;
            stream.send_closed = true;
            shut = true;
        }
        if shut && let Err(e) = self.flush_egress(id, sched) {
            trace!(transfer = %id, error = %e, "flush after stream shutdown failed");
        }

        if let Some(stream) = self.streams.remove(&id) {
            if let Some(sid) = stream.id {
                self.by_stream.remove(&sid);
            }
            stream.recvbuf.release_all(drop);
        }
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send request bytes: the request head in HTTP/1.1 form, then body.
    ///
    /// Returns how many bytes of `buf` were taken. The stream opens once
    /// the whole head has been seen; bytes after it go out as body.
    pub fn send(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
        buf: &[u8],
        eos: bool,
    ) -> Result<usize, FilterError> {
        let id = transfer.id;
        self.ran(id);
        let result = self.send_inner(id, sched, buf, eos);
        let result = match self.flush_egress(id, sched) {
            Err(e) => Err(e),
            Ok(()) => result,
        };
        trace!(transfer = %id, len = buf.len(), eos, ?result, "send");
        result
    }

    fn send_inner(
        &mut self,
        id: TransferId,
        sched: &mut dyn Scheduler,
        buf: &[u8],
        eos: bool,
    ) -> Result<usize, FilterError> {
        self.process_ingress(id, sched)?;
        if self.engine.is_closed() {
            return Err(self.closed_error());
        }

        let Some(stream) = self.streams.get(&id).filter(|s| s.opened || s.closed) else {
            return self.open_stream(id, buf, eos);
        };
        if stream.closed {
            if stream.resp_hds_complete {
                // The response is complete; the server wants no more.
                trace!(transfer = %id, len = buf.len(), "discarding body for closed stream");
                return Ok(buf.len());
            }
            return Err(FilterError::StreamClosed);
        }
        self.send_body(id, buf, eos)
    }

    fn open_stream(&mut self, id: TransferId, buf: &[u8], eos: bool) -> Result<usize, FilterError> {
        self.stream_entry(id)?;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(FilterError::UnknownTransfer(id));
        };

        let consumed = match stream.blocked_head.take() {
            Some(head) => head.min(buf.len()),
            None => stream.parser.feed(buf)?,
        };
        let headers = match stream.parser.request() {
            Some(request) => request.to_h3_headers(&self.config.default_scheme)?,
            None => return Ok(consumed),
        };

        let fin = eos && consumed == buf.len();
        let sid = match self.engine.send_request(&headers, fin) {
            Ok(sid) => sid,
            Err(EngineError::StreamBlocked) => {
                stream.blocked_head = Some(consumed);
                flow::block(stream, id);
                return Err(FilterError::Again);
            }
            Err(e) => {
                warn!(transfer = %id, error = %e, "cannot open request stream");
                stream.mark_failed();
                return Err(FilterError::Send(e.to_string()));
            }
        };
        stream.id = Some(sid);
        self.by_stream.insert(sid, id);
        stream.opened = true;
        stream.send_closed = fin;
        stream.flow_blocked = false;

        debug!(transfer = %id, stream = sid, fin, "request stream opened");
        for field in &headers {
            info!(
                stream = sid,
                "[{}: {}]",
                String::from_utf8_lossy(&field.name),
                String::from_utf8_lossy(&field.value)
            );
        }

        let mut taken = consumed;
        if consumed > 0 && consumed < buf.len() {
            match self.send_body(id, &buf[consumed..], eos) {
                Ok(n) => taken += n,
                Err(FilterError::Again) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(taken)
    }

    fn send_body(&mut self, id: TransferId, buf: &[u8], eos: bool) -> Result<usize, FilterError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(FilterError::UnknownTransfer(id))?;
        let sid = stream.id.ok_or(FilterError::InvalidStreamState)?;

        let blocked = match self.engine.send_body(sid, buf, eos) {
            Ok(0) if !buf.is_empty() => true,
            Ok(n) => {
                if eos && n == buf.len() {
                    stream.send_closed = true;
                }
                return Ok(n);
            }
            Err(EngineError::Done) => true,
            Err(EngineError::InvalidStreamState) => return Err(FilterError::InvalidStreamState),
            Err(EngineError::FinalSize) => return Err(FilterError::FinalSize),
            Err(e) => return Err(FilterError::Send(e.to_string())),
        };
        if blocked && !self.engine.stream_writable(sid, buf.len()) {
            flow::block(stream, id);
        }
        Err(FilterError::Again)
    }

    /// The transfer has no more request bytes; finish the send side.
    pub fn done_send(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
    ) -> Result<(), FilterError> {
        let pending = self.streams.get(&transfer.id).is_some_and(|s| !s.send_closed);
        if !pending {
            return Ok(());
        }
        trace!(transfer = %transfer.id, "done sending");
        self.send(transfer, sched, &[], true).map(|_| ())
    }

    // ── Receiving ───────────────────────────────────────────────────

    /// Read response bytes: the rendered response head, then body.
    ///
    /// `Ok(0)` is the end of the response.
    pub fn recv(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
        buf: &mut [u8],
    ) -> Result<usize, FilterError> {
        let id = transfer.id;
        if !self.streams.contains_key(&id) {
            return Err(FilterError::UnknownTransfer(id));
        }
        self.ran(id);
        let result = self.recv_inner(transfer, sched, buf);
        let result = match self.flush_egress(id, sched) {
            Err(e) => Err(e),
            Ok(()) => result,
        };
        if let Ok(n) = result {
            self.data_recvd += n as u64;
        }
        trace!(transfer = %id, len = buf.len(), ?result, "recv");
        result
    }

    fn recv_inner(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
        buf: &mut [u8],
    ) -> Result<usize, FilterError> {
        let id = transfer.id;
        let mut nread = self.try_filling(id, buf)?;
        self.process_ingress(id, sched)?;
        if nread == 0 {
            nread = self.try_filling(id, buf)?;
        }

        let closed = self.streams.get(&id).is_some_and(|s| s.closed);
        if nread > 0 {
            if closed {
                self.drain_stream(id, sched);
            }
            Ok(nread)
        } else if closed {
            self.recv_closed_stream(transfer)
        } else if self.engine.is_closed() {
            Err(self.closed_error())
        } else if self.engine.is_draining() {
            Err(FilterError::Draining)
        } else {
            Err(FilterError::Again)
        }
    }

    /// Copy from the stream's queue if it holds anything, otherwise straight
    /// from the engine's body buffer.
    fn try_filling(&mut self, id: TransferId, buf: &mut [u8]) -> Result<usize, FilterError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(FilterError::UnknownTransfer(id))?;
        if !stream.recvbuf.is_empty() {
            return Ok(stream.recvbuf.fill(buf));
        }
        // Body bytes never go out ahead of the rendered head.
        let Some(sid) = stream.id.filter(|_| stream.resp_hds_complete) else {
            return Ok(0);
        };
        if self.engine.copies_body() {
            return Ok(0);
        }

        let n = match self.engine.peek_body(sid) {
            Ok(body) => {
                let n = body.len().min(buf.len());
                buf[..n].copy_from_slice(&body[..n]);
                n
            }
            Err(EngineError::Done) => return Ok(0),
            Err(e) => {
                stream.mark_failed();
                return Err(FilterError::Recv(e.to_string()));
            }
        };
        if n > 0
            && let Err(e) = self.engine.body_consumed(sid, n)
        {
            stream.mark_failed();
            return Err(FilterError::Recv(e.to_string()));
        }
        Ok(n)
    }

    fn recv_closed_stream(&mut self, transfer: &Transfer) -> Result<usize, FilterError> {
        let Some(stream) = self.streams.get(&transfer.id) else {
            return Err(FilterError::UnknownTransfer(transfer.id));
        };
        let stream_id = stream.id.unwrap_or_default();
        if stream.reset {
            warn!(
                transfer = %transfer.id,
                stream = stream_id,
                code = stream.error3,
                "stream reset by server"
            );
            return Err(FilterError::StreamReset {
                stream_id,
                partial: transfer.bytecount > 0,
            });
        }
        if !stream.resp_got_header {
            warn!(
                transfer = %transfer.id,
                stream = stream_id,
                "stream closed cleanly before response headers"
            );
            return Err(FilterError::ClosedBeforeHeaders { stream_id });
        }
        trace!(transfer = %transfer.id, stream = stream_id, "end of response");
        Ok(0)
    }

    /// The connection-fatal error for a connection the engine closed.
    pub(crate) fn closed_error(&self) -> FilterError {
        if self.engine.is_timed_out() {
            FilterError::IdleTimeout
        } else {
            FilterError::ConnectionClosed
        }
    }

    /// The transfer is running now; its earlier wake-up was used.
    fn ran(&mut self, id: TransferId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.select = Interest::NONE;
        }
    }

    // ── Event loop integration ──────────────────────────────────────

    /// Socket interest for the transfer, given what it would like.
    pub fn adjust_pollset(&mut self, transfer: &Transfer, want: Interest) -> Interest {
        let exhausted = match self.streams.get(&transfer.id) {
            Some(stream) if want.write && stream.opened => {
                stream.flow_blocked
                    || stream
                        .id
                        .is_some_and(|sid| !self.engine.stream_writable(sid, 1))
            }
            _ => false,
        };
        let interest = flow::pollset(want, exhausted, !self.sendbuf.is_empty());
        if exhausted {
            trace!(transfer = %transfer.id, ?interest, "stream window exhausted");
        }
        interest
    }

    /// True while the transfer has a stream here.
    pub fn data_pending(&self, transfer: &Transfer) -> bool {
        self.streams.contains_key(&transfer.id)
    }

    /// Flush pending packets on behalf of an idle transfer.
    pub fn idle(&mut self, transfer: &Transfer, sched: &mut dyn Scheduler) -> Result<(), FilterError> {
        let open = self.streams.get(&transfer.id).is_some_and(|s| s.opened && !s.closed);
        if open {
            self.flush_egress(transfer.id, sched)
        } else {
            Ok(())
        }
    }

    /// The transfer resumed receiving.
    pub fn unpause(&mut self, transfer: &Transfer, sched: &mut dyn Scheduler) {
        self.drain_stream(transfer.id, sched);
        sched.expire(transfer.id, Duration::ZERO, Timer::RunNow);
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close the connection gracefully. Returns true once the close went
    /// out, or the connection is gone anyway.
    pub fn shutdown(
        &mut self,
        transfer: &Transfer,
        sched: &mut dyn Scheduler,
    ) -> Result<bool, FilterError> {
        if self.engine.is_closed() {
            return Ok(true);
        }
        if !self.shutdown_started {
            self.shutdown_started = true;
            let reason = self.config.shutdown_reason.as_bytes();
            match self
                .engine
                .close(Instant::now(), true, self.config.no_error_code, reason)
            {
                Ok(()) | Err(EngineError::Done) => {}
                Err(e) => return Err(FilterError::Send(e.to_string())),
            }
            debug!(transfer = %transfer.id, "connection shutdown started");
        }
        match self.flush_egress(transfer.id, sched) {
            Ok(()) => Ok(self.sendbuf.is_empty()),
            Err(_) if self.engine.is_closed() => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Shut down best-effort and drop every stream.
    pub fn close(&mut self, transfer: &Transfer, sched: &mut dyn Scheduler) {
        if let Err(e) = self.shutdown(transfer, sched) {
            debug!(error = %e, "shutdown on close failed");
        }
        for (_, stream) in self.streams.drain() {
            stream.recvbuf.release_all(drop);
        }
        self.by_stream.clear();
        self.connected = false;
    }

    /// Whether the connection can take another transfer.
    pub fn is_alive(&mut self, transfer: &Transfer, sched: &mut dyn Scheduler) -> bool {
        if self.engine.is_closed() {
            if self.engine.is_timed_out() {
                debug!("connection timed out");
            } else {
                debug!("connection closed");
            }
            return false;
        }
        match self.socket.input_pending() {
            Ok(false) => true,
            Ok(true) => match self.process_ingress(transfer.id, sched) {
                Ok(()) => !self.engine.is_closed(),
                Err(e) => {
                    debug!(error = %e, "connection failed while idle");
                    false
                }
            },
            Err(e) => {
                debug!(error = %e, "socket failed while idle");
                false
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Streams in use plus those the server still allows, unless a GOAWAY
    /// arrived.
    pub fn max_concurrent(&self) -> u64 {
        let mut n = self.streams.len() as u64;
        if !self.goaway {
            n = n.saturating_add(self.engine.peer_streams_left_bidi());
        }
        n.min(i32::MAX as u64)
    }

    /// Milliseconds from the first packet sent to the first one received.
    pub fn connect_reply_ms(&self) -> Option<u64> {
        let (Some(started), Some(first)) = (self.started_at, self.first_byte_at) else {
            return None;
        };
        Some(u64::try_from(first.saturating_duration_since(started).as_millis()).unwrap_or(u64::MAX))
    }

    /// When the first packet from the server arrived.
    pub fn connect_time(&self) -> Option<Instant> {
        self.first_byte_at
    }

    /// When the handshake completed.
    pub fn appconnect_time(&self) -> Option<Instant> {
        self.handshake_at
    }

    pub fn http_version(&self) -> u32 {
        30
    }

    /// Bytes handed to transfers by `recv`, rendered response heads
    /// included.
    pub fn data_recvd(&self) -> u64 {
        self.data_recvd
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn goaway_received(&self) -> bool {
        self.goaway
    }

    pub fn stream_state(&self, transfer: &Transfer) -> Option<StreamState> {
        self.streams.get(&transfer.id).map(H3Stream::state)
    }

    pub fn stream_id(&self, transfer: &Transfer) -> Option<u64> {
        self.streams.get(&transfer.id).and_then(|s| s.id)
    }

    pub fn is_flow_blocked(&self, transfer: &Transfer) -> bool {
        self.streams
            .get(&transfer.id)
            .is_some_and(|s| s.flow_blocked)
    }

    /// Number of transfers with a stream.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }
}

impl<E: Engine, S: PacketSocket> std::fmt::Debug for H3Filter<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Filter")
            .field("peer", &self.socket.peer_addr())
            .field("connected", &self.connected)
            .field("streams", &self.streams.len())
            .field("goaway", &self.goaway)
            .finish()
    }
}
