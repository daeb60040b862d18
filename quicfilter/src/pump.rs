//! Packet pump and event dispatch.
//!
//! Ingress takes a bounded burst of datagrams from the socket into the
//! engine, then dispatches every protocol event to the stream it belongs
//! to. Egress ticks the engine's timer, pulls packets out of the engine,
//! coalesces full-size packets and hands them to the socket.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use quicfilter_h3::H3Event;
use tracing::{debug, trace, warn};

use crate::engine::Engine;
use crate::error::{EngineError, FilterError};
use crate::filter::H3Filter;
use crate::flow;
use crate::scheduler::{Scheduler, Timer};
use crate::socket::PacketSocket;
use crate::transfer::TransferId;

/// Outgoing packets waiting for the socket.
///
/// Every packet but the last in the buffer is exactly `segment` bytes, so
/// the buffer can go out as one segmented send.
#[derive(Debug, Default)]
pub(crate) struct SendBuffer {
    buf: Vec<u8>,
    sent: usize,
    segment: usize,
}

impl SendBuffer {
    pub fn is_empty(&self) -> bool {
        self.sent == self.buf.len()
    }

    pub fn push(&mut self, packet: &[u8], segment: usize) {
        if self.is_empty() {
            self.buf.clear();
            self.sent = 0;
            self.segment = segment.max(packet.len());
        }
        self.buf.extend_from_slice(packet);
    }

    /// Send what is buffered. Returns true when the socket would block with
    /// bytes left over.
    pub fn flush(&mut self, socket: &mut impl PacketSocket) -> Result<bool, FilterError> {
        while !self.is_empty() {
            match socket.send(&self.buf[self.sent..], self.segment) {
                Ok(0) => return Ok(true),
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(left = self.buf.len() - self.sent, "socket send would block");
                    return Ok(true);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.buf.clear();
        self.sent = 0;
        Ok(false)
    }
}

/// Feed one datagram to the engine and classify the outcome.
fn recv_packet<E: Engine>(
    engine: &mut E,
    packet: &[u8],
    from: SocketAddr,
) -> Result<(), FilterError> {
    match engine.recv_packet(Instant::now(), packet, from) {
        Ok(n) if n < packet.len() => {
            trace!(len = packet.len(), consumed = n, "packet partially consumed");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(EngineError::Done) if engine.is_closed() => Err(FilterError::ConnectionClosed),
        Err(EngineError::Done) if engine.is_draining() => Err(FilterError::Draining),
        Err(EngineError::Done) => Ok(()),
        Err(EngineError::TlsFail) => match engine.verify_peer() {
            Err(reason) => Err(FilterError::PeerVerification(reason)),
            Ok(()) => Err(FilterError::Recv("TLS handshake failed".into())),
        },
        Err(e) => Err(FilterError::Recv(e.to_string())),
    }
}

impl<E: Engine, S: PacketSocket> H3Filter<E, S> {
    // ── Ingress ─────────────────────────────────────────────────────

    pub(crate) fn process_ingress(
        &mut self,
        transfer: TransferId,
        sched: &mut dyn Scheduler,
    ) -> Result<(), FilterError> {
        let engine = &mut self.engine;
        let first_byte_at = &mut self.first_byte_at;
        let pkts = self.socket.recv_burst(self.config.recv_burst, &mut |packet, from| {
            first_byte_at.get_or_insert_with(Instant::now);
            recv_packet(&mut *engine, packet, from)
        })?;
        if pkts > 0 {
            trace!(%transfer, pkts, "ingress round");
            flow::resume_all(&mut self.streams, sched);
        }
        self.poll_events(transfer, sched)
    }

    /// Dispatch engine events until none are left. Only errors on the
    /// calling transfer's own stream are returned.
    pub(crate) fn poll_events(
        &mut self,
        transfer: TransferId,
        sched: &mut dyn Scheduler,
    ) -> Result<(), FilterError> {
        if !self.engine.has_h3() {
            return Ok(());
        }
        loop {
            let (sid, event) = match self.engine.poll_event() {
                Ok(Some(next)) => next,
                Ok(None) => return Ok(()),
                Err(e) => return Err(FilterError::Protocol(e.to_string())),
            };
            if event == H3Event::GoAway {
                debug!(last_stream = sid, "GOAWAY received");
                self.goaway = true;
                continue;
            }

            let owner = self.by_stream.get(&sid).copied();
            match owner {
                Some(owner) if owner == transfer => self.process_event(owner, event, sched)?,
                Some(owner) => {
                    if let Err(e) = self.process_event(owner, event, sched) {
                        debug!(transfer = %owner, stream = sid, error = %e, "sibling stream failed");
                    }
                }
                None => trace!(stream = sid, ?event, "event for unknown stream"),
            }
        }
    }

    fn process_event(
        &mut self,
        owner: TransferId,
        event: H3Event,
        sched: &mut dyn Scheduler,
    ) -> Result<(), FilterError> {
        let result = self.apply_event(owner, event);
        if result.is_err()
            && let Some(stream) = self.streams.get_mut(&owner)
        {
            stream.mark_failed();
        }
        self.drain_stream(owner, sched);
        result
    }

    fn apply_event(&mut self, owner: TransferId, event: H3Event) -> Result<(), FilterError> {
        let copies = self.engine.copies_body();
        let Some(stream) = self.streams.get_mut(&owner) else {
            return Ok(());
        };
        match event {
            H3Event::Headers { headers } => stream.on_headers(&headers),
            H3Event::Data => {
                if stream.closed {
                    return Ok(());
                }
                stream.complete_head()?;
                if copies {
                    self.copy_body(owner)?;
                }
                Ok(())
            }
            H3Event::Reset(code) => {
                stream.on_reset(code);
                Ok(())
            }
            H3Event::Finished => stream.on_finished(),
            H3Event::GoAway => Ok(()),
        }
    }

    /// Move body bytes the engine will not lend out into the stream's queue.
    fn copy_body(&mut self, owner: TransferId) -> Result<(), FilterError> {
        let chunk_size = self.config.body_chunk_size;
        let Some(stream) = self.streams.get_mut(&owner) else {
            return Ok(());
        };
        let Some(sid) = stream.id else {
            return Ok(());
        };
        loop {
            let mut chunk = vec![0u8; chunk_size];
            match self.engine.recv_body(sid, &mut chunk) {
                Ok(0) | Err(EngineError::Done) => return Ok(()),
                Ok(n) => {
                    chunk.truncate(n);
                    stream.push_body(chunk)?;
                }
                Err(e) => {
                    stream.mark_failed();
                    return Err(FilterError::Recv(e.to_string()));
                }
            }
        }
    }

    /// Ask the scheduler to run `owner` when its stream needs attention.
    pub(crate) fn drain_stream(&mut self, owner: TransferId, sched: &mut dyn Scheduler) {
        let Some(stream) = self.streams.get_mut(&owner) else {
            return;
        };
        let bits = stream.drain_bits();
        if stream.select != bits {
            stream.select = bits;
            sched.expire(owner, Duration::ZERO, Timer::RunNow);
        }
    }

    // ── Egress ──────────────────────────────────────────────────────

    pub(crate) fn flush_egress(
        &mut self,
        transfer: TransferId,
        sched: &mut dyn Scheduler,
    ) -> Result<(), FilterError> {
        let now = Instant::now();
        if self.engine.timeout(now).is_some_and(|t| t.is_zero()) {
            self.engine.on_timeout(now);
            if self.engine.is_closed() {
                let err = self.closed_error();
                warn!(%transfer, error = %err, "connection closed on timer");
                flow::expire_all(&self.streams, sched);
                return Err(err);
            }
        }

        let blocked = self.send_packets(now);
        let mut after = self.engine.timeout(Instant::now());
        if matches!(blocked, Ok(true)) {
            let retry = self.config.retry_interval;
            after = Some(after.map_or(retry, |t| t.min(retry)));
        }
        if let Some(after) = after {
            sched.expire(transfer, after, Timer::Quic);
        }
        blocked.map(|_| ())
    }

    /// Returns true when the socket would block with packets left over.
    fn send_packets(&mut self, now: Instant) -> Result<bool, FilterError> {
        if self.sendbuf.flush(&mut self.socket)? {
            return Ok(true);
        }
        let gsolen = self.engine.max_send_udp_payload();
        let mut pkt_count = 0;
        loop {
            let len = match self.engine.send_packet(now, &mut self.scratch) {
                Ok(len) => len,
                Err(EngineError::Done) => break,
                Err(e) => return Err(FilterError::Send(e.to_string())),
            };
            self.sendbuf.push(&self.scratch[..len], gsolen);
            pkt_count += 1;
            // A short packet cannot be followed by another in one
            // segmented send.
            if len < gsolen || pkt_count >= self.config.send_burst {
                if self.sendbuf.flush(&mut self.socket)? {
                    return Ok(true);
                }
                pkt_count = 0;
            }
        }
        self.sendbuf.flush(&mut self.socket)
    }
}
