//! The transport engine seam.
//!
//! [`H3Filter`](crate::H3Filter) never speaks QUIC or HTTP/3 itself. It
//! drives an [`Engine`]: packets go in and out, requests and body bytes are
//! submitted per stream id, and protocol events come back out. Every result
//! is classified as an [`EngineError`] the filter branches on.
//!
//! [`QuinnEngine`] is the production engine: a [`QuicClient`] for the
//! transport and an [`H3Client`] session created once the handshake is done.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use quicfilter_h3::{H3Client, H3Config, H3Error, H3Event, HeaderField, Shutdown};
use quicfilter_quic::{QuicClient, QuicConfig};
use tracing::debug;

use crate::error::{EngineError, FilterError};

/// QUIC connection plus HTTP/3 session, as seen by the filter.
pub trait Engine {
    // ── Packets ─────────────────────────────────────────────────────

    /// Feed one received datagram. Returns the bytes consumed.
    ///
    /// `Err(Done)` means the connection takes no more input; `Err(TlsFail)`
    /// means the handshake failed.
    fn recv_packet(
        &mut self,
        now: Instant,
        packet: &[u8],
        from: SocketAddr,
    ) -> Result<usize, EngineError>;

    /// Write the next outgoing packet into `buf` (cleared first). Returns
    /// its length, or `Err(Done)` when nothing is ready.
    fn send_packet(&mut self, now: Instant, buf: &mut Vec<u8>) -> Result<usize, EngineError>;

    /// Largest packet the path carries; packets of this size coalesce.
    fn max_send_udp_payload(&self) -> usize;

    /// Time left until the connection timeout, if one is armed.
    fn timeout(&mut self, now: Instant) -> Option<Duration>;

    /// The connection timeout elapsed.
    fn on_timeout(&mut self, now: Instant);

    // ── Connection state ────────────────────────────────────────────

    fn is_established(&self) -> bool;

    fn is_draining(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// The connection closed because its idle timeout elapsed.
    fn is_timed_out(&self) -> bool;

    /// The peer's certificate verified, or why not.
    fn verify_peer(&self) -> Result<(), String>;

    /// How many more request streams the peer accepts.
    fn peer_streams_left_bidi(&self) -> u64;

    fn close(&mut self, now: Instant, app: bool, code: u64, reason: &[u8])
    -> Result<(), EngineError>;

    // ── HTTP/3 session ──────────────────────────────────────────────

    /// Create the HTTP/3 session once the handshake is complete.
    fn open_h3(&mut self) -> Result<(), EngineError>;

    fn has_h3(&self) -> bool;

    /// Open a request stream. Returns the stream id.
    fn send_request(&mut self, headers: &[HeaderField], fin: bool) -> Result<u64, EngineError>;

    /// Send request body bytes. Returns how many were taken.
    fn send_body(&mut self, stream: u64, data: &[u8], fin: bool) -> Result<usize, EngineError>;

    /// True when the stream would accept `len` more body bytes.
    fn stream_writable(&mut self, stream: u64, len: usize) -> bool;

    /// Next protocol event, `None` when nothing is pending.
    fn poll_event(&mut self) -> Result<Option<(u64, H3Event)>, EngineError>;

    /// Body bytes must be copied out with [`recv_body`](Self::recv_body);
    /// [`peek_body`](Self::peek_body) is not available.
    fn copies_body(&self) -> bool;

    /// Borrow the next buffered body bytes of `stream`. `Err(Done)` when
    /// none are buffered.
    fn peek_body(&mut self, stream: u64) -> Result<&[u8], EngineError>;

    /// Release `n` bytes returned by [`peek_body`](Self::peek_body).
    fn body_consumed(&mut self, stream: u64, n: usize) -> Result<(), EngineError>;

    /// Copy body bytes into `out`. `Err(Done)` when none are buffered.
    fn recv_body(&mut self, stream: u64, out: &mut [u8]) -> Result<usize, EngineError>;

    fn shutdown_stream(&mut self, stream: u64, how: Shutdown, code: u64)
    -> Result<(), EngineError>;
}

/// [`Engine`] over quinn-proto and the HTTP/3 client session.
pub struct QuinnEngine {
    quic: QuicClient,
    h3: Option<H3Client>,
    h3_config: H3Config,
}

impl QuinnEngine {
    /// Start the handshake with `peer`. The client Initial is ready to be
    /// pulled with [`send_packet`](Engine::send_packet) right away.
    pub fn connect(
        quic_config: QuicConfig,
        h3_config: H3Config,
        now: Instant,
        local: SocketAddr,
        peer: SocketAddr,
        server_name: &str,
    ) -> Result<Self, FilterError> {
        let quic = QuicClient::connect(quic_config, now, local, peer, server_name)
            .map_err(|e| FilterError::Protocol(e.to_string()))?;
        Ok(Self {
            quic,
            h3: None,
            h3_config,
        })
    }

    pub fn quic(&self) -> &QuicClient {
        &self.quic
    }

    pub fn h3(&self) -> Option<&H3Client> {
        self.h3.as_ref()
    }

    fn session(&mut self) -> Result<(&mut H3Client, &mut QuicClient), EngineError> {
        match self.h3.as_mut() {
            Some(h3) => Ok((h3, &mut self.quic)),
            None => Err(EngineError::InvalidStreamState),
        }
    }
}

/// A stream the session already retired has nothing left to read.
fn retired_is_done(e: H3Error) -> EngineError {
    match e {
        H3Error::UnknownStream(_) => EngineError::Done,
        other => other.into(),
    }
}

impl Engine for QuinnEngine {
    fn recv_packet(
        &mut self,
        now: Instant,
        packet: &[u8],
        from: SocketAddr,
    ) -> Result<usize, EngineError> {
        if self.quic.is_draining() || self.quic.is_closed() {
            return Err(EngineError::Done);
        }
        self.quic.handle_datagram(now, packet, from);
        if self.quic.tls_failure().is_some() {
            return Err(EngineError::TlsFail);
        }
        Ok(packet.len())
    }

    fn send_packet(&mut self, now: Instant, buf: &mut Vec<u8>) -> Result<usize, EngineError> {
        self.quic.poll_transmit(now, buf).ok_or(EngineError::Done)
    }

    fn max_send_udp_payload(&self) -> usize {
        self.quic.max_udp_payload()
    }

    fn timeout(&mut self, now: Instant) -> Option<Duration> {
        self.quic.timeout(now)
    }

    fn on_timeout(&mut self, now: Instant) {
        self.quic.handle_timeout(now);
    }

    fn is_established(&self) -> bool {
        self.quic.is_established()
    }

    fn is_draining(&self) -> bool {
        self.quic.is_draining()
    }

    fn is_closed(&self) -> bool {
        self.quic.is_closed()
    }

    fn is_timed_out(&self) -> bool {
        self.quic.is_timed_out()
    }

    fn verify_peer(&self) -> Result<(), String> {
        match self.quic.tls_failure() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    fn peer_streams_left_bidi(&self) -> u64 {
        self.quic.peer_streams_left_bidi()
    }

    fn close(
        &mut self,
        now: Instant,
        _app: bool,
        code: u64,
        reason: &[u8],
    ) -> Result<(), EngineError> {
        if self.quic.is_closed() {
            return Err(EngineError::Done);
        }
        self.quic.close(now, code, reason);
        Ok(())
    }

    fn open_h3(&mut self) -> Result<(), EngineError> {
        if self.h3.is_some() {
            return Ok(());
        }
        let h3 = H3Client::new(&mut self.quic, self.h3_config.clone())
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        debug!("h3 session ready");
        self.h3 = Some(h3);
        Ok(())
    }

    fn has_h3(&self) -> bool {
        self.h3.is_some()
    }

    fn send_request(&mut self, headers: &[HeaderField], fin: bool) -> Result<u64, EngineError> {
        let (h3, quic) = self.session()?;
        Ok(h3.send_request(quic, headers, fin)?)
    }

    fn send_body(&mut self, stream: u64, data: &[u8], fin: bool) -> Result<usize, EngineError> {
        let (h3, quic) = self.session()?;
        Ok(h3.send_body(quic, stream, data, fin)?)
    }

    fn stream_writable(&mut self, stream: u64, _len: usize) -> bool {
        self.h3.as_ref().is_some_and(|h3| h3.stream_writable(stream))
    }

    fn poll_event(&mut self) -> Result<Option<(u64, H3Event)>, EngineError> {
        let (h3, quic) = self.session()?;
        match h3.poll(quic) {
            Ok(event) => Ok(Some(event)),
            Err(H3Error::Done) => Ok(None),
            Err(e) => Err(EngineError::Protocol(e.to_string())),
        }
    }

    fn copies_body(&self) -> bool {
        self.h3_config.copy_body
    }

    fn peek_body(&mut self, stream: u64) -> Result<&[u8], EngineError> {
        let h3 = self.h3.as_ref().ok_or(EngineError::InvalidStreamState)?;
        match h3.peek_body(stream) {
            Ok(body) => Ok(&body[..]),
            Err(e) => Err(retired_is_done(e)),
        }
    }

    fn body_consumed(&mut self, stream: u64, n: usize) -> Result<(), EngineError> {
        let (h3, quic) = self.session()?;
        match h3.body_consumed(quic, stream, n) {
            Ok(()) | Err(H3Error::UnknownStream(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn recv_body(&mut self, stream: u64, out: &mut [u8]) -> Result<usize, EngineError> {
        let (h3, quic) = self.session()?;
        h3.recv_body(quic, stream, out).map_err(retired_is_done)
    }

    fn shutdown_stream(
        &mut self,
        stream: u64,
        how: Shutdown,
        code: u64,
    ) -> Result<(), EngineError> {
        let (h3, quic) = self.session()?;
        match h3.shutdown(quic, stream, how, code) {
            Ok(()) | Err(H3Error::UnknownStream(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for QuinnEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuinnEngine")
            .field("peer", &self.quic.peer())
            .field("established", &self.quic.is_established())
            .field("h3", &self.h3)
            .finish()
    }
}
