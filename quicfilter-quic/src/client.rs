use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use quinn_proto::{
    ConnectionError, ConnectionHandle, DatagramEvent, Dir, Event, ReadError, StreamEvent,
    StreamId, VarInt,
};
use tracing::{debug, trace};

use crate::config::QuicConfig;
use crate::error::Error;
use crate::event::QuicEvent;

/// TLS alerts are carried as transport error codes `0x100 + alert`.
const CRYPTO_ERROR_RANGE: std::ops::Range<u64> = 0x100..0x200;

/// Outcome of a single zero-copy stream read.
#[derive(Debug)]
pub enum StreamRead {
    /// The next in-order chunk. Never empty.
    Data(Bytes),
    /// Nothing buffered right now.
    Blocked,
    /// The peer finished the stream and every byte has been read.
    Finished,
    /// The peer reset the stream with this application code.
    Reset(u64),
}

/// A sans-IO QUIC client owning exactly one outbound connection.
///
/// Wraps a [`quinn_proto::Endpoint`] and its single
/// [`quinn_proto::Connection`] and exposes an event-queue API. The caller
/// moves datagrams between the socket and the client:
///
/// 1. Feed incoming UDP datagrams via [`handle_datagram`](Self::handle_datagram).
/// 2. Fire the connection timer via [`handle_timeout`](Self::handle_timeout)
///    once [`poll_timeout`](Self::poll_timeout) has passed.
/// 3. Poll application events via [`poll_event`](Self::poll_event).
/// 4. Pull outgoing packets via [`poll_transmit`](Self::poll_transmit).
pub struct QuicClient {
    endpoint: quinn_proto::Endpoint,
    handle: ConnectionHandle,
    conn: quinn_proto::Connection,
    /// Application-facing event queue.
    events: VecDeque<QuicEvent>,
    /// Stateless endpoint responses waiting to be sent.
    responses: VecDeque<Vec<u8>>,
    /// Scratch buffer for `endpoint.handle()` responses.
    response_buf: Vec<u8>,
    local_addr: SocketAddr,
    peer: SocketAddr,
    established: bool,
    lost: Option<ConnectionError>,
    max_streams_bidi: u64,
    open_bidi: u64,
    bidi_exhausted: bool,
}

impl QuicClient {
    /// Start the handshake with `peer`. The first Initial packet is ready
    /// in [`poll_transmit`](Self::poll_transmit) right after this returns.
    pub fn connect(
        config: QuicConfig,
        now: Instant,
        local_addr: SocketAddr,
        peer: SocketAddr,
        server_name: &str,
    ) -> Result<Self, Error> {
        let mut endpoint = quinn_proto::Endpoint::new(
            config.endpoint_config,
            None,
            config.allow_mtud,
            config.rng_seed,
        );
        let (handle, conn) = endpoint.connect(now, config.client_config, peer, server_name)?;
        debug!(%peer, server_name, "quic connect");

        Ok(Self {
            endpoint,
            handle,
            conn,
            events: VecDeque::new(),
            responses: VecDeque::new(),
            response_buf: Vec::with_capacity(1500),
            local_addr,
            peer,
            established: false,
            lost: None,
            max_streams_bidi: u64::from(config.limits.max_streams_bidi),
            open_bidi: 0,
            bidi_exhausted: false,
        })
    }

    /// Feed an incoming UDP datagram to the QUIC state machine.
    pub fn handle_datagram(&mut self, now: Instant, data: &[u8], from: SocketAddr) {
        self.response_buf.clear();
        let event = self.endpoint.handle(
            now,
            from,
            Some(self.local_addr.ip()),
            None,
            BytesMut::from(data),
            &mut self.response_buf,
        );

        match event {
            Some(DatagramEvent::ConnectionEvent(ch, event)) if ch == self.handle => {
                self.conn.handle_event(event);
                self.poll_connection();
            }
            Some(DatagramEvent::ConnectionEvent(..)) => {}
            Some(DatagramEvent::NewConnection(incoming)) => {
                // Client-only endpoint.
                self.endpoint.ignore(incoming);
            }
            Some(DatagramEvent::Response(transmit)) => {
                self.responses
                    .push_back(self.response_buf[..transmit.size].to_vec());
            }
            None => {}
        }
    }

    /// Deadline of the connection's next internal timer.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.conn.poll_timeout()
    }

    /// Time left until [`poll_timeout`](Self::poll_timeout), zero if it has passed.
    pub fn timeout(&mut self, now: Instant) -> Option<Duration> {
        self.conn
            .poll_timeout()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Fire the connection timer.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.conn.handle_timeout(now);
        self.poll_connection();
    }

    /// Write the next outgoing datagram into `buf` (cleared first) and
    /// return its length, or `None` when nothing is ready.
    pub fn poll_transmit(&mut self, now: Instant, buf: &mut Vec<u8>) -> Option<usize> {
        buf.clear();
        if let Some(response) = self.responses.pop_front() {
            buf.extend_from_slice(&response);
            return Some(buf.len());
        }
        let transmit = self.conn.poll_transmit(now, 1, buf)?;
        buf.truncate(transmit.size);
        Some(transmit.size)
    }

    /// Poll the next application event.
    pub fn poll_event(&mut self) -> Option<QuicEvent> {
        self.events.pop_front()
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Closing or draining: no new application data will flow.
    pub fn is_draining(&self) -> bool {
        self.conn.is_closed() && !self.conn.is_drained()
    }

    /// Fully closed; the connection can be dropped.
    pub fn is_closed(&self) -> bool {
        self.conn.is_drained()
    }

    /// True when the connection was lost to the idle timer.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.lost, Some(ConnectionError::TimedOut))
    }

    /// Why the connection was lost, if it was.
    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.lost.as_ref()
    }

    /// The certificate or handshake failure that killed the connection, if
    /// the loss was a TLS error.
    pub fn tls_failure(&self) -> Option<String> {
        match &self.lost {
            Some(ConnectionError::TransportError(e))
                if CRYPTO_ERROR_RANGE.contains(&u64::from(e.code)) =>
            {
                Some(e.reason.clone())
            }
            _ => None,
        }
    }

    /// Largest UDP payload the path currently carries.
    pub fn max_udp_payload(&self) -> usize {
        usize::from(self.conn.current_mtu())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Estimate of how many more bidirectional streams the server accepts.
    ///
    /// Zero once an open was refused, until the server raises its limit.
    pub fn peer_streams_left_bidi(&self) -> u64 {
        if self.bidi_exhausted {
            0
        } else {
            self.max_streams_bidi.saturating_sub(self.open_bidi)
        }
    }

    /// Open a bidirectional stream.
    ///
    /// Returns `None` if the peer's stream concurrency limit has been reached.
    pub fn open_bi(&mut self) -> Option<StreamId> {
        match self.conn.streams().open(Dir::Bi) {
            Some(id) => {
                self.open_bidi += 1;
                Some(id)
            }
            None => {
                self.bidi_exhausted = true;
                None
            }
        }
    }

    /// Open a unidirectional stream.
    pub fn open_uni(&mut self) -> Option<StreamId> {
        self.conn.streams().open(Dir::Uni)
    }

    /// Write data to a stream.
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()` when flow control runs out. A write that accepts nothing
    /// fails with `WriteError::Blocked`.
    pub fn stream_send(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, Error> {
        Ok(self.conn.send_stream(stream).write(data)?)
    }

    /// Send FIN on a stream, indicating no more data will be sent.
    pub fn stream_finish(&mut self, stream: StreamId) -> Result<(), Error> {
        self.conn.send_stream(stream).finish()?;
        Ok(())
    }

    /// Abandon the send side of a stream.
    pub fn stream_reset(&mut self, stream: StreamId, code: u64) -> Result<(), Error> {
        self.conn.send_stream(stream).reset(varint(code))?;
        Ok(())
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stream_stop(&mut self, stream: StreamId, code: u64) -> Result<(), Error> {
        self.conn.recv_stream(stream).stop(varint(code))?;
        Ok(())
    }

    /// Take the next in-order chunk of at most `max` bytes without copying.
    pub fn stream_read(&mut self, stream: StreamId, max: usize) -> Result<StreamRead, Error> {
        let mut recv = self.conn.recv_stream(stream);
        let mut chunks = recv.read(true)?;
        let outcome = match chunks.next(max) {
            Ok(Some(chunk)) => Ok(StreamRead::Data(chunk.bytes)),
            Ok(None) => Ok(StreamRead::Finished),
            Err(ReadError::Blocked) => Ok(StreamRead::Blocked),
            Err(ReadError::Reset(code)) => Ok(StreamRead::Reset(code.into_inner())),
            Err(e) => Err(Error::Read(e)),
        };
        let _ = chunks.finalize();
        outcome
    }

    /// Close the connection with an application error code and reason.
    pub fn close(&mut self, now: Instant, code: u64, reason: &[u8]) {
        if self.conn.is_closed() {
            return;
        }
        debug!(code, "quic close");
        self.conn
            .close(now, varint(code), Bytes::copy_from_slice(reason));
        self.poll_connection();
    }

    /// Drain endpoint events and application events from the connection.
    fn poll_connection(&mut self) {
        while let Some(event) = self.conn.poll_endpoint_events() {
            if let Some(conn_event) = self.endpoint.handle_event(self.handle, event) {
                self.conn.handle_event(conn_event);
            }
        }

        while let Some(event) = self.conn.poll() {
            match event {
                Event::Connected => {
                    debug!("quic handshake complete");
                    self.established = true;
                    self.events.push_back(QuicEvent::Connected);
                }
                Event::ConnectionLost { reason } => {
                    debug!(%reason, "quic connection lost");
                    self.lost = Some(reason.clone());
                    self.events.push_back(QuicEvent::ConnectionLost(reason));
                }
                Event::Stream(stream_event) => self.on_stream_event(stream_event),
                Event::HandshakeDataReady
                | Event::DatagramReceived
                | Event::DatagramsUnblocked => {}
            }
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Opened { dir } => {
                while let Some(stream) = self.conn.streams().accept(dir) {
                    trace!(%stream, "peer opened stream");
                    self.events.push_back(QuicEvent::StreamOpened {
                        stream,
                        bidi: dir == Dir::Bi,
                    });
                }
            }
            StreamEvent::Readable { id } => self.events.push_back(QuicEvent::StreamReadable(id)),
            StreamEvent::Writable { id } => self.events.push_back(QuicEvent::StreamWritable(id)),
            StreamEvent::Finished { id } => {
                if id.dir() == Dir::Bi {
                    self.open_bidi = self.open_bidi.saturating_sub(1);
                }
                self.events.push_back(QuicEvent::StreamFinished(id));
            }
            StreamEvent::Stopped { id, error_code } => {
                self.events.push_back(QuicEvent::StreamStopped {
                    stream: id,
                    code: error_code.into_inner(),
                });
            }
            StreamEvent::Available { dir } => {
                if dir == Dir::Bi {
                    self.bidi_exhausted = false;
                }
                self.events.push_back(QuicEvent::StreamsAvailable {
                    bidi: dir == Dir::Bi,
                });
            }
        }
    }
}

fn varint(code: u64) -> VarInt {
    VarInt::from_u64(code).unwrap_or(VarInt::MAX)
}

impl std::fmt::Debug for QuicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicClient")
            .field("peer", &self.peer)
            .field("established", &self.established)
            .field("lost", &self.lost)
            .finish()
    }
}
