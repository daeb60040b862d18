//! HTTP/3 client session.
//!
//! `H3Client` sits on top of a [`QuicClient`], turning QUIC stream events
//! into per-request HTTP/3 events and request submissions into frames.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use quicfilter_quic::{QuicClient, QuicEvent, StreamId, StreamRead};
use tracing::{debug, trace, warn};

use crate::config::H3Config;
use crate::error::{H3Error, code};
use crate::frame::{self, Frame};
use crate::qpack::{self, HeaderField};
use crate::settings::Settings;
use crate::stream::{H3Event, RequestStream};

/// HTTP/3 uni-stream type identifiers (RFC 9114 Section 6.2).
const STREAM_TYPE_CONTROL: u64 = 0x00;
const STREAM_TYPE_PUSH: u64 = 0x01;
const STREAM_TYPE_QPACK_ENCODER: u64 = 0x02;
const STREAM_TYPE_QPACK_DECODER: u64 = 0x03;

/// Largest field section accepted when the local settings leave it open.
const DEFAULT_MAX_FIELD_SECTION: usize = 64 * 1024;

/// Read size for control and ignored uni streams.
const UNI_READ: usize = 4096;

/// What we know about a server-initiated unidirectional stream.
enum UniStream {
    /// Stream type varint not complete yet.
    Pending(Vec<u8>),
    /// The server's control stream.
    Control,
    /// QPACK or unknown streams whose bytes are read and dropped.
    Discard,
}

/// Which half of a request stream to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
}

/// Client-side HTTP/3 connection.
///
/// Every method that touches the network takes the [`QuicClient`] the
/// session was created on.
pub struct H3Client {
    config: H3Config,
    max_section: usize,
    our_control: StreamId,
    uni: HashMap<StreamId, UniStream>,
    control_buf: Vec<u8>,
    peer_settings: Option<Settings>,
    goaway: Option<u64>,
    streams: HashMap<u64, RequestStream>,
    events: VecDeque<(u64, H3Event)>,
}

impl H3Client {
    /// Open our control stream and send SETTINGS.
    pub fn new(quic: &mut QuicClient, config: H3Config) -> Result<Self, H3Error> {
        let our_control = quic
            .open_uni()
            .ok_or_else(|| H3Error::Internal("cannot open control stream".into()))?;

        let mut buf = Vec::new();
        frame::encode_varint(&mut buf, STREAM_TYPE_CONTROL);
        Frame::Settings(config.settings.clone()).encode(&mut buf);
        let n = quic.stream_send(our_control, &buf)?;
        if n < buf.len() {
            return Err(H3Error::Internal("control stream not writable".into()));
        }
        // The control stream stays open for the lifetime of the connection.

        let max_section = config
            .settings
            .max_field_section_size
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_MAX_FIELD_SECTION);

        debug!(control = %our_control, "h3 session created");
        Ok(Self {
            config,
            max_section,
            our_control,
            uni: HashMap::new(),
            control_buf: Vec::new(),
            peer_settings: None,
            goaway: None,
            streams: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn config(&self) -> &H3Config {
        &self.config
    }

    /// SETTINGS received from the server, once its control stream spoke.
    pub fn peer_settings(&self) -> Option<&Settings> {
        self.peer_settings.as_ref()
    }

    /// Stream id carried by the server's last GOAWAY.
    pub fn goaway(&self) -> Option<u64> {
        self.goaway
    }

    /// Number of request streams still tracked.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Process pending QUIC events and return the next HTTP/3 event.
    ///
    /// Returns `Err(H3Error::Done)` when nothing is pending. A connection
    /// error closes the QUIC connection with the matching H3 code before
    /// it is returned.
    pub fn poll(&mut self, quic: &mut QuicClient) -> Result<(u64, H3Event), H3Error> {
        if let Err(e) = self.process(quic) {
            if let Some(wire) = e.wire_code() {
                warn!(error = %e, "h3 connection error");
                quic.close(Instant::now(), wire, e.to_string().as_bytes());
            }
            return Err(e);
        }
        self.events.pop_front().ok_or(H3Error::Done)
    }

    fn process(&mut self, quic: &mut QuicClient) -> Result<(), H3Error> {
        while let Some(event) = quic.poll_event() {
            self.handle_quic_event(quic, event)?;
        }
        self.flush_all(quic)
    }

    fn handle_quic_event(&mut self, quic: &mut QuicClient, event: QuicEvent) -> Result<(), H3Error> {
        match event {
            QuicEvent::StreamOpened { stream, bidi: false } => {
                self.uni.insert(stream, UniStream::Pending(Vec::new()));
                self.read_uni(quic, stream)
            }
            QuicEvent::StreamOpened { stream, bidi: true } => {
                // Servers never open request streams toward a client.
                let _ = quic.stream_stop(stream, code::H3_STREAM_CREATION_ERROR);
                Ok(())
            }
            QuicEvent::StreamReadable(stream) => {
                if self.uni.contains_key(&stream) {
                    self.read_uni(quic, stream)
                } else {
                    self.read_request(quic, stream)
                }
            }
            QuicEvent::StreamWritable(stream) => {
                if let Some(rs) = self.streams.get_mut(&u64::from(stream)) {
                    rs.send_blocked = false;
                }
                Ok(())
            }
            QuicEvent::StreamStopped { stream, code } => {
                trace!(%stream, code, "peer stopped sending side");
                Ok(())
            }
            QuicEvent::Connected
            | QuicEvent::StreamFinished(_)
            | QuicEvent::StreamsAvailable { .. }
            | QuicEvent::ConnectionLost(_) => Ok(()),
        }
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Open a request stream and send its field section.
    ///
    /// Fails with [`H3Error::StreamBlocked`] when the server's stream limit
    /// is reached. The field section is accepted whole; bytes QUIC cannot
    /// take yet are buffered on the stream.
    pub fn send_request(
        &mut self,
        quic: &mut QuicClient,
        headers: &[HeaderField],
        fin: bool,
    ) -> Result<u64, H3Error> {
        let id = quic.open_bi().ok_or(H3Error::StreamBlocked)?;

        let mut block = Vec::new();
        qpack::encode(headers, &mut block);
        let mut buf = Vec::with_capacity(block.len() + 8);
        frame::encode_frame_header(&mut buf, frame::FRAME_HEADERS, block.len() as u64);
        buf.extend_from_slice(&block);

        let mut rs = RequestStream::new(id);
        rs.pending.push_back(Bytes::from(buf));
        rs.fin_pending = fin;
        Self::flush_stream(quic, &mut rs)?;
        let key = rs.key();
        trace!(stream = key, fin, "request headers submitted");
        self.streams.insert(key, rs);
        Ok(key)
    }

    /// Send request body bytes as one DATA frame.
    ///
    /// At most `max_data_frame` bytes are taken per call. Returns
    /// `Err(H3Error::Done)` while earlier bytes are still buffered or when
    /// QUIC has no credit at all.
    pub fn send_body(
        &mut self,
        quic: &mut QuicClient,
        stream: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, H3Error> {
        let max_frame = self.config.max_data_frame;
        let rs = self
            .streams
            .get_mut(&stream)
            .ok_or(H3Error::UnknownStream(stream))?;
        if rs.local_fin || rs.fin_pending {
            return Err(H3Error::StreamClosed(stream));
        }
        Self::flush_stream(quic, rs)?;
        if !rs.pending.is_empty() {
            return Err(H3Error::Done);
        }

        let n = data.len().min(max_frame);
        let fin = fin && n == data.len();
        if n == 0 {
            if fin {
                quic.stream_finish(rs.id)?;
                rs.local_fin = true;
            }
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(n + 8);
        frame::encode_frame_header(&mut buf, frame::FRAME_DATA, n as u64);
        buf.extend_from_slice(&data[..n]);

        let written = match quic.stream_send(rs.id, &buf) {
            Ok(written) => written,
            Err(e) if e.is_blocked() => {
                rs.send_blocked = true;
                return Err(H3Error::Done);
            }
            Err(e) => return Err(e.into()),
        };
        if written < buf.len() {
            rs.send_blocked = true;
            rs.pending.push_back(Bytes::from(buf).slice(written..));
        }
        rs.fin_pending = fin;
        Self::flush_stream(quic, rs)?;
        Ok(n)
    }

    /// True when a `send_body` call could make progress right now.
    pub fn stream_writable(&self, stream: u64) -> bool {
        self.streams
            .get(&stream)
            .is_some_and(|rs| !rs.local_fin && rs.pending.is_empty() && !rs.send_blocked)
    }

    /// Stop one direction of a request stream.
    pub fn shutdown(
        &mut self,
        quic: &mut QuicClient,
        stream: u64,
        how: Shutdown,
        err: u64,
    ) -> Result<(), H3Error> {
        let rs = self
            .streams
            .get_mut(&stream)
            .ok_or(H3Error::UnknownStream(stream))?;
        match how {
            Shutdown::Read => {
                rs.read_shut = true;
                rs.drop_body();
                if !rs.remote_fin && rs.reset.is_none() {
                    quic.stream_stop(rs.id, err)?;
                }
            }
            Shutdown::Write => {
                rs.pending.clear();
                rs.fin_pending = false;
                if !rs.local_fin {
                    rs.local_fin = true;
                    quic.stream_reset(rs.id, err)?;
                }
            }
        }
        self.retire_if_done(stream);
        Ok(())
    }

    // ── Response body ───────────────────────────────────────────────

    /// Borrow the next buffered body slice without copying.
    pub fn peek_body(&self, stream: u64) -> Result<&Bytes, H3Error> {
        if self.config.copy_body {
            return Err(H3Error::Internal("body must be copied out".into()));
        }
        self.streams
            .get(&stream)
            .ok_or(H3Error::UnknownStream(stream))?
            .peek_body()
            .ok_or(H3Error::Done)
    }

    /// Release `n` peeked body bytes and read further ahead.
    pub fn body_consumed(
        &mut self,
        quic: &mut QuicClient,
        stream: u64,
        n: usize,
    ) -> Result<(), H3Error> {
        let rs = self
            .streams
            .get_mut(&stream)
            .ok_or(H3Error::UnknownStream(stream))?;
        rs.consume_body(n);
        self.after_consume(quic, stream)
    }

    /// Copy body bytes into `out`. Returns `Err(H3Error::Done)` when nothing
    /// is buffered.
    pub fn recv_body(
        &mut self,
        quic: &mut QuicClient,
        stream: u64,
        out: &mut [u8],
    ) -> Result<usize, H3Error> {
        let rs = self
            .streams
            .get_mut(&stream)
            .ok_or(H3Error::UnknownStream(stream))?;
        let n = rs.copy_body(out);
        self.after_consume(quic, stream)?;
        if n == 0 && !out.is_empty() {
            return Err(H3Error::Done);
        }
        Ok(n)
    }

    fn after_consume(&mut self, quic: &mut QuicClient, stream: u64) -> Result<(), H3Error> {
        let id = match self.streams.get_mut(&stream) {
            Some(rs) => {
                rs.maybe_finish(&mut self.events);
                rs.id
            }
            None => return Ok(()),
        };
        self.read_request(quic, id)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn flush_all(&mut self, quic: &mut QuicClient) -> Result<(), H3Error> {
        for rs in self.streams.values_mut() {
            if !rs.pending.is_empty() || rs.fin_pending {
                Self::flush_stream(quic, rs)?;
            }
        }
        // Streams over in both directions are dropped here, after their
        // last event was queued.
        self.streams.retain(|_, rs| !rs.is_retired());
        Ok(())
    }

    /// Push buffered bytes (and an owed FIN) into QUIC.
    fn flush_stream(quic: &mut QuicClient, rs: &mut RequestStream) -> Result<(), H3Error> {
        while let Some(front) = rs.pending.front_mut() {
            match quic.stream_send(rs.id, front) {
                Ok(n) if n == front.len() => {
                    rs.pending.pop_front();
                }
                Ok(n) => {
                    *front = front.slice(n..);
                    rs.send_blocked = true;
                    return Ok(());
                }
                Err(e) if e.is_blocked() => {
                    rs.send_blocked = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        if rs.fin_pending && !rs.local_fin {
            quic.stream_finish(rs.id)?;
            rs.fin_pending = false;
            rs.local_fin = true;
        }
        Ok(())
    }

    fn read_request(&mut self, quic: &mut QuicClient, id: StreamId) -> Result<(), H3Error> {
        let max_buffered = self.config.max_buffered_body;
        let Some(rs) = self.streams.get_mut(&u64::from(id)) else {
            return Ok(());
        };
        loop {
            if rs.read_done() {
                return Ok(());
            }
            let room = max_buffered.saturating_sub(rs.body_len);
            if room == 0 {
                return Ok(());
            }
            match quic.stream_read(id, rs.read_limit(room))? {
                StreamRead::Data(chunk) => rs.feed(chunk, self.max_section, &mut self.events)?,
                StreamRead::Blocked => return Ok(()),
                StreamRead::Finished => return rs.on_remote_fin(&mut self.events),
                StreamRead::Reset(code) => {
                    debug!(stream = %id, code, "response stream reset");
                    rs.on_reset(code, &mut self.events);
                    // Nobody reads a response to the rest of this request.
                    if !rs.local_fin {
                        rs.pending.clear();
                        rs.fin_pending = false;
                        rs.local_fin = true;
                        quic.stream_reset(id, code::H3_REQUEST_CANCELLED)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Drop a stream whose both directions are over.
    fn retire_if_done(&mut self, stream: u64) {
        if self.streams.get(&stream).is_some_and(RequestStream::is_retired) {
            trace!(stream, "request stream retired");
            self.streams.remove(&stream);
        }
    }

    fn read_uni(&mut self, quic: &mut QuicClient, id: StreamId) -> Result<(), H3Error> {
        loop {
            let read = quic.stream_read(id, UNI_READ)?;
            let chunk = match read {
                StreamRead::Data(chunk) => chunk,
                StreamRead::Blocked => return Ok(()),
                StreamRead::Finished | StreamRead::Reset(_) => {
                    return match self.uni.remove(&id) {
                        Some(UniStream::Control) => Err(H3Error::ClosedCriticalStream),
                        _ => Ok(()),
                    };
                }
            };
            match self.uni.get_mut(&id) {
                Some(UniStream::Pending(prefix)) => {
                    prefix.extend_from_slice(&chunk);
                    let Some((kind, n)) = frame::decode_varint(prefix) else {
                        continue;
                    };
                    let rest = prefix.split_off(n);
                    if !self.identify_uni(quic, id, kind)? {
                        return Ok(());
                    }
                    if matches!(self.uni.get(&id), Some(UniStream::Control)) {
                        self.control_buf.extend_from_slice(&rest);
                        self.process_control_frames()?;
                    }
                }
                Some(UniStream::Control) => {
                    self.control_buf.extend_from_slice(&chunk);
                    self.process_control_frames()?;
                }
                Some(UniStream::Discard) => {}
                None => return Ok(()),
            }
        }
    }

    /// Record the type of a server uni stream. Returns false for unknown
    /// types, which are stopped and forgotten.
    fn identify_uni(
        &mut self,
        quic: &mut QuicClient,
        id: StreamId,
        kind: u64,
    ) -> Result<bool, H3Error> {
        let next = match kind {
            STREAM_TYPE_CONTROL => {
                if self.uni.values().any(|u| matches!(u, UniStream::Control)) {
                    return Err(H3Error::StreamCreation);
                }
                debug!(stream = %id, "server control stream");
                UniStream::Control
            }
            // No MAX_PUSH_ID was ever sent, so no push is allowed.
            STREAM_TYPE_PUSH => return Err(H3Error::FrameUnexpected),
            STREAM_TYPE_QPACK_ENCODER | STREAM_TYPE_QPACK_DECODER => UniStream::Discard,
            other => {
                trace!(stream = %id, kind = other, "ignoring unknown uni stream");
                self.uni.remove(&id);
                let _ = quic.stream_stop(id, code::H3_STREAM_CREATION_ERROR);
                return Ok(false);
            }
        };
        self.uni.insert(id, next);
        Ok(true)
    }

    fn process_control_frames(&mut self) -> Result<(), H3Error> {
        let mut offset = 0;
        while let Some((frame, consumed)) = frame::decode_frame(&self.control_buf[offset..])? {
            offset += consumed;
            match frame {
                Frame::Settings(settings) => {
                    if self.peer_settings.is_some() {
                        return Err(H3Error::FrameUnexpected);
                    }
                    debug!(?settings, "server settings");
                    self.peer_settings = Some(settings);
                }
                _ if self.peer_settings.is_none() => return Err(H3Error::MissingSettings),
                Frame::GoAway { stream_id } => {
                    if self.goaway.is_some_and(|prev| stream_id > prev) {
                        return Err(H3Error::FrameError);
                    }
                    debug!(stream_id, "GOAWAY received");
                    self.goaway = Some(stream_id);
                    self.events.push_back((stream_id, H3Event::GoAway));
                }
                Frame::Data { .. } | Frame::Headers { .. } => {
                    return Err(H3Error::FrameUnexpected);
                }
                Frame::Unknown { frame_type, .. }
                    if matches!(frame_type, frame::FRAME_PUSH_PROMISE) =>
                {
                    return Err(H3Error::FrameUnexpected);
                }
                Frame::Unknown { .. } => {}
            }
        }
        self.control_buf.drain(..offset);
        Ok(())
    }
}

impl std::fmt::Debug for H3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Client")
            .field("our_control", &self.our_control)
            .field("streams", &self.streams.len())
            .field("goaway", &self.goaway)
            .finish()
    }
}
