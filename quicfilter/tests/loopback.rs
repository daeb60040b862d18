//! End to end: `H3Filter` over `QuinnEngine` against an in-memory HTTP/3
//! server.
//!
//! The filter's socket is a datagram pipe; the test moves datagrams between
//! it and a quinn-proto server endpoint that answers a few fixed paths.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use quicfilter::{
    FilterConfig, FilterError, H3Filter, PacketSocket, QuinnEngine, Scheduler, Timer, Transfer,
    TransferId,
};
use quicfilter_h3::{Frame, H3Config, HeaderField, Settings, frame, qpack};
use quicfilter_quic::QuicConfig;
use quinn_proto::{
    ConnectionHandle, DatagramEvent, Dir, Endpoint, EndpointConfig, Event, ServerConfig,
    StreamEvent, StreamId, VarInt,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

const BIG_BODY: usize = 300 * 1024;

fn client_addr() -> SocketAddr {
    "127.0.0.1:40001".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

fn body_byte(i: usize) -> u8 {
    (i % 251) as u8
}

/// `RUST_LOG=quicfilter=trace cargo test` shows the filter's view.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── TLS ──────────────────────────────────────────────────────────────

fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    (vec![CertificateDer::from(cert.cert)], key.into())
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Arc<ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .unwrap();
    crypto.alpn_protocols = vec![b"h3".to_vec()];
    let quic = quinn_proto::crypto::rustls::QuicServerConfig::try_from(crypto).unwrap();
    let mut sc = ServerConfig::with_crypto(Arc::new(quic));
    let transport = Arc::get_mut(&mut sc.transport).unwrap();
    transport.max_concurrent_bidi_streams(16u32.into());
    transport.max_concurrent_uni_streams(16u32.into());
    Arc::new(sc)
}

// ── Server ───────────────────────────────────────────────────────────

struct Server {
    endpoint: Endpoint,
    conn: Option<(ConnectionHandle, quinn_proto::Connection)>,
    outbox: VecDeque<Vec<u8>>,
    requests: HashMap<StreamId, Vec<u8>>,
    pending: HashMap<StreamId, Vec<u8>>,
    closed: bool,
}

impl Server {
    fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            endpoint: Endpoint::new(Arc::new(EndpointConfig::default()), Some(config), true, None),
            conn: None,
            outbox: VecDeque::new(),
            requests: HashMap::new(),
            pending: HashMap::new(),
            closed: false,
        }
    }

    fn handle_datagram(&mut self, now: Instant, data: &[u8]) {
        let mut response = Vec::new();
        match self.endpoint.handle(
            now,
            client_addr(),
            None,
            None,
            BytesMut::from(data),
            &mut response,
        ) {
            Some(DatagramEvent::NewConnection(incoming)) => {
                let mut buf = Vec::new();
                if let Ok((ch, conn)) = self.endpoint.accept(incoming, now, &mut buf, None) {
                    self.conn = Some((ch, conn));
                }
            }
            Some(DatagramEvent::ConnectionEvent(ch, event)) => {
                if let Some((handle, conn)) = self.conn.as_mut()
                    && *handle == ch
                {
                    conn.handle_event(event);
                }
            }
            Some(DatagramEvent::Response(t)) => self.outbox.push_back(response[..t.size].to_vec()),
            None => {}
        }
    }

    fn service(&mut self, now: Instant) {
        let Some((ch, mut conn)) = self.conn.take() else {
            return;
        };
        if conn.poll_timeout().is_some_and(|t| t <= now) {
            conn.handle_timeout(now);
        }
        while let Some(event) = conn.poll_endpoint_events() {
            if let Some(conn_event) = self.endpoint.handle_event(ch, event) {
                conn.handle_event(conn_event);
            }
        }
        let mut readable = Vec::new();
        while let Some(event) = conn.poll() {
            match event {
                Event::Connected => open_control(&mut conn),
                Event::Stream(StreamEvent::Opened { dir }) => {
                    while let Some(id) = conn.streams().accept(dir) {
                        readable.push(id);
                    }
                }
                Event::Stream(StreamEvent::Readable { id }) => readable.push(id),
                Event::ConnectionLost { .. } => self.closed = true,
                _ => {}
            }
        }
        for id in readable {
            self.read(&mut conn, id);
        }
        self.flush(&mut conn);

        let mut buf = Vec::new();
        while let Some(t) = conn.poll_transmit(now, 1, &mut buf) {
            self.outbox.push_back(buf[..t.size].to_vec());
            buf.clear();
        }
        self.conn = Some((ch, conn));
    }

    fn read(&mut self, conn: &mut quinn_proto::Connection, id: StreamId) {
        let mut data = Vec::new();
        let mut fin = false;
        {
            let mut recv = conn.recv_stream(id);
            let Ok(mut chunks) = recv.read(true) else {
                return;
            };
            loop {
                match chunks.next(usize::MAX) {
                    Ok(Some(chunk)) => data.extend_from_slice(&chunk.bytes),
                    Ok(None) => {
                        fin = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            let _ = chunks.finalize();
        }
        if id.dir() == Dir::Uni {
            return;
        }
        self.requests.entry(id).or_default().extend_from_slice(&data);
        if fin && let Some(request) = self.requests.remove(&id) {
            self.respond(conn, id, &request);
        }
    }

    fn respond(&mut self, conn: &mut quinn_proto::Connection, id: StreamId, request: &[u8]) {
        let mut headers = Vec::new();
        let mut body = Vec::new();
        let mut offset = 0;
        while let Some((frame, n)) = frame::decode_frame(&request[offset..]).unwrap() {
            offset += n;
            match frame {
                Frame::Headers { encoded } => headers = qpack::decode(&encoded).unwrap(),
                Frame::Data { payload } => body.extend_from_slice(&payload),
                _ => {}
            }
        }
        let path = headers
            .iter()
            .find(|h| h.name == b":path")
            .map(|h| h.value.clone())
            .unwrap_or_default();

        let body = match &path[..] {
            b"/reset" => {
                conn.send_stream(id).reset(VarInt::from_u32(0x10c)).unwrap();
                return;
            }
            b"/big" => (0..BIG_BODY).map(body_byte).collect(),
            b"/echo" => body,
            _ => b"hello h3".to_vec(),
        };

        let mut block = Vec::new();
        qpack::encode(
            &[
                HeaderField::new(b":status", b"200"),
                HeaderField::new(b"content-type", b"text/plain"),
                HeaderField::new(b"content-length", body.len().to_string()),
            ],
            &mut block,
        );
        let mut out = Vec::new();
        Frame::Headers {
            encoded: block.into(),
        }
        .encode(&mut out);
        if !body.is_empty() {
            Frame::Data {
                payload: body.into(),
            }
            .encode(&mut out);
        }
        self.pending.insert(id, out);
    }

    fn flush(&mut self, conn: &mut quinn_proto::Connection) {
        self.pending.retain(|id, buf| {
            let mut send = conn.send_stream(*id);
            if !buf.is_empty() {
                match send.write(buf) {
                    Ok(n) => {
                        buf.drain(..n);
                    }
                    Err(_) => return true,
                }
            }
            if buf.is_empty() {
                let _ = send.finish();
                return false;
            }
            true
        });
    }
}

fn open_control(conn: &mut quinn_proto::Connection) {
    let id = conn.streams().open(Dir::Uni).unwrap();
    let mut buf = vec![0x00];
    Frame::Settings(Settings::default()).encode(&mut buf);
    conn.send_stream(id).write(&buf).unwrap();
}

// ── Client side plumbing ─────────────────────────────────────────────

#[derive(Default)]
struct Pipe {
    inbox: VecDeque<Vec<u8>>,
    sent: VecDeque<Vec<u8>>,
}

impl PacketSocket for Pipe {
    fn recv_burst(
        &mut self,
        max: usize,
        on_packet: &mut dyn FnMut(&[u8], SocketAddr) -> Result<(), FilterError>,
    ) -> Result<usize, FilterError> {
        let mut count = 0;
        while count < max {
            let Some(packet) = self.inbox.pop_front() else {
                break;
            };
            count += 1;
            on_packet(&packet, server_addr())?;
        }
        Ok(count)
    }

    fn send(&mut self, data: &[u8], segment: usize) -> io::Result<usize> {
        self.sent.extend(data.chunks(segment).map(<[u8]>::to_vec));
        Ok(data.len())
    }

    fn input_pending(&mut self) -> io::Result<bool> {
        Ok(!self.inbox.is_empty())
    }

    fn local_addr(&self) -> SocketAddr {
        client_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        server_addr()
    }
}

#[derive(Default)]
struct Wakeups(Vec<(TransferId, Duration, Timer)>);

impl Scheduler for Wakeups {
    fn expire(&mut self, transfer: TransferId, after: Duration, timer: Timer) {
        self.0.push((transfer, after, timer));
    }
}

struct Harness {
    filter: H3Filter<QuinnEngine, Pipe>,
    server: Server,
    sched: Wakeups,
    deadline: Instant,
}

impl Harness {
    fn new(h3_config: H3Config) -> Self {
        init_tracing();
        let (certs, key) = generate_self_signed();
        let server = Server::new(server_config(certs.clone(), key));
        let mut roots = rustls::RootCertStore::empty();
        roots.add(certs[0].clone()).unwrap();
        let engine = QuinnEngine::connect(
            QuicConfig::h3_client(roots).unwrap(),
            h3_config,
            Instant::now(),
            client_addr(),
            server_addr(),
            "localhost",
        )
        .unwrap();
        let filter = H3Filter::new(FilterConfig::default(), engine, Pipe::default()).unwrap();
        Self {
            filter,
            server,
            sched: Wakeups::default(),
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    /// Move datagrams both ways. Sleeps briefly when nothing moved.
    fn pump(&mut self) {
        assert!(Instant::now() < self.deadline, "exchange timed out");
        let now = Instant::now();
        let mut moved = false;
        while let Some(datagram) = self.filter.socket_mut().sent.pop_front() {
            self.server.handle_datagram(now, &datagram);
            moved = true;
        }
        self.server.service(now);
        while let Some(datagram) = self.server.outbox.pop_front() {
            self.filter.socket_mut().inbox.push_back(datagram);
            moved = true;
        }
        if !moved {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn connect(&mut self) {
        let t = Transfer::new(0);
        while !self.filter.connect(&t, &mut self.sched).unwrap() {
            self.pump();
        }
    }

    fn send_all(&mut self, t: &Transfer, request: &[u8]) {
        let mut offset = 0;
        while offset < request.len() {
            match self.filter.send(t, &mut self.sched, &request[offset..], true) {
                Ok(n) => offset += n,
                Err(FilterError::Again) => {}
                Err(e) => panic!("send failed: {e}"),
            }
            self.pump();
        }
    }

    fn recv_all(&mut self, t: &mut Transfer) -> Result<Vec<u8>, FilterError> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match self.filter.recv(t, &mut self.sched, &mut buf) {
                Ok(0) => return Ok(out),
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    t.bytecount += n as u64;
                }
                Err(FilterError::Again) => self.pump(),
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch(&mut self, t: &mut Transfer, request: &[u8]) -> Result<Vec<u8>, FilterError> {
        self.filter.setup_transfer(t).unwrap();
        self.send_all(t, request);
        let response = self.recv_all(t);
        self.filter.done_transfer(t, &mut self.sched);
        response
    }
}

fn get(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: loopback\r\n\r\n").into_bytes()
}

/// Split a rendered response into head and body.
fn split(response: &[u8]) -> (&[u8], &[u8]) {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head not terminated");
    response.split_at(end + 4)
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn get_renders_http1_style_response() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    assert!(h.filter.is_connected());
    assert!(h.filter.appconnect_time().is_some());

    let mut t = Transfer::new(1);
    let response = h.fetch(&mut t, &get("/hello")).unwrap();
    let (head, body) = split(&response);
    assert!(head.starts_with(b"HTTP/3 200 \r\n"));
    let head = String::from_utf8_lossy(head);
    assert!(head.contains("content-type: text/plain\r\n"));
    assert!(head.contains("content-length: 8\r\n"));
    assert_eq!(body, b"hello h3");
    assert_eq!(h.filter.stream_count(), 0);
}

#[test]
fn large_body_arrives_intact() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    let mut t = Transfer::new(1);
    let response = h.fetch(&mut t, &get("/big")).unwrap();
    let (_, body) = split(&response);
    assert_eq!(body.len(), BIG_BODY);
    assert!(body.iter().enumerate().all(|(i, b)| *b == body_byte(i)));
}

#[test]
fn copied_bodies_arrive_intact() {
    let config = H3Config {
        copy_body: true,
        ..H3Config::default()
    };
    let mut h = Harness::new(config);
    h.connect();
    let mut t = Transfer::new(1);
    let response = h.fetch(&mut t, &get("/big")).unwrap();
    let (_, body) = split(&response);
    assert_eq!(body.len(), BIG_BODY);
    assert!(body.iter().enumerate().all(|(i, b)| *b == body_byte(i)));
}

#[test]
fn request_body_is_echoed() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    let mut t = Transfer::new(1);
    let request =
        b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\n\r\nping pong";
    let response = h.fetch(&mut t, request).unwrap();
    let (_, body) = split(&response);
    assert_eq!(body, b"ping pong");
}

#[test]
fn concurrent_transfers_share_the_connection() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    let mut a = Transfer::new(1);
    let mut b = Transfer::new(2);
    h.filter.setup_transfer(&a).unwrap();
    h.filter.setup_transfer(&b).unwrap();
    h.send_all(&a, &get("/big"));
    h.send_all(&b, &get("/hello"));
    assert_eq!(h.filter.stream_count(), 2);
    assert_ne!(h.filter.stream_id(&a), h.filter.stream_id(&b));

    let small = h.recv_all(&mut b).unwrap();
    assert_eq!(split(&small).1, b"hello h3");
    let big = h.recv_all(&mut a).unwrap();
    assert_eq!(split(&big).1.len(), BIG_BODY);
}

#[test]
fn server_reset_fails_only_that_transfer() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    let mut t = Transfer::new(1);
    let err = h.fetch(&mut t, &get("/reset")).unwrap_err();
    assert!(matches!(err, FilterError::StreamReset { partial: false, .. }));

    let mut next = Transfer::new(2);
    let response = h.fetch(&mut next, &get("/hello")).unwrap();
    assert_eq!(split(&response).1, b"hello h3");
}

#[test]
fn shutdown_closes_connection() {
    let mut h = Harness::new(H3Config::default());
    h.connect();
    let t = Transfer::new(0);
    assert!(h.filter.shutdown(&t, &mut h.sched).unwrap());
    while !h.server.closed {
        h.pump();
    }
    assert!(h.filter.engine().quic().is_draining());
    assert!(h.filter.shutdown(&t, &mut h.sched).unwrap());
}
