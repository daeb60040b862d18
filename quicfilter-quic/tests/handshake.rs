//! Integration tests: `QuicClient` against an in-memory quinn-proto server.
//!
//! Datagrams are shuttled between the client and the server by hand, so the
//! tests need no sockets and no event loop.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use quicfilter_quic::{
    ConnectionError, QuicClient, QuicConfig, QuicEvent, StreamRead, TransportLimits,
};
use quinn_proto::{
    ConnectionHandle, DatagramEvent, Dir, Endpoint, EndpointConfig, Event, ServerConfig,
    StreamEvent, StreamId,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

// ── TLS cert generation ──────────────────────────────────────────────

fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    (vec![cert_der], key.into())
}

fn server_crypto(
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
    transport.max_concurrent_bidi_streams(64u32.into());
    transport.max_concurrent_uni_streams(64u32.into());
    Arc::new(sc)
}

fn client_config(certs: &[CertificateDer<'static>]) -> QuicConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    QuicConfig::h3_client(roots).unwrap()
}

fn client_addr() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

// ── Echo server ──────────────────────────────────────────────────────

/// Server side of one connection. Every bidirectional stream is echoed
/// back and finished once the client finishes it.
struct EchoServer {
    endpoint: Endpoint,
    conn: Option<(ConnectionHandle, quinn_proto::Connection)>,
    outbox: VecDeque<Vec<u8>>,
    lost: Option<ConnectionError>,
}

impl EchoServer {
    fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            endpoint: Endpoint::new(Arc::new(EndpointConfig::default()), Some(config), true, None),
            conn: None,
            outbox: VecDeque::new(),
            lost: None,
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
                match self.endpoint.accept(incoming, now, &mut buf, None) {
                    Ok((ch, conn)) => self.conn = Some((ch, conn)),
                    Err(e) => {
                        if let Some(t) = e.response {
                            self.outbox.push_back(buf[..t.size].to_vec());
                        }
                    }
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
        let Some((ch, conn)) = self.conn.as_mut() else {
            return;
        };
        if conn.poll_timeout().is_some_and(|t| t <= now) {
            conn.handle_timeout(now);
        }
        while let Some(event) = conn.poll_endpoint_events() {
            if let Some(conn_event) = self.endpoint.handle_event(*ch, event) {
                conn.handle_event(conn_event);
            }
        }
        let mut readable = Vec::new();
        while let Some(event) = conn.poll() {
            match event {
                Event::Stream(StreamEvent::Opened { dir }) => {
                    while let Some(id) = conn.streams().accept(dir) {
                        readable.push(id);
                    }
                }
                Event::Stream(StreamEvent::Readable { id }) => readable.push(id),
                Event::ConnectionLost { reason } => self.lost = Some(reason),
                _ => {}
            }
        }
        for id in readable {
            echo(conn, id);
        }
        let mut buf = Vec::new();
        while let Some(t) = conn.poll_transmit(now, 1, &mut buf) {
            self.outbox.push_back(buf[..t.size].to_vec());
            buf.clear();
        }
    }
}

fn echo(conn: &mut quinn_proto::Connection, id: StreamId) {
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
    if id.dir() == Dir::Bi {
        let mut send = conn.send_stream(id);
        if !data.is_empty() {
            let _ = send.write(&data);
        }
        if fin {
            let _ = send.finish();
        }
    }
}

// ── Driver ───────────────────────────────────────────────────────────

/// Shuttle datagrams both ways until `done` holds.
fn drive(
    client: &mut QuicClient,
    server: &mut EchoServer,
    mut done: impl FnMut(&mut QuicClient, &mut EchoServer) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "exchange timed out");
        let now = Instant::now();
        if client.poll_timeout().is_some_and(|t| t <= now) {
            client.handle_timeout(now);
        }
        let mut moved = false;
        while let Some(n) = client.poll_transmit(now, &mut buf) {
            server.handle_datagram(now, &buf[..n]);
            moved = true;
        }
        server.service(now);
        while let Some(datagram) = server.outbox.pop_front() {
            client.handle_datagram(now, &datagram, server_addr());
            moved = true;
        }
        if done(client, server) {
            return;
        }
        if !moved {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn connect(certs: &[CertificateDer<'static>]) -> QuicClient {
    QuicClient::connect(
        client_config(certs),
        Instant::now(),
        client_addr(),
        server_addr(),
        "localhost",
    )
    .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn handshake_completes() {
    let (certs, key) = generate_self_signed();
    let mut server = EchoServer::new(server_crypto(certs.clone(), key));
    let mut client = connect(&certs);
    assert!(!client.is_established());

    drive(&mut client, &mut server, |c, _| c.is_established());

    assert!(matches!(client.poll_event(), Some(QuicEvent::Connected)));
    assert!(!client.is_draining());
    assert!(client.max_udp_payload() >= 1200);
    assert_eq!(client.peer(), server_addr());
    assert_eq!(
        client.peer_streams_left_bidi(),
        u64::from(TransportLimits::default().max_streams_bidi)
    );
}

#[test]
fn stream_echo() {
    let (certs, key) = generate_self_signed();
    let mut server = EchoServer::new(server_crypto(certs.clone(), key));
    let mut client = connect(&certs);
    drive(&mut client, &mut server, |c, _| c.is_established());

    let stream = client.open_bi().unwrap();
    assert_eq!(client.stream_send(stream, b"hello QUIC").unwrap(), 10);
    client.stream_finish(stream).unwrap();

    let mut received = Vec::new();
    let mut finished = false;
    drive(&mut client, &mut server, |c, _| {
        while let Some(event) = c.poll_event() {
            if !matches!(event, QuicEvent::StreamReadable(id) if id == stream) {
                continue;
            }
            loop {
                match c.stream_read(stream, 4).unwrap() {
                    StreamRead::Data(chunk) => {
                        assert!(chunk.len() <= 4);
                        received.extend_from_slice(&chunk);
                    }
                    StreamRead::Finished => {
                        finished = true;
                        break;
                    }
                    StreamRead::Blocked | StreamRead::Reset(_) => break,
                }
            }
        }
        finished
    });
    assert_eq!(received, b"hello QUIC");
}

#[test]
fn application_close_reaches_server() {
    let (certs, key) = generate_self_signed();
    let mut server = EchoServer::new(server_crypto(certs.clone(), key));
    let mut client = connect(&certs);
    drive(&mut client, &mut server, |c, _| c.is_established());

    client.close(Instant::now(), 0x100, b"kthxbye");
    assert!(client.is_draining());
    drive(&mut client, &mut server, |_, s| s.lost.is_some());

    match server.lost.take() {
        Some(ConnectionError::ApplicationClosed(close)) => {
            assert_eq!(u64::from(close.error_code), 0x100);
            assert_eq!(&close.reason[..], b"kthxbye");
        }
        other => panic!("expected application close, got {other:?}"),
    }
}

#[test]
fn untrusted_certificate_is_a_tls_failure() {
    let (certs, key) = generate_self_signed();
    let (other_certs, _) = generate_self_signed();
    let mut server = EchoServer::new(server_crypto(certs, key));
    let mut client = connect(&other_certs);

    drive(&mut client, &mut server, |c, _| c.close_reason().is_some());

    assert!(!client.is_established());
    assert!(client.tls_failure().is_some());
    assert!(!client.is_timed_out());
}
