//! quicfilter-quic: a single outbound QUIC connection via quinn-proto.
//!
//! This crate wraps [quinn-proto](https://docs.rs/quinn-proto)'s sans-IO QUIC
//! state machine for the one-connection client case and exposes an
//! event-based [`QuicClient`] API. It never touches a socket.
//!
//! # Example
//!
//! ```rust,ignore
//! use quicfilter_quic::{QuicClient, QuicConfig, QuicEvent, StreamRead};
//!
//! let mut quic = QuicClient::connect(config, Instant::now(), local, peer, "example.com")?;
//! // Feed incoming datagrams:
//! quic.handle_datagram(Instant::now(), &data, peer);
//! while let Some(event) = quic.poll_event() {
//!     if let QuicEvent::StreamReadable(stream) = event {
//!         while let StreamRead::Data(bytes) = quic.stream_read(stream, usize::MAX)? {
//!             consume(bytes);
//!         }
//!     }
//! }
//! // Drain outgoing packets:
//! let mut buf = Vec::new();
//! while let Some(n) = quic.poll_transmit(Instant::now(), &mut buf) {
//!     udp.send(&buf[..n])?;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod event;

pub use client::{QuicClient, StreamRead};
pub use config::{H3_ALPN, QuicConfig, TransportLimits};
pub use error::Error;
pub use event::QuicEvent;

// Re-export commonly used quinn-proto types for convenience.
pub use quinn_proto::{ConnectionError, Dir, Side, StreamId};
