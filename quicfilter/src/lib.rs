//! HTTP/3 protocol filter for a multi-transfer client.
//!
//! An [`H3Filter`] turns one QUIC connection into a byte-stream filter that
//! many transfers share. Each transfer writes an HTTP/1.1 request head (and
//! body) and reads back an HTTP/1.1-style response; underneath, every
//! transfer owns one HTTP/3 request stream.
//!
//! - Packet pump: bounded receive bursts, segmented sends, timer re-arming
//! - Request heads parsed and mapped to HTTP/3 pseudo-headers
//! - Response heads rendered into a zero-copy [`quicfilter_bufq::BufQueue`]
//! - Response bodies peeked straight out of the engine when it lends them
//! - Cross-stream flow control: blocked senders wake on the next ingress
//!
//! # Architecture
//!
//! ```text
//!   transfers (send / recv / pollset)
//!        │
//!   ┌────▼──────────────┐
//!   │ quicfilter         │  H3Filter: per-transfer H3Stream, packet pump,
//!   │                    │  event dispatch, flow control
//!   └────┬─────────┬────┘
//!        │ Engine  │ PacketSocket
//!   ┌────▼───────┐ ┌▼────────────┐
//!   │QuinnEngine │ │UdpTransport │
//!   │ quic + h3  │ │ (UdpSocket) │
//!   └────────────┘ └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quicfilter::{FilterConfig, H3Filter, QuinnEngine, Transfer, UdpTransport};
//!
//! let socket = UdpTransport::connect(local, peer)?;
//! let engine = QuinnEngine::connect(quic_config, h3_config, now, local, peer, "example.com")?;
//! let mut filter = H3Filter::new(FilterConfig::default(), engine, socket)?;
//!
//! let transfer = Transfer::new(1);
//! while !filter.connect(&transfer, &mut sched)? {
//!     // wait for the socket or the QUIC timer
//! }
//! filter.setup_transfer(&transfer)?;
//! filter.send(&transfer, &mut sched, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", true)?;
//! let n = filter.recv(&transfer, &mut sched, &mut buf)?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
mod flow;
mod pump;
pub mod request;
pub mod scheduler;
pub mod socket;
mod stream;
pub mod transfer;

pub use config::{FilterConfig, FilterConfigBuilder};
pub use engine::{Engine, QuinnEngine};
pub use error::{EngineError, ErrorKind, FilterError};
pub use filter::H3Filter;
pub use request::{Request, RequestError, RequestParser};
pub use scheduler::{Interest, Scheduler, Timer};
pub use socket::{PacketSocket, UdpTransport};
pub use stream::StreamState;
pub use transfer::{Transfer, TransferId};
