//! Client-side HTTP/3 session for quicfilter-quic.
//!
//! A sans-IO HTTP/3 client that sits on top of
//! [`quicfilter_quic::QuicClient`]. It handles:
//!
//! - HTTP/3 frame encoding/decoding (DATA, HEADERS, SETTINGS, GOAWAY)
//! - QPACK field compression against the static table, with Huffman decoding
//! - Control stream management (SETTINGS exchange, GOAWAY tracking)
//! - Per-request body buffering as zero-copy [`bytes::Bytes`] views
//!
//! # Architecture
//!
//! ```text
//!   UDP datagrams
//!        │
//!   ┌────▼──────────────┐
//!   │ quicfilter-quic    │  QUIC transport (quinn-proto wrapper)
//!   │ QuicClient         │  QuicEvent: StreamReadable, StreamOpened, etc.
//!   └────┬──────────────┘
//!        │ stream_read() / stream_send()
//!   ┌────▼──────────────┐
//!   │ quicfilter-h3      │  HTTP/3 framing + QPACK
//!   │ H3Client           │  H3Event: Headers, Data, Finished, Reset, GoAway
//!   └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quicfilter_h3::{H3Client, H3Config, H3Event, H3Error, HeaderField};
//!
//! let mut h3 = H3Client::new(&mut quic, H3Config::default())?;
//! let stream = h3.send_request(&mut quic, &[
//!     HeaderField::new(b":method", b"GET"),
//!     HeaderField::new(b":scheme", b"https"),
//!     HeaderField::new(b":authority", b"example.com"),
//!     HeaderField::new(b":path", b"/"),
//! ], true)?;
//!
//! loop {
//!     match h3.poll(&mut quic) {
//!         Ok((id, H3Event::Data)) => {
//!             let body = h3.peek_body(id)?.clone();
//!             h3.body_consumed(&mut quic, id, body.len())?;
//!         }
//!         Ok((id, event)) => println!("{id}: {event:?}"),
//!         Err(H3Error::Done) => break,
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
mod huffman;
pub mod qpack;
pub mod settings;
mod stream;

pub use client::{H3Client, Shutdown};
pub use config::H3Config;
pub use error::{H3Error, code};
pub use frame::Frame;
pub use qpack::HeaderField;
pub use settings::Settings;
pub use stream::H3Event;
