//! Zero-copy FIFO of byte chunks.
//!
//! Producers append [`Chunk`]s that are either static literals, buffers the
//! queue takes ownership of, or shared views into someone else's memory.
//! Consumers either take the front chunk as-is ([`BufQueue::read_borrow`]) or
//! copy bytes out of it ([`BufQueue::read_copy`], [`BufQueue::fill`]). Bytes
//! come out in exactly the order they went in, and every owned buffer is
//! released exactly once.

pub mod chunk;
pub mod error;
pub mod queue;

pub use chunk::{Chunk, Span};
pub use error::BufqError;
pub use queue::{BufQueue, DEFAULT_SEGMENT_SLOTS};
