//! Ownership-tagged byte spans.

use bytes::Bytes;

/// A span of bytes held by a [`BufQueue`](crate::BufQueue) without copying.
///
/// Only `Owned` carries a release obligation: whoever ends up holding the
/// `O` value is responsible for it, and dropping it releases it. `Static`
/// and `External` spans are views whose memory is managed elsewhere.
#[derive(Debug)]
pub enum Chunk<O = Vec<u8>> {
    /// Bytes that live for the whole program (literal separators etc.).
    Static(&'static [u8]),
    /// Bytes the queue owns until they are read or torn down.
    Owned(O),
    /// A shared view into memory owned by someone else.
    External(Bytes),
}

impl<O: AsRef<[u8]>> Chunk<O> {
    /// The full span, ignoring any read progress.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Chunk::Static(s) => s,
            Chunk::Owned(o) => o.as_ref(),
            Chunk::External(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O> Chunk<O> {
    pub fn is_owned(&self) -> bool {
        matches!(self, Chunk::Owned(_))
    }

    /// Hand over the release obligation, if this chunk has one.
    pub fn into_owned(self) -> Option<O> {
        match self {
            Chunk::Owned(o) => Some(o),
            Chunk::Static(_) | Chunk::External(_) => None,
        }
    }
}

/// A chunk removed from the queue by [`read_borrow`](crate::BufQueue::read_borrow),
/// together with how much of it an earlier copy-read already consumed.
#[derive(Debug)]
pub struct Span<O = Vec<u8>> {
    chunk: Chunk<O>,
    offset: usize,
}

impl<O> Span<O> {
    pub(crate) fn new(chunk: Chunk<O>, offset: usize) -> Self {
        Self { chunk, offset }
    }

    /// Bytes of the chunk that were already copied out before the borrow.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn chunk(&self) -> &Chunk<O> {
        &self.chunk
    }

    pub fn into_chunk(self) -> Chunk<O> {
        self.chunk
    }
}

impl<O: AsRef<[u8]>> Span<O> {
    /// The unread remainder of the chunk.
    pub fn bytes(&self) -> &[u8] {
        &self.chunk.as_bytes()[self.offset..]
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
