//! Segmented FIFO of chunks.
//!
//! A [`BufQueue`] is a chain of fixed-capacity [`Segment`] rings. Writes go
//! to the tail segment and allocate a new tail when it is full; reads always
//! take the front chunk of the first non-empty segment. A drained segment is
//! unlinked as long as another segment remains, so a queue that grew to k
//! segments shrinks back to exactly one once it is emptied. The last segment
//! is kept even when empty: the steady state of a response stream is one
//! segment being filled and drained over and over.

use std::collections::VecDeque;

use crate::chunk::{Chunk, Span};
use crate::error::BufqError;

/// Default number of chunk slots per segment.
pub const DEFAULT_SEGMENT_SLOTS: usize = 512;

struct Slot<O> {
    chunk: Chunk<O>,
    /// Invariant: `read_offset < chunk.len()` while the slot is queued.
    read_offset: usize,
}

/// Fixed-capacity ring of chunk slots.
struct Segment<O> {
    slots: Box<[Option<Slot<O>>]>,
    /// Next slot to write.
    input: usize,
    /// Front slot, or `None` when the segment holds nothing.
    output: Option<usize>,
}

impl<O> Segment<O> {
    fn try_new(capacity: usize) -> Result<Self, BufqError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| BufqError::Alloc)?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            input: 0,
            output: None,
        })
    }

    fn is_empty(&self) -> bool {
        self.output.is_none()
    }

    fn is_full(&self) -> bool {
        self.output == Some(self.input)
    }

    fn len(&self) -> usize {
        match self.output {
            None => 0,
            Some(out) if out < self.input => self.input - out,
            Some(out) => self.slots.len() - out + self.input,
        }
    }

    fn push(&mut self, slot: Slot<O>) {
        debug_assert!(!self.is_full(), "push into full segment");
        self.slots[self.input] = Some(slot);
        if self.output.is_none() {
            self.output = Some(self.input);
        }
        self.input = (self.input + 1) % self.slots.len();
    }

    fn front_mut(&mut self) -> Option<&mut Slot<O>> {
        let out = self.output?;
        self.slots[out].as_mut()
    }

    fn pop(&mut self) -> Option<Slot<O>> {
        let out = self.output?;
        let slot = self.slots[out].take();
        let next = (out + 1) % self.slots.len();
        self.output = if next == self.input { None } else { Some(next) };
        slot
    }
}

/// Unbounded FIFO of ownership-tagged chunks.
///
/// `O` is the owned buffer type; dropping an `O` releases it.
pub struct BufQueue<O = Vec<u8>> {
    segments: VecDeque<Segment<O>>,
    slots_per_segment: usize,
}

impl<O: AsRef<[u8]>> BufQueue<O> {
    /// Create a queue whose segments hold `slots_per_segment` chunks each.
    pub fn new(slots_per_segment: usize) -> Result<Self, BufqError> {
        if slots_per_segment == 0 {
            return Err(BufqError::ZeroCapacity);
        }
        let mut segments = VecDeque::new();
        segments.push_back(Segment::try_new(slots_per_segment)?);
        Ok(Self {
            segments,
            slots_per_segment,
        })
    }

    /// Append a chunk.
    ///
    /// Zero-length chunks are dropped without touching the queue. On
    /// allocation failure nothing is linked and the chunk is dropped.
    pub fn write(&mut self, chunk: Chunk<O>) -> Result<(), BufqError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let tail_full = self.segments.back().is_none_or(Segment::is_full);
        if tail_full {
            self.segments
                .try_reserve(1)
                .map_err(|_| BufqError::Alloc)?;
            let segment = Segment::try_new(self.slots_per_segment)?;
            self.segments.push_back(segment);
        }
        if let Some(tail) = self.segments.back_mut() {
            tail.push(Slot {
                chunk,
                read_offset: 0,
            });
        }
        Ok(())
    }

    /// Remove the front chunk without copying it.
    ///
    /// The caller takes over the release obligation of `Owned` chunks.
    pub fn read_borrow(&mut self) -> Option<Span<O>> {
        let index = self.front_index()?;
        let slot = self.segments[index].pop()?;
        self.compact(index);
        Some(Span::new(slot.chunk, slot.read_offset))
    }

    /// Copy up to `dest.len()` bytes out of the front chunk.
    ///
    /// Never crosses a chunk boundary. Returns the number of bytes copied and,
    /// when this call finished an `Owned` chunk, the buffer to release.
    pub fn read_copy(&mut self, dest: &mut [u8]) -> (usize, Option<O>) {
        let Some(index) = self.front_index() else {
            return (0, None);
        };
        let Some(slot) = self.segments[index].front_mut() else {
            return (0, None);
        };

        let remaining = &slot.chunk.as_bytes()[slot.read_offset..];
        let n = dest.len().min(remaining.len());
        dest[..n].copy_from_slice(&remaining[..n]);

        if n < remaining.len() {
            slot.read_offset += n;
            return (n, None);
        }

        let released = self.segments[index]
            .pop()
            .and_then(|slot| slot.chunk.into_owned());
        self.compact(index);
        (n, released)
    }

    /// Copy as many bytes as fit into `dest`, draining chunk after chunk.
    ///
    /// Finished `Owned` chunks are dropped.
    pub fn fill(&mut self, dest: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dest.len() {
            let (n, _released) = self.read_copy(&mut dest[total..]);
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    /// True iff no segment has a front chunk.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Number of allocated segments (at least one).
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Tear the queue down, passing every remaining `Owned` buffer to
    /// `release` exactly once. Segments are walked front to back, never
    /// recursively.
    pub fn release_all(mut self, mut release: impl FnMut(O)) {
        while let Some(mut segment) = self.segments.pop_front() {
            while let Some(slot) = segment.pop() {
                if let Some(owned) = slot.chunk.into_owned() {
                    release(owned);
                }
            }
        }
    }

    fn front_index(&self) -> Option<usize> {
        self.segments.iter().position(|s| !s.is_empty())
    }

    /// Unlink the segment at `index` if a read just emptied it and it is
    /// not the last segment left.
    fn compact(&mut self, index: usize) {
        if self.segments.len() > 1 && self.segments[index].is_empty() {
            self.segments.remove(index);
        }
    }
}

impl<O> std::fmt::Debug for BufQueue<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufQueue")
            .field("segments", &self.segments.len())
            .field("slots_per_segment", &self.slots_per_segment)
            .finish()
    }
}
