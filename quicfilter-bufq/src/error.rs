/// Errors returned by [`BufQueue`](crate::BufQueue) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufqError {
    /// A new segment could not be allocated. Nothing was linked.
    #[error("segment allocation failed")]
    Alloc,

    /// Queues need at least one chunk slot per segment.
    #[error("segment capacity must be at least 1")]
    ZeroCapacity,
}
