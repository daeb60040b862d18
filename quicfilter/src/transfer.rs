//! The caller's view of one request/response exchange.

use std::fmt;

/// Opaque identifier of a transfer. The filter keys its streams by it and
/// never holds on to the transfer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Short-lived handle passed into every filter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub id: TransferId,
    /// Response body bytes the transfer has delivered so far.
    pub bytecount: u64,
}

impl Transfer {
    pub fn new(id: u64) -> Self {
        Self {
            id: TransferId(id),
            bytecount: 0,
        }
    }
}
