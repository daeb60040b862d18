//! Seams toward the surrounding event loop.

use std::time::Duration;

use crate::transfer::TransferId;

/// Why a transfer asked to be woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Run the transfer again as soon as possible.
    RunNow,
    /// The engine's timeout deadline, or a socket send that would block.
    Quic,
}

/// Wake-up primitive of the event loop.
pub trait Scheduler {
    /// Run `transfer` again after `after`. A zero delay means right away.
    /// A later call for the same `timer` replaces the earlier deadline.
    fn expire(&mut self, transfer: TransferId, after: Duration, timer: Timer);
}

/// Socket readiness a transfer waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    pub fn is_none(&self) -> bool {
        !self.read && !self.write
    }
}
