//! Flow-control coordination across the streams of one connection.
//!
//! A stream is marked blocked when the engine refuses request bytes and
//! confirms its window is exhausted. Any ingress round that consumed a
//! packet may have carried a window update, so it unblocks every blocked
//! stream and wakes its transfer at once; blocked transfers never wait for a
//! timer.

use std::collections::HashMap;
use std::time::Duration;

use tracing::trace;

use crate::scheduler::{Interest, Scheduler, Timer};
use crate::stream::H3Stream;
use crate::transfer::TransferId;

/// Mark `stream` as waiting for window credit.
pub(crate) fn block(stream: &mut H3Stream, transfer: TransferId) {
    if !stream.flow_blocked {
        trace!(%transfer, stream = stream.log_id(), "stream window exhausted");
    }
    stream.flow_blocked = true;
}

/// Clear every blocked flag and wake those streams' transfers. Returns how
/// many streams were blocked.
pub(crate) fn resume_all(
    streams: &mut HashMap<TransferId, H3Stream>,
    sched: &mut dyn Scheduler,
) -> usize {
    let mut resumed = 0;
    for (&transfer, stream) in streams.iter_mut() {
        if stream.flow_blocked {
            trace!(%transfer, stream = stream.log_id(), "unblocking stream");
            stream.flow_blocked = false;
            sched.expire(transfer, Duration::ZERO, Timer::RunNow);
            resumed += 1;
        }
    }
    resumed
}

/// Wake every transfer so each observes the connection's fate.
pub(crate) fn expire_all(streams: &HashMap<TransferId, H3Stream>, sched: &mut dyn Scheduler) {
    for &transfer in streams.keys() {
        sched.expire(transfer, Duration::ZERO, Timer::RunNow);
    }
}

/// Socket interest for a transfer.
///
/// A transfer that wants to send on an opened stream without window credit
/// waits for readability instead: only incoming packets can bring credit.
/// Unsent packets in the send buffer always need writability.
pub(crate) fn pollset(want: Interest, exhausted: bool, sendbuf_pending: bool) -> Interest {
    if want.is_none() {
        return want;
    }
    let exhausted = want.write && exhausted;
    Interest {
        read: want.read || exhausted,
        write: (want.write && !exhausted) || sendbuf_pending,
    }
}
