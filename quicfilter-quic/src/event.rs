use quinn_proto::{ConnectionError, StreamId};

/// Application-facing events produced by [`QuicClient`](crate::QuicClient).
///
/// Poll these via [`QuicClient::poll_event()`](crate::QuicClient::poll_event).
#[derive(Debug)]
pub enum QuicEvent {
    /// The handshake completed.
    Connected,

    /// The peer opened a new stream.
    StreamOpened { stream: StreamId, bidi: bool },

    /// Data (or a FIN, or a reset) is available to read on a stream.
    StreamReadable(StreamId),

    /// Flow control window opened, the stream is writable again.
    StreamWritable(StreamId),

    /// A send stream has been fully acknowledged by the peer.
    StreamFinished(StreamId),

    /// The peer asked us to stop sending on a stream.
    StreamStopped { stream: StreamId, code: u64 },

    /// The peer raised its stream limit; `open_bi`/`open_uni` may succeed again.
    StreamsAvailable { bidi: bool },

    /// The connection was closed or lost.
    ConnectionLost(ConnectionError),
}
