use std::io;

use quicfilter_bufq::BufqError;
use quicfilter_h3::H3Error;

use crate::request::RequestError;
use crate::transfer::TransferId;

/// Classified results of a call into the transport engine.
///
/// The filter branches on these; they never reach the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Nothing to do right now (no packet, no event, no credit).
    #[error("done")]
    Done,

    /// The peer's stream limit forbids opening another request stream.
    #[error("stream blocked")]
    StreamBlocked,

    /// The stream is unknown or in a state that forbids the operation.
    #[error("invalid stream state")]
    InvalidStreamState,

    /// Data was written past the end of the stream.
    #[error("final size exceeded")]
    FinalSize,

    /// The TLS handshake failed.
    #[error("tls failure")]
    TlsFail,

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Any other protocol error, with a description.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<H3Error> for EngineError {
    fn from(e: H3Error) -> Self {
        match e {
            H3Error::Done => EngineError::Done,
            H3Error::StreamBlocked => EngineError::StreamBlocked,
            H3Error::UnknownStream(_) => EngineError::InvalidStreamState,
            H3Error::StreamClosed(_) => EngineError::FinalSize,
            H3Error::Quic(quicfilter_quic::Error::ConnectionClosed) => EngineError::Closed,
            other => EngineError::Protocol(other.to_string()),
        }
    }
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No progress now; wait for socket readiness or a scheduled wake-up.
    RetryLater,
    /// Only the affected transfer fails.
    Exchange,
    /// Every transfer on the connection fails.
    Connection,
}

/// Errors returned by [`H3Filter`](crate::H3Filter) operations.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// Try again after the next wake-up.
    #[error("would block")]
    Again,

    /// The server reset the stream.
    #[error("stream {stream_id} reset by server")]
    StreamReset {
        stream_id: u64,
        /// Response body bytes had already reached the transfer.
        partial: bool,
    },

    /// The server closed the stream before sending response headers.
    #[error("stream {stream_id} closed cleanly before response headers")]
    ClosedBeforeHeaders { stream_id: u64 },

    /// The engine refused the operation in the stream's current state.
    #[error("invalid stream state")]
    InvalidStreamState,

    /// Request body bytes were sent past the end of the stream.
    #[error("request body exceeds the stream's final size")]
    FinalSize,

    /// The stream closed before the request was fully sent.
    #[error("stream closed before the request was sent")]
    StreamClosed,

    /// A response header field could not be rendered.
    #[error("malformed response header: {0}")]
    MalformedHeaders(String),

    /// The outgoing request could not be parsed.
    #[error("request: {0}")]
    Request(#[from] RequestError),

    /// Buffering the response failed.
    #[error("buffer: {0}")]
    Alloc(#[from] BufqError),

    /// The engine failed to send.
    #[error("send failed: {0}")]
    Send(String),

    /// The engine failed to receive.
    #[error("recv failed: {0}")]
    Recv(String),

    /// The transfer has no stream on this connection.
    #[error("no stream for transfer {0}")]
    UnknownTransfer(TransferId),

    /// The connection's idle timeout elapsed.
    #[error("connection idle timeout")]
    IdleTimeout,

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection is draining and takes no new work.
    #[error("connection is draining")]
    Draining,

    /// The server's certificate did not verify.
    #[error("peer verification failed: {0}")]
    PeerVerification(String),

    /// The server closed the connection during the handshake.
    #[error("weird server reply")]
    WeirdServerReply,

    /// HTTP/3 protocol failure on the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FilterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilterError::Again => ErrorKind::RetryLater,
            FilterError::StreamReset { .. }
            | FilterError::ClosedBeforeHeaders { .. }
            | FilterError::InvalidStreamState
            | FilterError::FinalSize
            | FilterError::StreamClosed
            | FilterError::MalformedHeaders(_)
            | FilterError::Request(_)
            | FilterError::Alloc(_)
            | FilterError::Send(_)
            | FilterError::Recv(_)
            | FilterError::UnknownTransfer(_) => ErrorKind::Exchange,
            FilterError::IdleTimeout
            | FilterError::ConnectionClosed
            | FilterError::Draining
            | FilterError::PeerVerification(_)
            | FilterError::WeirdServerReply
            | FilterError::Protocol(_)
            | FilterError::Config(_)
            | FilterError::Io(_) => ErrorKind::Connection,
        }
    }

    pub fn is_again(&self) -> bool {
        matches!(self, FilterError::Again)
    }
}
