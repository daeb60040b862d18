use quinn_proto::{
    ClosedStream, ConnectError, ConnectionError, FinishError, ReadError, ReadableError,
    WriteError,
};

/// Errors returned by quicfilter-quic operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("config: {0}")]
    Config(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("write: {0}")]
    Write(#[from] WriteError),

    #[error("finish: {0}")]
    Finish(#[from] FinishError),

    #[error("read: {0}")]
    Read(#[from] ReadError),

    #[error("readable: {0}")]
    Readable(#[from] ReadableError),

    #[error("stream: {0}")]
    ClosedStream(#[from] ClosedStream),
}

impl Error {
    /// True when a stream write failed only for lack of flow-control credit.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Error::Write(WriteError::Blocked))
    }
}
