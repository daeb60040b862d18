/// HTTP/3 application error codes (RFC 9114 Section 8.1, RFC 9204 Section 6).
pub mod code {
    pub const H3_NO_ERROR: u64 = 0x0100;
    pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x0101;
    pub const H3_INTERNAL_ERROR: u64 = 0x0102;
    pub const H3_STREAM_CREATION_ERROR: u64 = 0x0103;
    pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x0104;
    pub const H3_FRAME_UNEXPECTED: u64 = 0x0105;
    pub const H3_FRAME_ERROR: u64 = 0x0106;
    pub const H3_EXCESSIVE_LOAD: u64 = 0x0107;
    pub const H3_MISSING_SETTINGS: u64 = 0x010a;
    pub const H3_REQUEST_CANCELLED: u64 = 0x010c;
    pub const QPACK_DECOMPRESSION_FAILED: u64 = 0x0200;
}

/// Errors produced by the HTTP/3 session layer.
#[derive(Debug, thiserror::Error)]
pub enum H3Error {
    /// QUIC transport error.
    #[error("quic: {0}")]
    Quic(#[from] quicfilter_quic::Error),
    /// Frame not allowed on this stream, or reserved from HTTP/2.
    #[error("unexpected frame type")]
    FrameUnexpected,
    /// Control stream did not start with a SETTINGS frame.
    #[error("missing SETTINGS on control stream")]
    MissingSettings,
    /// Frame decoding error (truncated varint, invalid payload, etc.).
    #[error("frame error")]
    FrameError,
    /// A field section larger than this client accepts.
    #[error("field section too large")]
    ExcessiveLoad,
    /// QPACK header block decoding failed.
    #[error("QPACK decoding failed")]
    QpackDecodingFailed,
    /// The server opened a stream it is not allowed to open.
    #[error("stream creation error")]
    StreamCreation,
    /// The server's control stream ended or was reset.
    #[error("critical stream closed")]
    ClosedCriticalStream,
    /// The server does not allow another request stream right now.
    #[error("stream blocked")]
    StreamBlocked,
    /// No request stream with this id.
    #[error("unknown stream {0}")]
    UnknownStream(u64),
    /// The send side of this stream is already finished.
    #[error("stream {0} closed for sending")]
    StreamClosed(u64),
    /// Nothing to do right now.
    #[error("done")]
    Done,
    /// Internal error with a description.
    #[error("internal: {0}")]
    Internal(String),
}

impl H3Error {
    /// Errors that poison the whole connection rather than one stream.
    pub fn is_connection_error(&self) -> bool {
        self.wire_code().is_some()
    }

    /// Application error code to close the connection with, for
    /// connection errors.
    pub fn wire_code(&self) -> Option<u64> {
        Some(match self {
            H3Error::FrameUnexpected => code::H3_FRAME_UNEXPECTED,
            H3Error::MissingSettings => code::H3_MISSING_SETTINGS,
            H3Error::FrameError => code::H3_FRAME_ERROR,
            H3Error::ExcessiveLoad => code::H3_EXCESSIVE_LOAD,
            H3Error::QpackDecodingFailed => code::QPACK_DECOMPRESSION_FAILED,
            H3Error::StreamCreation => code::H3_STREAM_CREATION_ERROR,
            H3Error::ClosedCriticalStream => code::H3_CLOSED_CRITICAL_STREAM,
            H3Error::Internal(_) => code::H3_INTERNAL_ERROR,
            H3Error::Quic(_)
            | H3Error::StreamBlocked
            | H3Error::UnknownStream(_)
            | H3Error::StreamClosed(_)
            | H3Error::Done => return None,
        })
    }
}
