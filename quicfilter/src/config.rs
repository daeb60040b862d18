use std::time::Duration;

use quicfilter_bufq::DEFAULT_SEGMENT_SLOTS;
use quicfilter_h3::code;

use crate::error::FilterError;

/// Configuration for an [`H3Filter`](crate::H3Filter).
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Chunk slots per receive-queue segment.
    pub segment_slots: usize,
    /// Maximum datagrams taken from the socket per ingress round.
    pub recv_burst: usize,
    /// Maximum packets coalesced into one socket send.
    pub send_burst: usize,
    /// Read size when the engine requires body bytes to be copied out.
    pub body_chunk_size: usize,
    /// Longest request line or header line accepted.
    pub max_header_line: usize,
    /// Largest request header block accepted.
    pub max_header_block: usize,
    /// Application code for stream shutdowns and the connection close.
    pub no_error_code: u64,
    /// Reason phrase sent with the connection close.
    pub shutdown_reason: String,
    /// Wake-up delay when the socket would block on send.
    pub retry_interval: Duration,
    /// `:scheme` for origin-form request targets.
    pub default_scheme: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            segment_slots: DEFAULT_SEGMENT_SLOTS,
            recv_burst: 1000,
            send_burst: 10,
            body_chunk_size: 16 * 1024,
            max_header_line: 8 * 1024,
            max_header_block: 64 * 1024,
            no_error_code: code::H3_NO_ERROR,
            shutdown_reason: "kthxbye".to_string(),
            retry_interval: Duration::from_millis(1),
            default_scheme: "https".to_string(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), FilterError> {
        let positive = [
            (self.segment_slots, "segment_slots"),
            (self.recv_burst, "recv_burst"),
            (self.send_burst, "send_burst"),
            (self.body_chunk_size, "body_chunk_size"),
            (self.max_header_line, "max_header_line"),
        ];
        for (value, name) in positive {
            if value == 0 {
                return Err(FilterError::Config(format!("{name} must be > 0")));
            }
        }
        if self.max_header_block < self.max_header_line {
            return Err(FilterError::Config(
                "max_header_block must be >= max_header_line".into(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(FilterError::Config("retry_interval must be > 0".into()));
        }
        if self.default_scheme.is_empty() {
            return Err(FilterError::Config(
                "default_scheme must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`FilterConfig`].
pub struct FilterConfigBuilder {
    config: FilterConfig,
}

impl FilterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FilterConfig::default(),
        }
    }

    // ── Buffering ───────────────────────────────────────────────────

    pub fn segment_slots(mut self, n: usize) -> Self {
        self.config.segment_slots = n;
        self
    }

    pub fn body_chunk_size(mut self, n: usize) -> Self {
        self.config.body_chunk_size = n;
        self
    }

    // ── Packet I/O ──────────────────────────────────────────────────

    pub fn recv_burst(mut self, n: usize) -> Self {
        self.config.recv_burst = n;
        self
    }

    pub fn send_burst(mut self, n: usize) -> Self {
        self.config.send_burst = n;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    // ── Requests ────────────────────────────────────────────────────

    pub fn max_header_line(mut self, n: usize) -> Self {
        self.config.max_header_line = n;
        self
    }

    pub fn max_header_block(mut self, n: usize) -> Self {
        self.config.max_header_block = n;
        self
    }

    pub fn default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.config.default_scheme = scheme.into();
        self
    }

    // ── Shutdown ────────────────────────────────────────────────────

    pub fn no_error_code(mut self, code: u64) -> Self {
        self.config.no_error_code = code;
        self
    }

    pub fn shutdown_reason(mut self, reason: impl Into<String>) -> Self {
        self.config.shutdown_reason = reason.into();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<FilterConfig, FilterError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for FilterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
