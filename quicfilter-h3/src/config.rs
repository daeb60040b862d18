use crate::settings::Settings;

/// Client-side HTTP/3 session configuration.
#[derive(Debug, Clone)]
pub struct H3Config {
    /// SETTINGS sent on our control stream.
    pub settings: Settings,
    /// Body bytes read ahead from QUIC per stream before the application
    /// consumes them. Default: 128 KiB.
    pub max_buffered_body: usize,
    /// Largest DATA frame payload written per `send_body` call.
    /// Default: 64 KiB.
    pub max_data_frame: usize,
    /// Body bytes must be copied out with `recv_body`; `peek_body` is
    /// unavailable. Default: false.
    pub copy_body: bool,
}

impl Default for H3Config {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            max_buffered_body: 128 * 1024,
            max_data_frame: 64 * 1024,
            copy_body: false,
        }
    }
}
