use std::sync::Arc;
use std::time::Duration;

use quinn_proto::crypto::rustls::QuicClientConfig;
use quinn_proto::{ClientConfig, EndpointConfig, IdleTimeout, TransportConfig, VarInt};

use crate::error::Error;

/// ALPN identifier for HTTP/3.
pub const H3_ALPN: &[u8] = b"h3";

/// Transport parameters advertised to the server.
#[derive(Debug, Clone)]
pub struct TransportLimits {
    /// Concurrent bidirectional streams the server may open. Default: 100.
    pub max_streams_bidi: u32,
    /// Concurrent unidirectional streams the server may open. Default: 100.
    pub max_streams_uni: u32,
    /// Per-stream receive window. Default: 128 KiB.
    pub stream_window: u32,
    /// Connection-wide receive window. Default: 1 MiB.
    pub conn_window: u32,
    /// Idle timeout. Default: `None` (the server's value applies).
    pub idle_timeout: Option<Duration>,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_streams_bidi: 100,
            max_streams_uni: 100,
            stream_window: 128 * 1024,
            conn_window: 1024 * 1024,
            idle_timeout: None,
        }
    }
}

impl TransportLimits {
    /// Build the quinn transport config. Windows slide as the application
    /// reads, so these are also the steady-state credit.
    pub fn transport_config(&self) -> Result<TransportConfig, Error> {
        let mut transport = TransportConfig::default();
        transport
            .max_concurrent_bidi_streams(self.max_streams_bidi.into())
            .max_concurrent_uni_streams(self.max_streams_uni.into())
            .stream_receive_window(VarInt::from_u32(self.stream_window))
            .receive_window(VarInt::from_u32(self.conn_window));
        let idle = match self.idle_timeout {
            Some(d) => Some(
                IdleTimeout::try_from(d)
                    .map_err(|_| Error::Config("idle timeout out of range".into()))?,
            ),
            None => None,
        };
        transport.max_idle_timeout(idle);
        Ok(transport)
    }
}

/// Configuration for a [`QuicClient`](crate::QuicClient).
pub struct QuicConfig {
    /// Shared endpoint configuration (connection IDs, supported versions, etc.).
    pub endpoint_config: Arc<EndpointConfig>,
    /// Client-side TLS/QUIC config.
    pub client_config: ClientConfig,
    /// Limits the client config was built with. Used to estimate the
    /// server's bidirectional stream budget, which quinn-proto does not
    /// expose.
    pub limits: TransportLimits,
    /// Allow path MTU discovery. Default: true.
    pub allow_mtud: bool,
    /// Deterministic RNG seed for testing. Default: `None` (random).
    pub rng_seed: Option<[u8; 32]>,
}

impl QuicConfig {
    /// Create a config from a prepared quinn client config.
    pub fn client(client_config: ClientConfig) -> Self {
        Self {
            endpoint_config: Arc::new(EndpointConfig::default()),
            client_config,
            limits: TransportLimits::default(),
            allow_mtud: true,
            rng_seed: None,
        }
    }

    /// HTTP/3 client trusting `roots`, with default transport limits.
    pub fn h3_client(roots: rustls::RootCertStore) -> Result<Self, Error> {
        let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Self::h3_client_with_crypto(crypto, TransportLimits::default())
    }

    /// HTTP/3 client from a caller-supplied rustls config. The ALPN list is
    /// replaced with `h3`.
    pub fn h3_client_with_crypto(
        mut crypto: rustls::ClientConfig,
        limits: TransportLimits,
    ) -> Result<Self, Error> {
        crypto.alpn_protocols = vec![H3_ALPN.to_vec()];
        let quic_crypto =
            QuicClientConfig::try_from(crypto).map_err(|e| Error::Tls(e.to_string()))?;
        let mut client_config = ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(limits.transport_config()?));
        Ok(Self {
            limits,
            ..Self::client(client_config)
        })
    }
}
