//! Reconnectable transports to gateway endpoints.
//!
//! The binary gateway speaks over a long-lived TLS socket. A
//! [`BinaryConnection`] owns that socket exclusively and replaces it in place
//! on reconnect. How the socket is opened is behind the [`Connector`] trait
//! so local gateways and tests can use plain TCP or in-memory streams.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use pushd_core::App;
use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName},
    RootCertStore,
};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    protocol::frame::{ErrorTuple, ERROR_TUPLE_BYTES},
};

/// Attempts made by [`BinaryConnection::write`] before giving up.
const WRITE_ATTEMPTS: usize = 3;

/// Binary gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApnsConfig {
    /// How long to wait for an error tuple after writing a batch.
    #[serde(with = "crate::secs")]
    pub select_window: Duration,

    /// Timeout for establishing a gateway connection.
    #[serde(with = "crate::secs")]
    pub connect_timeout: Duration,

    /// Whether to wait for an error tuple at all. When disabled every
    /// written notification is treated as delivered.
    pub check_for_errors: bool,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            select_window: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            check_for_errors: true,
        }
    }
}

/// Byte stream to a gateway.
pub trait GatewayStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> GatewayStream for T {}

/// Boxed gateway stream.
pub type BoxedStream = Box<dyn GatewayStream>;

/// Opens streams to a gateway endpoint.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Connects to `endpoint` (`host:port`).
    async fn connect(&self, endpoint: &str) -> Result<BoxedStream>;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

async fn connect_tcp(endpoint: &str, connect_timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(error)) => Err(DeliveryError::transport(format!("connect to {endpoint}: {error}"))),
        Err(_) => Err(DeliveryError::transport(format!(
            "connect to {endpoint} timed out after {connect_timeout:?}"
        ))),
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<BoxedStream> {
        let stream = connect_tcp(endpoint, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}

/// TLS connector presenting an app's client certificate.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Builds a connector from the app's PEM bundle (certificate chain and
    /// private key), trusting the webpki root set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the app has no certificate or the
    /// bundle cannot be parsed.
    pub fn for_app(app: &App, connect_timeout: Duration) -> Result<Self> {
        let pem = app.certificate.as_deref().ok_or_else(|| {
            DeliveryError::configuration(format!("app {} has no certificate", app.name))
        })?;

        let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                DeliveryError::configuration(format!("app {} certificate: {e}", app.name))
            })?;
        if certs.is_empty() {
            return Err(DeliveryError::configuration(format!(
                "app {} certificate bundle holds no certificates",
                app.name
            )));
        }

        let key = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| {
            DeliveryError::configuration(format!("app {} private key: {e}", app.name))
        })?;

        let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| DeliveryError::configuration(format!("TLS protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| {
                DeliveryError::configuration(format!("app {} client certificate: {e}", app.name))
            })?;

        Ok(Self { config: Arc::new(config), connect_timeout })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &str) -> Result<BoxedStream> {
        let host = endpoint.rsplit_once(':').map_or(endpoint, |(host, _)| host);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| DeliveryError::configuration(format!("gateway host {host}: {e}")))?;

        let tcp = connect_tcp(endpoint, self.connect_timeout).await?;
        let stream = tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| DeliveryError::transport(format!("TLS handshake with {endpoint}: {e}")))?;

        Ok(Box::new(stream))
    }
}

/// What arrived on the socket while waiting for an error tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleRead {
    /// Nothing arrived within the window.
    Timeout,
    /// The gateway reported an error.
    Tuple(ErrorTuple),
    /// The gateway closed the connection without reporting an error.
    Closed,
}

/// Reconnectable socket to a binary gateway.
pub struct BinaryConnection {
    name: String,
    endpoint: String,
    connector: Arc<dyn Connector>,
    stream: Option<BoxedStream>,
}

impl fmt::Debug for BinaryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryConnection")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl BinaryConnection {
    /// Creates a disconnected connection.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self { name: name.into(), endpoint: endpoint.into(), connector, stream: None }
    }

    /// Gateway endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether a socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens the socket.
    pub async fn connect(&mut self) -> Result<()> {
        let stream = self.connector.connect(&self.endpoint).await?;
        self.stream = Some(stream);
        info!(connection = %self.name, endpoint = %self.endpoint, "connected to gateway");
        Ok(())
    }

    /// Replaces the socket with a fresh one.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.close().await;
        self.connect().await
    }

    /// Closes the socket. Closing a closed connection does nothing.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.shutdown().await {
                debug!(connection = %self.name, error = %error, "error closing gateway socket");
            }
        }
    }

    /// Writes `bytes` in one write and flushes, reconnecting between
    /// attempts.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut last_error = DeliveryError::transport("no write attempted");

        for attempt in 1..=WRITE_ATTEMPTS {
            if self.stream.is_none() {
                if let Err(error) = self.connect().await {
                    last_error = error;
                    continue;
                }
            }

            match self.write_once(bytes).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        connection = %self.name,
                        attempt,
                        error = %error,
                        "write to gateway failed, reconnecting"
                    );
                    self.close().await;
                    last_error = DeliveryError::from(error);
                },
            }
        }

        Err(last_error)
    }

    async fn write_once(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Waits up to `window` for a 6-byte error tuple.
    pub async fn read_error_tuple(&mut self, window: Duration) -> Result<TupleRead> {
        let stream = self.stream.as_mut().ok_or(DeliveryError::Disconnected)?;
        let mut buf = [0_u8; ERROR_TUPLE_BYTES];

        match tokio::time::timeout(window, stream.read_exact(&mut buf)).await {
            Err(_) => Ok(TupleRead::Timeout),
            Ok(Ok(_)) => Ok(TupleRead::Tuple(ErrorTuple::decode(buf))),
            Ok(Err(error)) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(TupleRead::Closed)
            },
            Ok(Err(error)) => Err(DeliveryError::from(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::apns::ApnsDispatcher;

    fn assert_send_sync<T: Send + Sync + ?Sized>() {}

    #[test]
    fn connections_can_move_between_worker_threads() {
        assert_send_sync::<BoxedStream>();
        assert_send_sync::<BinaryConnection>();
        assert_send_sync::<ApnsDispatcher>();
    }

    #[tokio::test]
    async fn reads_error_tuple_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let gateway = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut frame = [0_u8; 4];
            socket.read_exact(&mut frame).await.unwrap();
            socket.write_all(&ErrorTuple::new(4, 69).encode()).await.unwrap();
            frame
        });

        let mut connection = BinaryConnection::new(
            "test",
            endpoint,
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
        );
        connection.connect().await.unwrap();
        connection.write(b"ping").await.unwrap();

        let read = connection.read_error_tuple(Duration::from_secs(1)).await.unwrap();
        assert_eq!(read, TupleRead::Tuple(ErrorTuple::new(4, 69)));
        assert_eq!(&gateway.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn silence_within_window_is_a_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut connection = BinaryConnection::new(
            "test",
            "gateway:2195",
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
        );
        connection.stream = Some(Box::new(client));

        let read = connection.read_error_tuple(Duration::from_millis(20)).await.unwrap();
        assert_eq!(read, TupleRead::Timeout);
    }

    #[tokio::test]
    async fn closed_socket_without_tuple_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        let mut connection = BinaryConnection::new(
            "test",
            "gateway:2195",
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
        );
        connection.stream = Some(Box::new(client));
        drop(server);

        let read = connection.read_error_tuple(Duration::from_secs(1)).await.unwrap();
        assert_eq!(read, TupleRead::Closed);
    }

    #[tokio::test]
    async fn connect_failure_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut connection = BinaryConnection::new(
            "test",
            endpoint,
            Arc::new(TcpConnector::new(Duration::from_secs(1))),
        );
        let error = connection.connect().await.unwrap_err();
        assert!(error.is_retryable());
    }

    #[test]
    fn tls_connector_requires_a_certificate() {
        let app = App::new(pushd_core::AppId(1), "ios", pushd_core::Protocol::Apns);
        let error = TlsConnector::for_app(&app, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(error, DeliveryError::Configuration { .. }));
    }
}
