//! HTTP transport for the HTTP/2 and JSON gateways.
//!
//! Each dispatcher loop owns one [`HttpConnection`], a pooled
//! `reqwest::Client` that can be rebuilt in place after a transport fault.

use std::{fmt, time::Duration};

use reqwest::{header::HeaderMap, Identity, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Responses larger than this are truncated before being kept.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// HTTP gateway client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Total request timeout.
    #[serde(with = "crate::secs")]
    pub timeout: Duration,

    /// Connect timeout.
    #[serde(with = "crate::secs")]
    pub connect_timeout: Duration,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("pushd/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A gateway response with its body read.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body, truncated to a bounded size.
    pub body: String,
    /// Round-trip time.
    pub duration: Duration,
}

impl GatewayResponse {
    /// Reads the body of a response.
    pub async fn read(response: Response, duration: Duration) -> Self {
        let status = response.status();
        let headers = response.headers().clone();

        let body = match response.bytes().await {
            Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
                let truncated = String::from_utf8_lossy(&bytes[..MAX_RESPONSE_BODY_SIZE]);
                format!("{truncated}... (truncated)")
            },
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(error) => {
                warn!(error = %error, "failed to read gateway response body");
                String::new()
            },
        };

        debug!(status = status.as_u16(), duration_ms = duration.as_millis(), "gateway responded");
        Self { status, headers, body, duration }
    }
}

/// Reconnectable HTTP client bound to one dispatcher loop.
#[derive(Clone)]
pub struct HttpConnection {
    name: String,
    config: ClientConfig,
    identity_pem: Option<String>,
    client: reqwest::Client,
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("client_identity", &self.identity_pem.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpConnection {
    /// Builds a client, presenting `identity_pem` (certificate chain and
    /// private key) as a TLS client identity when given.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the identity cannot be parsed or
    /// the client cannot be built.
    pub fn connect(
        name: impl Into<String>,
        config: ClientConfig,
        identity_pem: Option<String>,
    ) -> Result<Self> {
        let client = build_client(&config, identity_pem.as_deref())?;
        Ok(Self { name: name.into(), config, identity_pem, client })
    }

    /// The underlying client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Drops pooled connections by rebuilding the client.
    pub fn reconnect(&mut self) -> Result<()> {
        debug!(connection = %self.name, "rebuilding gateway client");
        self.client = build_client(&self.config, self.identity_pem.as_deref())?;
        Ok(())
    }
}

fn build_client(config: &ClientConfig, identity_pem: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .user_agent(&config.user_agent)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(pem) = identity_pem {
        let identity = Identity::from_pem(pem.as_bytes())
            .map_err(|e| DeliveryError::configuration(format!("client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn reads_status_headers_and_body() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(503)
                    .insert_header("retry-after", "120")
                    .set_body_string("busy"),
            )
            .mount(&mock_server)
            .await;

        let connection = HttpConnection::connect("test", ClientConfig::default(), None).unwrap();
        let start = Instant::now();
        let response = connection.client().post(mock_server.uri()).send().await.unwrap();
        let response = GatewayResponse::read(response, start.elapsed()).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers.get("retry-after").unwrap(), "120");
        assert_eq!(response.body, "busy");
    }

    #[tokio::test]
    async fn oversized_bodies_are_truncated() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(70 * 1024)))
            .mount(&mock_server)
            .await;

        let connection = HttpConnection::connect("test", ClientConfig::default(), None).unwrap();
        let response = connection.client().get(mock_server.uri()).send().await.unwrap();
        let response = GatewayResponse::read(response, Duration::ZERO).await;

        assert!(response.body.ends_with("... (truncated)"));
    }

    #[test]
    fn malformed_identity_is_a_configuration_error() {
        let error = HttpConnection::connect(
            "test",
            ClientConfig::default(),
            Some("not a pem".to_string()),
        )
        .unwrap_err();
        assert!(matches!(error, DeliveryError::Configuration { .. }));
    }

    #[test]
    fn reconnect_rebuilds_client() {
        let mut connection = HttpConnection::connect("test", ClientConfig::default(), None).unwrap();
        assert!(connection.reconnect().is_ok());
    }
}
