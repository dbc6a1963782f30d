/*
[INPUT]:  HTTP configuration (environment, timeouts, credentials)
[OUTPUT]: Configured reqwest client that sends public and signed requests
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use crate::http::error::{BinanceError, Result};
use crate::http::signature::{RequestSigner, SystemClock, TimestampProvider};
use crate::types::{Environment, ServerTime, SignedRequestSpec};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const SERVER_TIME_PATH: &str = "/api/v3/time";
const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;

/// Capability to send a signed REST request
///
/// The session token manager depends on this rather than on the concrete
/// client so it can be driven by a fake in tests.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send_signed(&self, spec: SignedRequestSpec) -> Result<serde_json::Value>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub environment: Environment,
    /// Default `recvWindow` added to signed calls
    pub recv_window: Option<u64>,
    /// Replaces the environment REST base when set
    pub base_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            environment: Environment::Production,
            recv_window: Some(DEFAULT_RECV_WINDOW_MS),
            base_url: None,
        }
    }
}

/// Credentials for authenticated requests
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct SigningContext {
    api_key: String,
    signer: RequestSigner,
}

/// Main HTTP client for the Binance REST API
pub struct BinanceClient {
    http_client: Client,
    base_url: Url,
    recv_window: Option<u64>,
    signing: Option<SigningContext>,
    clock: Arc<dyn TimestampProvider>,
}

impl fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url.as_str())
            .field("recv_window", &self.recv_window)
            .field("signing", &self.signing)
            .finish()
    }
}

impl BinanceClient {
    /// Create a client with default configuration and no credentials
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        let base = config
            .base_url
            .as_deref()
            .unwrap_or_else(|| config.environment.rest_base_url());

        Ok(Self {
            http_client,
            base_url: Url::parse(base)?,
            recv_window: config.recv_window,
            signing: None,
            clock: Arc::new(SystemClock),
        })
    }

    /// Attach credentials; an empty secret is rejected here
    pub fn with_credentials(mut self, credentials: Credentials) -> Result<Self> {
        if credentials.api_key.trim().is_empty() {
            return Err(BinanceError::Config("API key is empty".to_string()));
        }
        let signer = RequestSigner::new(credentials.api_secret)?;
        self.signing = Some(SigningContext {
            api_key: credentials.api_key,
            signer,
        });
        Ok(self)
    }

    /// Replace the timestamp source
    pub fn with_clock(mut self, clock: Arc<dyn TimestampProvider>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.signing.is_some()
    }

    fn endpoint_url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http_client.request(method, url)
    }

    /// Send an unsigned request
    pub async fn send_public(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value> {
        let mut url = self.endpoint_url(path)?;
        if !params.is_empty() {
            url.set_query(Some(&crate::http::signature::canonical_query(params)));
        }
        debug!(method = %method, path, "rest public request");
        execute(self.request(method, url)).await
    }

    /// Sign and send a privileged request
    pub async fn send_signed_request(&self, spec: SignedRequestSpec) -> Result<serde_json::Value> {
        let signing = self.signing.as_ref().ok_or_else(|| BinanceError::Authentication {
            message: "API credentials are not configured".to_string(),
        })?;

        let recv_window = spec.recv_window.or(self.recv_window);
        let signed = signing
            .signer
            .sign(&spec.params, recv_window, self.clock.as_ref())?;

        let mut url = self.endpoint_url(&spec.path)?;
        url.set_query(Some(&signed.query_string()));

        debug!(
            method = %spec.method,
            path = %spec.path,
            timestamp = signed.timestamp,
            "rest signed request"
        );

        let builder = self
            .request(spec.method, url)
            .header(API_KEY_HEADER, signing.api_key.as_str());
        execute(builder).await
    }

    /// Exchange server time, handy for checking clock skew
    pub async fn server_time(&self) -> Result<ServerTime> {
        let value = self.send_public(Method::GET, SERVER_TIME_PATH, &[]).await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl RequestSender for BinanceClient {
    async fn send_signed(&self, spec: SignedRequestSpec) -> Result<serde_json::Value> {
        self.send_signed_request(spec).await
    }
}

async fn execute(builder: RequestBuilder) -> Result<serde_json::Value> {
    let response = builder.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let err = BinanceError::from_api_body(status, &body);
        warn!(status = status.as_u16(), error = %err, "rest request rejected");
        return Err(err);
    }

    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(&body)?)
}
