//! Client for aggregator registration and heartbeat endpoints

use async_trait::async_trait;
use provider_common::{Error, Result};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

pub const PROVIDER_ADDRESS_HEADER: &str = "X-Provider-Address";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Outbound calls to one aggregator.
///
/// Implementations need not enforce timeouts; the registrar bounds every call.
#[async_trait]
pub trait AggregatorClient: Send + Sync {
    /// Send a registration. `body` is transmitted byte for byte, since
    /// `signature` was computed over exactly those bytes.
    async fn register(
        &self,
        aggregator_url: &str,
        body: Vec<u8>,
        provider_address: &str,
        signature: &str,
    ) -> Result<()>;

    /// Liveness ping for one registered API
    async fn heartbeat(&self, aggregator_url: &str, api_id: &str, provider_address: &str)
        -> Result<()>;
}

/// reqwest-backed client
#[derive(Clone, Default)]
pub struct HttpAggregatorClient {
    client: reqwest::Client,
}

impl HttpAggregatorClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

fn endpoint(aggregator_url: &str, path: &str) -> String {
    format!("{}{}", aggregator_url.trim_end_matches('/'), path)
}

async fn check_status(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::AggregatorRejected {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn register(
        &self,
        aggregator_url: &str,
        body: Vec<u8>,
        provider_address: &str,
        signature: &str,
    ) -> Result<()> {
        let url = endpoint(aggregator_url, "/api/register");
        debug!("Registering with aggregator: {}", url);

        let response = self
            .client
            .post(&url)
            .header(PROVIDER_ADDRESS_HEADER, provider_address)
            .header(SIGNATURE_HEADER, signature)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        check_status(response).await
    }

    async fn heartbeat(
        &self,
        aggregator_url: &str,
        api_id: &str,
        provider_address: &str,
    ) -> Result<()> {
        // Config load restricts API ids to URL-safe characters
        let url = endpoint(aggregator_url, &format!("/api/{}/heartbeat", api_id));

        let response = self
            .client
            .post(&url)
            .header(PROVIDER_ADDRESS_HEADER, provider_address)
            .header(CONTENT_TYPE, "application/json")
            .body("{}")
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        check_status(response).await
    }
}
