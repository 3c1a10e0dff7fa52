use crate::config::ServicesConfig;
use crate::models::{IpEchoResponse, IpLookup};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("public IP echo failed: {0}")]
    Echo(#[source] reqwest::Error),
    #[error("geolocation lookup failed: {0}")]
    Geolocation(#[source] reqwest::Error),
    #[error("proxy request failed: {0}")]
    Proxy(#[source] reqwest::Error),
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Outbound calls made by the `/api/ip` proxy.
///
/// One client per service so each carries its own timeout. No retries: a
/// call either answers within its timeout or the caller falls back.
#[derive(Clone)]
pub struct GeoProvider {
    echo_client: Client,
    geo_client: Client,
    echo_url: String,
    geo_url: String,
    fields: String,
}

impl GeoProvider {
    pub fn new(services: &ServicesConfig) -> Result<Self, LookupError> {
        Ok(Self {
            echo_client: build_client(services.ip_echo_timeout())?,
            geo_client: build_client(services.geolocation_timeout())?,
            echo_url: services.ip_echo_url.clone(),
            geo_url: services.geolocation_url.trim_end_matches('/').to_string(),
            fields: services.geolocation_fields.clone(),
        })
    }

    /// Asks the echo service which public address we are reachable at.
    pub async fn fetch_public_ip(&self) -> Result<String, LookupError> {
        let res = self
            .echo_client
            .get(&self.echo_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(LookupError::Echo)?
            .json::<IpEchoResponse>()
            .await
            .map_err(LookupError::Echo)?;

        Ok(res.ip)
    }

    /// Returns the geolocation service's payload for `ip` without interpreting it.
    pub async fn lookup(&self, ip: &str) -> Result<serde_json::Value, LookupError> {
        let url = format!("{}/{}", self.geo_url, ip);

        self.geo_client
            .get(url)
            .query(&[("fields", self.fields.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(LookupError::Geolocation)?
            .json::<serde_json::Value>()
            .await
            .map_err(LookupError::Geolocation)
    }
}

/// The map view's one-shot client for the proxy endpoint.
pub struct ProxyClient {
    client: Client,
    endpoint: String,
}

impl ProxyClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, LookupError> {
        Ok(Self {
            client: build_client(Duration::from_secs(15))?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// Any JSON body counts as an answer, whatever the status. The proxy's
    /// `{ error }` body simply carries no locality; only transport and
    /// decoding failures are errors.
    pub async fn fetch_ip_location(&self) -> Result<IpLookup, LookupError> {
        self.client
            .get(format!("{}/api/ip", self.endpoint))
            .send()
            .await
            .map_err(LookupError::Proxy)?
            .json::<IpLookup>()
            .await
            .map_err(LookupError::Proxy)
    }
}

fn build_client(timeout: Duration) -> Result<Client, LookupError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(LookupError::Client)
}
