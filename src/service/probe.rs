//! Public IP probe against the gluetun control server.
//!
//! A probe is a single `GET /v1/publicip/ip` round trip. It never retries,
//! retry policy lives in [`crate::service::poller`].

use std::{net::Ipv6Addr, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;

const PUBLIC_IP_PATH: &str = "/v1/publicip/ip";

/// Address of the service that reports a container's public identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEndpoint {
    host: String,
    port: u16,
}

impl ProbeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self, PUBLIC_IP_PATH)
    }
}

impl std::fmt::Display for ProbeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bare = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);
        // IPv6 literals need brackets to keep the port separable
        if bare.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", bare, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A successful probe. The identifier is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityReading {
    pub identifier: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe request to {endpoint} failed: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Malformed probe payload from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, endpoint: &ProbeEndpoint) -> Result<ConnectivityReading, ProbeError>;
}

#[derive(Deserialize)]
struct PublicIpResponse {
    public_ip: String,
}

/// Decode the `{"public_ip": "..."}` payload. Blank identifiers are rejected
/// so a reading always means the tunnel reported an address.
fn parse_reading(endpoint: &ProbeEndpoint, body: &[u8]) -> Result<ConnectivityReading, ProbeError> {
    let payload: PublicIpResponse =
        serde_json::from_slice(body).map_err(|e| ProbeError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    let identifier = payload.public_ip.trim();
    if identifier.is_empty() {
        return Err(ProbeError::Decode {
            endpoint: endpoint.to_string(),
            reason: "public_ip is empty".to_string(),
        });
    }

    Ok(ConnectivityReading {
        identifier: identifier.to_string(),
    })
}

#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, endpoint: &ProbeEndpoint) -> Result<ConnectivityReading, ProbeError> {
        let network = |source| ProbeError::Network {
            endpoint: endpoint.to_string(),
            source,
        };

        let body = self
            .client
            .get(endpoint.url())
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(network)?
            .bytes()
            .await
            .map_err(network)?;

        parse_reading(endpoint, &body)
    }
}
