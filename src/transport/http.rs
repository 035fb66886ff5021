//! HTTP delivery transport.
//!
//! Uses a reusable `reqwest::Client` with connection pooling and a request
//! timeout. The request URL already carries the whole report, so the body is
//! always empty.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{DeliveryOutcome, DeliveryTransport};
use crate::error::Result;
use crate::protocol::RequestDescriptor;

/// Default timeout for one delivery attempt
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP method used for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    method: HttpMethod,
}

impl HttpTransport {
    /// Build a transport with the given per-attempt timeout and method
    ///
    /// # Errors
    ///
    /// Returns error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration, method: HttpMethod) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("geo-uplink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, method })
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn send(&self, request: &RequestDescriptor) -> DeliveryOutcome {
        let builder = match self.method {
            HttpMethod::Get => self.client.get(request.url()),
            HttpMethod::Post => self.client.post(request.url()),
        };

        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("Server answered HTTP {}", status);
                DeliveryOutcome::from_status(status)
            }
            Err(e) => {
                debug!("Request failed: {}", e);
                DeliveryOutcome::TransientFailure(e.to_string())
            }
        }
    }
}
