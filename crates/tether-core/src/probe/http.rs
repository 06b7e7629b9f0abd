//! HTTP readiness probe.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Probe, ProbeResult};
use crate::config::HarnessConfig;
use crate::error::HarnessError;

/// Issues `GET <base_url><path>` and reports ready when the response status
/// matches the expected one (200 unless overridden).
///
/// The base URL is the connection string handed to the caller, so a server
/// whose API lives under `/api` and whose health check is `/admin/hello`
/// is probed with `HttpProbe::new("http://127.0.0.1:2222/api", "/admin/hello")`.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    base_url: String,
    path: String,
    expected_status: u16,
}

impl HttpProbe {
    /// Per-request timeout used by [`HttpProbe::new`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

    pub fn new(base_url: impl Into<String>, path: impl Into<String>) -> Result<Self, HarnessError> {
        Self::with_timeout(base_url, path, Self::DEFAULT_TIMEOUT)
    }

    /// Use the configured probe timeout.
    pub fn from_config(
        base_url: impl Into<String>,
        path: impl Into<String>,
        config: &HarnessConfig,
    ) -> Result<Self, HarnessError> {
        Self::with_timeout(base_url, path, config.probe_timeout)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HarnessError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(HarnessError::InvalidSpec(
                "probe base URL must not be empty".to_string(),
            ));
        }
        let mut path = path.into();
        if !path.is_empty() && !path.starts_with('/') {
            path.insert(0, '/');
        }

        // Loopback traffic must not be routed through an HTTP(S)_PROXY.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| HarnessError::InvalidSpec(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            path,
            expected_status: 200,
        })
    }

    /// Report ready on `status` instead of 200.
    pub fn expect_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    /// The full URL that is probed.
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

/// Flatten an error and its sources into one line; reqwest's own `Display`
/// hides the interesting part ("Connection refused") in the source chain.
fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl Probe for HttpProbe {
    fn describe(&self) -> String {
        format!("GET {}", self.url())
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    async fn check(&self) -> ProbeResult {
        let url = self.url();
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "HTTP probe request failed");
                return ProbeResult::Error(error_chain(&e));
            }
        };

        let status = response.status().as_u16();
        if status != self.expected_status {
            return ProbeResult::NotReady(format!(
                "unexpected status {status} (expected {})",
                self.expected_status
            ));
        }

        match response.text().await {
            Ok(body) => ProbeResult::Ready(body),
            Err(e) => ProbeResult::Error(error_chain(&e)),
        }
    }
}
