//! Health polling
//!
//! Bounded-retry, fixed-interval polling of an HTTP endpoint. The poller
//! never errors: it answers whether the endpoint became healthy within the
//! attempt budget.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Attempts used when waiting for an endpoint to become reachable
pub const REACHABILITY_ATTEMPTS: u32 = 30;
/// Pause between reachability attempts
pub const REACHABILITY_INTERVAL: Duration = Duration::from_secs(2);
/// Attempts used when probing a health endpoint
pub const HEALTH_ATTEMPTS: u32 = 10;
/// Pause between health endpoint attempts
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(3);

/// Per-request timeout of [`HttpProbe`]
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One HTTP probe of an endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issues a single GET and returns the HTTP status code.
    ///
    /// # Errors
    ///
    /// Returns a description of the transport failure when no response
    /// arrived.
    async fn probe(&self, url: &str) -> Result<u16, String>;
}

/// [`HealthProbe`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe with the default per-request timeout
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(PROBE_REQUEST_TIMEOUT)
    }

    /// Creates a probe with a custom per-request timeout
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<u16, String> {
        self.client
            .get(url)
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

/// Polls an endpoint until it answers 2xx or the budget is spent
#[derive(Clone)]
pub struct HealthPoller {
    probe: Arc<dyn HealthProbe>,
}

impl HealthPoller {
    /// Creates a poller over the given probe
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// Makes up to `max_attempts` attempts, sleeping `interval` between
    /// them (not after the last). Returns true on the first 2xx response.
    pub async fn poll(&self, url: &str, max_attempts: u32, interval: Duration) -> bool {
        for attempt in 1..=max_attempts {
            match self.probe.probe(url).await {
                Ok(status) if (200..300).contains(&status) => {
                    tracing::info!(url, attempt, status, "Endpoint healthy");
                    return true;
                }
                Ok(status) => {
                    tracing::debug!(url, attempt, max_attempts, status, "Endpoint not healthy yet");
                }
                Err(error) => {
                    tracing::debug!(url, attempt, max_attempts, %error, "Endpoint unreachable");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        tracing::warn!(url, max_attempts, "Endpoint did not become healthy");
        false
    }
}
