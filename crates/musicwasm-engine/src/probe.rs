//! Stream reachability check used to decide whether a details result is usable.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// True when `url` answers a HEAD request with a success status.
    async fn is_reachable(&self, url: &str) -> bool;
}

/// HEAD-request probe over reqwest.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.head(url).timeout(self.timeout).send().await {
            Ok(response) => {
                let status = response.status();
                if !status.is_success() {
                    tracing::debug!(url, status = status.as_u16(), "stream not reachable");
                }
                status.is_success()
            }
            Err(e) => {
                tracing::debug!(url, "stream probe failed: {e}");
                false
            }
        }
    }
}
