use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use super::client::HttpClient;
use async_trait::async_trait;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain reqwest client whose connection pool can be thrown away.
pub struct BasicClient {
    inner: RwLock<reqwest::Client>,
    timeout: Duration,
}

impl BasicClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// A client that gives up on any single request after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(build_client(timeout)),
            timeout,
        }
    }
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            debug!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        // reqwest::Client is a handle onto a shared pool; clone it out so
        // the lock is not held across the request.
        let client = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        client.execute(req).await
    }

    fn reset(&self) {
        let fresh = build_client(self.timeout);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!("HTTP client replaced");
    }
}
