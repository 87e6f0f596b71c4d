//! Fetching raw feed bytes over HTTP.
//!
//! [`HttpClient`] executes requests and can be decorated with credentials
//! from [`auth`]. The poller talks to a [`FeedTransport`], which
//! [`HttpTransport`] implements on top of any `HttpClient`.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ApiKeySettings;
use crate::error::FeedError;
use auth::{ApiKey, UrlParam};

/// Issues a GET for `url` and returns the body.
///
/// # Errors
///
/// Fails on an unparsable URL, a network error, or a non-2xx status.
#[tracing::instrument(level = "debug", skip_all, fields(url = %url))]
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
) -> Result<Bytes, FeedError> {
    let parsed = url
        .parse::<reqwest::Url>()
        .map_err(|e| FeedError::Transport(format!("invalid feed URL '{url}': {e}")))?;
    let req = reqwest::Request::new(reqwest::Method::GET, parsed);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?)
}

/// Where the poller gets feed bytes from.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FeedError>;

    /// Discards the underlying connection. Called by the poller's watchdog
    /// when a fetch appears to hang; a response to the abandoned fetch is
    /// never observed.
    fn reset(&self) {}
}

/// [`FeedTransport`] over an [`HttpClient`].
#[derive(Clone)]
pub struct HttpTransport {
    client: Arc<dyn HttpClient>,
}

impl HttpTransport {
    pub fn new(client: impl HttpClient + 'static) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn from_client(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Bytes, FeedError> {
        fetch_bytes(self.client.as_ref(), url).await
    }

    fn reset(&self) {
        self.client.reset();
    }
}

/// Builds the client stack for a feed, adding credentials when configured.
pub fn client_for(api_key: Option<&ApiKeySettings>) -> Result<Arc<dyn HttpClient>, FeedError> {
    let client: Arc<dyn HttpClient> = match api_key {
        None => Arc::new(BasicClient::new()),
        Some(ApiKeySettings::Header { name, key }) => {
            Arc::new(ApiKey::new(BasicClient::new(), name, key)?)
        }
        Some(ApiKeySettings::Query { name, key }) => {
            Arc::new(UrlParam::new(BasicClient::new(), name.clone(), key.clone()))
        }
    };
    Ok(client)
}
