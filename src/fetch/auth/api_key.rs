use crate::error::FeedError;
use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// The header name and value are validated once at construction, so every
/// request carries the same pre-built header.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    value: HeaderValue,
}

impl<C> ApiKey<C> {
    /// Wraps `inner`, sending `key` in the `header_name` header (e.g.
    /// `"x-api-key"`).
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, FeedError> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| FeedError::Config(format!("invalid API key header name: {e}")))?;
        let mut value = HeaderValue::from_str(key)
            .map_err(|e| FeedError::Config(format!("invalid API key header value: {e}")))?;
        value.set_sensitive(true);

        Ok(Self {
            inner,
            header_name,
            value,
        })
    }

    /// Convenience constructor that uses `Authorization: Bearer <key>`, the
    /// most common pattern for OAuth-style tokens.
    pub fn bearer(inner: C, key: &str) -> Result<Self, FeedError> {
        Self::new(inner, "Authorization", &format!("Bearer {key}"))
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.value.clone());
        self.inner.execute(req).await
    }

    fn reset(&self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    #[test]
    fn test_rejects_invalid_header_name() {
        let result = ApiKey::new(BasicClient::new(), "bad header", "secret");
        assert!(matches!(result, Err(FeedError::Config(_))));
    }

    #[test]
    fn test_bearer_value() {
        let client = ApiKey::bearer(BasicClient::new(), "token").unwrap();
        assert_eq!(client.header_name, "authorization");
        assert_eq!(client.value, "Bearer token");
        assert!(client.value.is_sensitive());
    }
}
