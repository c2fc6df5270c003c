//! HTTP adapters for the metrics and listing providers.
//!
//! Both adapters speak JSON over HTTPS (rustls) and translate HTTP outcomes
//! into [`ProviderError`]s: 429 becomes `RateLimited`, 401/403 become
//! `Unauthorized`, undecodable bodies become `Malformed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{ListingProvider, MetricSeries, MetricsProvider, PanelRef, PlacementPage};
use crate::error::ProviderError;
use crate::types::{format_ts, EntityId, Granularity};

/// Connection settings shared by both adapters.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// Bearer token, obtained elsewhere
    pub bearer_token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
struct JsonClient {
    client: Client,
    config: HttpProviderConfig,
}

impl JsonClient {
    fn new(config: HttpProviderConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;
        Ok(Self { client, config })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let request = self.client.get(url);
        match &self.config.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Sends the request and decodes the body. `Ok(None)` on 404 or 204.
    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, ProviderError> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice::<Option<T>>(&body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.config.timeout)
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Metrics endpoint: `GET {base}/metrics/{entity}?granularity=..&from=..&to=..`
#[derive(Debug, Clone)]
pub struct HttpMetricsProvider {
    inner: JsonClient,
}

impl HttpMetricsProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, String> {
        Ok(Self {
            inner: JsonClient::new(config)?,
        })
    }
}

#[async_trait]
impl MetricsProvider for HttpMetricsProvider {
    async fn get_metrics(
        &self,
        entity_id: &EntityId,
        granularity: Granularity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<MetricSeries>, ProviderError> {
        let request = self
            .inner
            .get(&format!("metrics/{}", entity_id))
            .query(&[
                ("granularity", granularity.as_str().to_string()),
                ("from", format_ts(&from)),
                ("to", format_ts(&to)),
            ]);
        self.inner.fetch(request).await
    }
}

/// Listing endpoints:
/// - `GET {base}/surfaces/{surface}/panels`
/// - `GET {base}/surfaces/{surface}/panels/{panel}/regions/{region}?page=..&variant=..`
#[derive(Debug, Clone)]
pub struct HttpListingProvider {
    inner: JsonClient,
}

impl HttpListingProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, String> {
        Ok(Self {
            inner: JsonClient::new(config)?,
        })
    }
}

#[async_trait]
impl ListingProvider for HttpListingProvider {
    async fn list_panels(&self, surface: &str) -> Result<Vec<PanelRef>, ProviderError> {
        let request = self.inner.get(&format!("surfaces/{}/panels", surface));
        Ok(self.inner.fetch(request).await?.unwrap_or_default())
    }

    async fn list_placements(
        &self,
        surface: &str,
        panel: &str,
        variant: Option<&str>,
        region: &str,
        page_index: u32,
    ) -> Result<PlacementPage, ProviderError> {
        let mut request = self
            .inner
            .get(&format!(
                "surfaces/{}/panels/{}/regions/{}",
                surface, panel, region
            ))
            .query(&[("page", page_index)]);
        if let Some(variant) = variant {
            request = request.query(&[("variant", variant)]);
        }
        page_or_missing(page_index, self.inner.fetch(request).await?)
    }
}

/// A missing first page means the scope itself is gone upstream; past the
/// first page it only means the listing ended.
fn page_or_missing(
    page_index: u32,
    page: Option<PlacementPage>,
) -> Result<PlacementPage, ProviderError> {
    match page {
        Some(page) => Ok(page),
        None if page_index == 0 => Err(ProviderError::Status(StatusCode::NOT_FOUND.as_u16())),
        None => Ok(PlacementPage::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_missing_first_page_is_an_error() {
        let result = page_or_missing(0, None);
        assert!(matches!(result, Err(ProviderError::Status(404))));
        assert!(!result.unwrap_err().is_transient());

        let tail = page_or_missing(3, None).unwrap();
        assert!(tail.results.is_empty());
        assert!(!tail.has_more);

        let page = PlacementPage {
            results: vec![],
            has_more: true,
        };
        assert!(page_or_missing(0, Some(page)).unwrap().has_more);
    }

    #[test]
    fn test_clients_build_with_defaults() {
        assert!(HttpMetricsProvider::new(HttpProviderConfig::default()).is_ok());
        assert!(HttpListingProvider::new(HttpProviderConfig::default()).is_ok());
    }
}
