//! Outbound transports used by competitor matching: domain-restricted web
//! search and product page retrieval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dealhunt_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::competitor::RenderMode;

pub const DEFAULT_SEARCH_URL: &str = "https://api.tavily.com/search";

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search api returned status {status}")]
    Status { status: u16 },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("render service returned status {status} for {url}")]
    Render { status: u16, url: String },
}

#[async_trait]
pub trait SiteSearch: Send + Sync {
    /// Result URLs for `query`, restricted to `domain`, best match first.
    async fn search(
        &self,
        query: &str,
        domain: &str,
        max_results: usize,
    ) -> Result<Vec<String>, SearchError>;
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page_html(&self, url: &str, mode: RenderMode) -> Result<String, SearchError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: String,
    search_depth: &'a str,
    include_domains: Vec<&'a str>,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
}

#[derive(Debug, Clone)]
pub struct TavilySearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl TavilySearch {
    pub fn new(client: reqwest::Client, endpoint: Option<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_SEARCH_URL.to_string()),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl SiteSearch for TavilySearch {
    async fn search(
        &self,
        query: &str,
        domain: &str,
        max_results: usize,
    ) -> Result<Vec<String>, SearchError> {
        let request = TavilyRequest {
            query: format!("site:{domain} {query}"),
            search_depth: "basic",
            include_domains: vec![domain],
            max_results,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SearchError::Status {
                status: response.status().as_u16(),
            });
        }
        let body: TavilyResponse = response.json().await?;
        debug!(domain, query, results = body.results.len(), "site search");
        Ok(body.results.into_iter().map(|r| r.url).collect())
    }
}

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    #[serde(rename = "gotoOptions")]
    goto_options: GotoOptions,
}

#[derive(Debug, Serialize)]
struct GotoOptions {
    #[serde(rename = "waitUntil")]
    wait_until: &'static str,
}

/// Static pages through the shared fetcher; rendered pages through a remote
/// headless-browser `/content` endpoint when one is configured.
#[derive(Debug, Clone)]
pub struct HttpPageSource {
    fetcher: Arc<HttpFetcher>,
    run_id: Uuid,
    render_url: Option<String>,
    timeout: Duration,
}

impl HttpPageSource {
    pub fn new(
        fetcher: Arc<HttpFetcher>,
        run_id: Uuid,
        render_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            run_id,
            render_url: render_url.map(|u| u.trim_end_matches('/').to_string()),
            timeout,
        }
    }

    async fn rendered(&self, render_url: &str, url: &str) -> Result<String, SearchError> {
        let response = self
            .fetcher
            .client()
            .post(format!("{render_url}/content"))
            .timeout(self.timeout)
            .json(&RenderRequest {
                url,
                goto_options: GotoOptions {
                    wait_until: "networkidle2",
                },
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SearchError::Render {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

fn host_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn page_html(&self, url: &str, mode: RenderMode) -> Result<String, SearchError> {
        match (mode, self.render_url.as_deref()) {
            (RenderMode::Rendered, Some(render_url)) => self.rendered(render_url, url).await,
            (RenderMode::Rendered, None) => {
                debug!(url, "no render service configured; fetching static html");
                let page = self
                    .fetcher
                    .fetch_with_deadline(self.run_id, &host_key(url), url, self.timeout)
                    .await?;
                Ok(page.text())
            }
            (RenderMode::Static, _) => {
                let page = self
                    .fetcher
                    .fetch_with_deadline(self.run_id, &host_key(url), url, self.timeout)
                    .await?;
                Ok(page.text())
            }
        }
    }
}
