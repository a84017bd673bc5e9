//! `SerpAPI` web search

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::voice::search::WebSearch;
use crate::{Error, Result};

const SERPAPI_BASE: &str = "https://serpapi.com";

/// Google results through `SerpAPI`
pub struct SerpApiSearch {
    client: Client,
    api_key: SecretString,
    base_url: String,
}

impl SerpApiSearch {
    #[must_use]
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: SERPAPI_BASE.to_string(),
        }
    }

    /// Point the client at a different API root
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn search_url(&self, query: &str) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}/search.json", self.base_url),
            &[
                ("q", query),
                ("engine", "google"),
                ("api_key", self.api_key.expose_secret()),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid SerpAPI URL: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganicResult {
    snippet: Option<String>,
}

#[async_trait]
impl WebSearch for SerpApiSearch {
    async fn snippets(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.search_url(query)?)
            .send()
            .await
            .map_err(|e| Error::SearchFailed(format!("SerpAPI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SearchFailed(format!("SerpAPI error {status}: {body}")));
        }

        let results: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::SearchFailed(format!("malformed SerpAPI response: {e}")))?;
        if let Some(error) = results.error {
            return Err(Error::SearchFailed(error));
        }

        Ok(results
            .organic_results
            .into_iter()
            .filter_map(|r| r.snippet)
            .filter(|s| !s.trim().is_empty())
            .take(limit)
            .collect())
    }

    fn name(&self) -> &'static str {
        "serpapi"
    }
}
