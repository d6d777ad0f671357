/// Web search tool
///
/// Used by the engine when the document index has nothing relevant.
/// Results are ranked as returned by the provider.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{send_with_retry, RetryPolicy};
use crate::config::Config;
use crate::error::{BotError, Result};

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

pub struct TavilySearch {
    http_client: reqwest::Client,
    api_key: String,
    retry: RetryPolicy,
}

impl TavilySearch {
    /// Returns `None` when no Tavily key is configured
    pub fn from_config(config: &Config, http_client: reqwest::Client) -> Option<Self> {
        config.tavily_api_key.as_ref().map(|api_key| Self {
            http_client,
            api_key: api_key.clone(),
            retry: RetryPolicy::from_config(config),
        })
    }
}

#[async_trait]
impl WebSearch for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>> {
        log::info!("Searching the web for: {}", query);

        let request = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results,
            search_depth: "basic",
            include_answer: false,
        };

        let response = send_with_retry("Tavily search", self.retry, || {
            self.http_client.post(TAVILY_SEARCH_URL).json(&request)
        })
        .await?;

        let response: TavilyResponse = response.json().await.map_err(|e| {
            BotError::external("Tavily search", format!("failed to parse response: {}", e))
        })?;

        let results: Vec<WebResult> = response
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .take(max_results)
            .map(|r| WebResult {
                title: r.title,
                snippet: r.content,
                url: r.url,
            })
            .collect();

        log::info!("Web search returned {} results", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tavily_response() {
        let body = r#"{
            "query": "dune part two release",
            "results": [
                {
                    "title": "Dune: Part Two",
                    "url": "https://example.com/dune",
                    "content": "Released March 2024",
                    "score": 0.98
                },
                {"url": "https://example.com/untitled", "content": "No title here"}
            ]
        }"#;
        let parsed: TavilyResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].title, "Dune: Part Two");
        assert_eq!(parsed.results[1].title, "");
    }

    #[test]
    fn test_missing_results_field_is_empty() {
        let parsed: TavilyResponse = serde_json::from_str(r#"{"query": "x"}"#).unwrap();
        assert!(parsed.results.is_empty());
    }
}
