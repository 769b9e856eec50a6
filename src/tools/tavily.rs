use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::web_search::{SearchError, SearchHit, SearchProvider};

static TAVILY_API_URL: &str = "https://api.tavily.com/search";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TavilySearchProvider {
    api_key: String,
    client: reqwest::Client,
}

impl TavilySearchProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;
        Ok(Self { api_key: api_key.into(), client })
    }
}

#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    query: &'a str,
    max_results: usize,
}

/// Root response from the Tavily search API
#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilySearchResult>,
}

#[derive(Debug, Deserialize)]
struct TavilySearchResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl From<TavilySearchResult> for SearchHit {
    fn from(result: TavilySearchResult) -> Self {
        SearchHit { title: result.title, url: result.url, snippet: result.content }
    }
}

#[async_trait]
impl SearchProvider for TavilySearchProvider {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        tracing::debug!("Searching Tavily for query: {query}");
        let response = self
            .client
            .post(TAVILY_API_URL)
            .bearer_auth(&self.api_key)
            .json(&TavilySearchRequest { query, max_results })
            .send()
            .await
            .map_err(|e| SearchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            tracing::error!("Tavily API error (status {status}): {error_body}");
            return Err(SearchError::RequestFailed(format!("HTTP {status}: {error_body}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SearchError::ResponseParsingFailed(e.to_string()))?;
        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<Vec<SearchHit>, SearchError> {
    let parsed: TavilySearchResponse = serde_json::from_str(body).map_err(|e| {
        tracing::error!("Failed to parse Tavily response: {e}");
        SearchError::ResponseParsingFailed(format!("JSON parsing error: {e}"))
    })?;
    Ok(parsed.results.into_iter().map(SearchHit::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_in_rank_order() {
        let body = r#"{
            "query": "Tokyo weather",
            "results": [
                {"title": "Forecast", "url": "https://weather.example/tokyo", "content": "Sunny", "score": 0.9},
                {"url": "https://news.example/tokyo", "score": 0.5}
            ]
        }"#;
        let hits = parse_response(body).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://weather.example/tokyo");
        assert_eq!(hits[0].snippet, "Sunny");
        assert_eq!(hits[1].title, "");
    }

    #[test]
    fn missing_results_is_empty() {
        assert!(parse_response("{}").unwrap().is_empty());
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        assert!(matches!(parse_response("<html>"), Err(SearchError::ResponseParsingFailed(_))));
    }
}
