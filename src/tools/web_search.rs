use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Tool, ToolDefinition, ToolOutput};
use crate::errors::AppError;

pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";

/// One ranked result from a search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Web search failed: {0}")]
    RequestFailed(String),
    #[error("Web search response parsing failed: {0}")]
    ResponseParsingFailed(String),
}

/// External search capability: query in, ranked hits out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// Exposes a [`SearchProvider`] to the model as the `web_search` tool.
pub struct WebSearchTool {
    provider: Arc<dyn SearchProvider>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(provider: Arc<dyn SearchProvider>, max_results: usize) -> Self {
        Self { provider, max_results }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: WEB_SEARCH_TOOL_NAME.to_string(),
            description: "Search the web for current information. Use this for recent events, \
                          live data such as weather or prices, or anything you are unsure about."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn invoke(&self, arguments: &Value) -> Result<ToolOutput, AppError> {
        let query = self.query(arguments);
        if query.trim().is_empty() {
            return Err(AppError::tool(WEB_SEARCH_TOOL_NAME, "missing 'query' argument"));
        }

        let hits = self.provider.search(&query, self.max_results).await.map_err(|e| {
            warn!("Search for '{query}' failed: {e}");
            AppError::tool(WEB_SEARCH_TOOL_NAME, e.to_string())
        })?;
        debug!("Search for '{query}' returned {} results", hits.len());

        let content = serde_json::to_string(&hits)
            .map_err(|e| AppError::tool(WEB_SEARCH_TOOL_NAME, e.to_string()))?;
        let urls = hits.into_iter().map(|hit| hit.url).collect();
        Ok(ToolOutput { content, urls })
    }
}
