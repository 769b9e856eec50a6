use std::str::FromStr;

use crate::errors::AppError;

const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    Groq,
    Ollama,
}

impl FromStr for ModelProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "groq" => Ok(ModelProvider::Groq),
            "ollama" => Ok(ModelProvider::Ollama),
            other => Err(AppError::Configuration(format!(
                "MODEL_PROVIDER must be 'groq' or 'ollama', got '{other}'"
            ))),
        }
    }
}

/// Process configuration, read once at start-up.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub provider: ModelProvider,
    pub model_name: String,
    pub groq_api_key: Option<String>,
    pub ollama_base_url: String,
    pub tavily_api_key: Option<String>,
    pub search_max_results: usize,
    pub max_tool_rounds: usize,
    pub frontend_origin: String,
    /// Requests allowed per client per window; `0` disables the limiter.
    pub rate_limit_per_window: u32,
    pub rate_limit_window_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests don't
    /// have to touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let groq_api_key = get("GROQ_API_KEY");
        let provider = match get("MODEL_PROVIDER") {
            Some(p) => p.parse()?,
            None if groq_api_key.is_some() => ModelProvider::Groq,
            None => ModelProvider::Ollama,
        };
        let model_name = get("MODEL_NAME").unwrap_or_else(|| {
            match provider {
                ModelProvider::Groq => DEFAULT_GROQ_MODEL,
                ModelProvider::Ollama => DEFAULT_OLLAMA_MODEL,
            }
            .to_string()
        });

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(get("PORT"), "PORT", 8000)?,
            database_url: get("DATABASE_URL"),
            provider,
            model_name,
            groq_api_key,
            ollama_base_url: get("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            tavily_api_key: get("TAVILY_API_KEY"),
            search_max_results: parse_or(get("SEARCH_MAX_RESULTS"), "SEARCH_MAX_RESULTS", 4)?,
            max_tool_rounds: parse_or(get("MAX_TOOL_ROUNDS"), "MAX_TOOL_ROUNDS", 5)?,
            frontend_origin: get("FRONTEND_ORIGIN")
                .unwrap_or_else(|| "http://localhost:8501".to_string()),
            rate_limit_per_window: parse_or(get("RATE_LIMIT_PER_WINDOW"), "RATE_LIMIT_PER_WINDOW", 0)?,
            rate_limit_window_secs: parse_or(
                get("RATE_LIMIT_WINDOW_SECS"),
                "RATE_LIMIT_WINDOW_SECS",
                60,
            )?,
        })
    }

    /// Fails when a credential the selected services need is absent.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.tavily_api_key.is_none() {
            return Err(AppError::Configuration(
                "TAVILY_API_KEY not found in environment variables".to_string(),
            ));
        }
        if self.provider == ModelProvider::Groq && self.groq_api_key.is_none() {
            return Err(AppError::Configuration(
                "GROQ_API_KEY not found in environment variables".to_string(),
            ));
        }
        if self.max_tool_rounds == 0 {
            return Err(AppError::Configuration(
                "MAX_TOOL_ROUNDS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn search_key_configured(&self) -> bool {
        self.tavily_api_key.is_some()
    }

    /// Ollama runs locally without a key, so it always counts as configured.
    pub fn model_key_configured(&self) -> bool {
        match self.provider {
            ModelProvider::Groq => self.groq_api_key.is_some(),
            ModelProvider::Ollama => true,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, AppError> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| AppError::Configuration(format!("{key} has an invalid value '{v}'"))),
        None => Ok(default),
    }
}
