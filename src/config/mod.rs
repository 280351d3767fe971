//! Application configuration

pub mod prompts;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use prompts::{builtin as prompts_builtin, RoutePrompts};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,

    /// "auto", "mock", "openai" or "dify"
    pub provider: String,
    pub streaming: bool,
    /// Prior turns sent along with each message
    pub history_limit: usize,
    /// TOML file replacing the built-in route prompt table
    pub prompts_file: Option<PathBuf>,
    pub request_timeout_secs: u64,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_organization: Option<String>,

    pub dify_api_key: Option<String>,
    pub dify_base_url: String,
    pub dify_suggestions: bool,

    pub mock_delay_min_ms: u64,
    pub mock_delay_max_ms: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: or("HOST", "127.0.0.1"),
            port: parse_or(get("PORT"), "PORT", 3000)?,
            data_dir: PathBuf::from(or("DEVCONSOLE_DATA_DIR", "./data")),
            provider: or("CHATBOT_PROVIDER", "auto"),
            streaming: parse_bool_or(get("CHATBOT_STREAMING"), "CHATBOT_STREAMING", true)?,
            history_limit: parse_or(get("CHATBOT_HISTORY_LIMIT"), "CHATBOT_HISTORY_LIMIT", 10)?,
            prompts_file: get("CHATBOT_PROMPTS_FILE").map(PathBuf::from),
            request_timeout_secs: parse_or(get("REQUEST_TIMEOUT_SECS"), "REQUEST_TIMEOUT_SECS", 120)?,
            openai_api_key: get("OPENAI_API_KEY"),
            openai_base_url: or("OPENAI_BASE_URL", "https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            openai_model: or("OPENAI_MODEL", "gpt-4o-mini"),
            openai_organization: get("OPENAI_ORGANIZATION"),
            dify_api_key: get("DIFY_API_KEY"),
            dify_base_url: or("DIFY_BASE_URL", "https://api.dify.ai/v1")
                .trim_end_matches('/')
                .to_string(),
            dify_suggestions: parse_bool_or(get("DIFY_SUGGESTIONS"), "DIFY_SUGGESTIONS", true)?,
            mock_delay_min_ms: parse_or(get("MOCK_DELAY_MIN_MS"), "MOCK_DELAY_MIN_MS", 500)?,
            mock_delay_max_ms: parse_or(get("MOCK_DELAY_MAX_MS"), "MOCK_DELAY_MAX_MS", 1500)?,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("devconsole.db")
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, v)),
        None => Ok(default),
    }
}

fn parse_bool_or(value: Option<String>, key: &str, default: bool) -> anyhow::Result<bool> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("Invalid value for {}: {:?}", key, v),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.provider, "auto");
        assert!(config.streaming);
        assert_eq!(config.history_limit, 10);
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.database_path(), PathBuf::from("./data/devconsole.db"));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("PORT", "8080"),
            ("CHATBOT_STREAMING", "off"),
            ("DIFY_BASE_URL", "http://dify.local/v1/"),
            ("OPENAI_API_KEY", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert!(!config.streaming);
        assert_eq!(config.dify_base_url, "http://dify.local/v1");
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(from_pairs(&[("PORT", "eighty")]).is_err());
        assert!(from_pairs(&[("CHATBOT_STREAMING", "maybe")]).is_err());
    }
}
