//! Engine configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional JSON file, the environment (`.env` is loaded first) and finally
//! CLI flags applied by the binary.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DUMMY_API_KEY: &str = "dummy-api-key";
pub const MIN_LLM_TIMEOUT_SECS: u64 = 30;
pub const MAX_LLM_TIMEOUT_SECS: u64 = 90;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Clamped to [30, 90] seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_secs
                .clamp(MIN_LLM_TIMEOUT_SECS, MAX_LLM_TIMEOUT_SECS),
        )
    }

    /// A usable key is present and is not the placeholder.
    pub fn has_credentials(&self) -> bool {
        match self.api_key.as_deref() {
            Some(key) => !key.trim().is_empty() && key != DUMMY_API_KEY,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Rule matches below this confidence go to the LLM classifier
    pub confidence_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.55,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Rows of the dataset visible to a query
    pub max_scan_rows: usize,
    pub timeout_ms: u64,
    /// Rows returned to the caller
    pub max_result_rows: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_scan_rows: 100_000,
            timeout_ms: 5_000,
            max_result_rows: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparatorConfig {
    /// Execution time at which the performance score reaches zero
    pub performance_budget_ms: u64,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            performance_budget_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    #[default]
    None,
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub router: RouterConfig,
    pub executor: ExecutorConfig,
    pub comparator: ComparatorConfig,
    pub cache: CacheConfig,
    /// JSON file with synonym groups and qualifiers
    pub vocabulary: Option<PathBuf>,
}

impl EngineConfig {
    /// Load from an optional JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            NlqError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| NlqError::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Override LLM settings from `OPENAI_API_KEY`, `OPENAI_BASE_URL`,
    /// `OPENAI_MODEL` and `NLQ_LLM_TIMEOUT_SECS`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Some(secs) = lookup("NLQ_LLM_TIMEOUT_SECS").and_then(|s| s.trim().parse().ok()) {
            self.llm.timeout_secs = secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.router.confidence_threshold, 0.55);
        assert_eq!(config.executor.max_scan_rows, 100_000);
        assert_eq!(config.executor.timeout_ms, 5_000);
        assert_eq!(config.cache, CacheConfig::None);
        assert!(!config.llm.has_credentials());
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut llm = LlmConfig::default();
        llm.timeout_secs = 5;
        assert_eq!(llm.timeout(), Duration::from_secs(30));
        llm.timeout_secs = 600;
        assert_eq!(llm.timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
            ("NLQ_LLM_TIMEOUT_SECS", "45"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert!(config.llm.has_credentials());
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_partial_json_file() {
        let path = std::env::temp_dir().join(format!("nlq_config_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"executor": {"timeout_ms": 250}, "cache": {"kind": "sqlite", "path": "/tmp/c.db"}}"#,
        )
        .unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.executor.timeout_ms, 250);
        assert_eq!(config.executor.max_scan_rows, 100_000);
        assert_eq!(
            config.cache,
            CacheConfig::Sqlite {
                path: PathBuf::from("/tmp/c.db")
            }
        );
        std::fs::remove_file(&path).ok();
    }
}
