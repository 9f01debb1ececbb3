use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Could not work out what the question is asking: {0}")]
    RoutingAmbiguous(String),

    #[error("Could not match '{phrase}' to a column{}", suggestion_suffix(.suggestions))]
    ColumnUnresolved {
        phrase: String,
        suggestions: Vec<String>,
    },

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Unsafe query rejected: {0}")]
    UnsafeQuery(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Query exceeded the {0} ms time limit")]
    ExecutionTimeout(u64),

    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

pub type Result<T> = std::result::Result<T, NlqError>;

fn suggestion_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean: {}?", suggestions.join(", "))
    }
}

impl From<polars::error::PolarsError> for NlqError {
    fn from(e: polars::error::PolarsError) -> Self {
        NlqError::Polars(e.to_string())
    }
}

impl From<rusqlite::Error> for NlqError {
    fn from(e: rusqlite::Error) -> Self {
        NlqError::Cache(e.to_string())
    }
}

/// Error category carried inside per-request results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RoutingAmbiguous,
    ColumnUnresolved,
    UnsupportedOperator,
    UnsafeQuery,
    SchemaMismatch,
    ExecutionTimeout,
    LlmUnavailable,
    Execution,
    Dataset,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::RoutingAmbiguous => "RoutingAmbiguous",
            FailureKind::ColumnUnresolved => "ColumnUnresolved",
            FailureKind::UnsupportedOperator => "UnsupportedOperator",
            FailureKind::UnsafeQuery => "UnsafeQuery",
            FailureKind::SchemaMismatch => "SchemaMismatch",
            FailureKind::ExecutionTimeout => "ExecutionTimeout",
            FailureKind::LlmUnavailable => "LLMUnavailable",
            FailureKind::Execution => "Execution",
            FailureKind::Dataset => "Dataset",
            FailureKind::Internal => "Internal",
        };
        f.write_str(label)
    }
}

/// Serialisable projection of an [`NlqError`], stored in translation and
/// execution results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl NlqError {
    pub fn kind(&self) -> FailureKind {
        match self {
            NlqError::RoutingAmbiguous(_) => FailureKind::RoutingAmbiguous,
            NlqError::ColumnUnresolved { .. } => FailureKind::ColumnUnresolved,
            NlqError::UnsupportedOperator(_) => FailureKind::UnsupportedOperator,
            NlqError::UnsafeQuery(_) => FailureKind::UnsafeQuery,
            NlqError::SchemaMismatch(_) => FailureKind::SchemaMismatch,
            NlqError::ExecutionTimeout(_) => FailureKind::ExecutionTimeout,
            NlqError::LlmUnavailable(_) => FailureKind::LlmUnavailable,
            NlqError::Execution(_) | NlqError::Polars(_) => FailureKind::Execution,
            NlqError::Dataset(_) => FailureKind::Dataset,
            NlqError::Config(_) | NlqError::Cache(_) | NlqError::Io(_) | NlqError::Json(_) => {
                FailureKind::Internal
            }
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}

impl From<&NlqError> for Failure {
    fn from(e: &NlqError) -> Self {
        e.to_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_message_lists_suggestions() {
        let err = NlqError::ColumnUnresolved {
            phrase: "revnue".to_string(),
            suggestions: vec!["revenue".to_string(), "region".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Could not match 'revnue' to a column. Did you mean: revenue, region?"
        );
        assert_eq!(err.kind(), FailureKind::ColumnUnresolved);
    }

    #[test]
    fn test_failure_kind_labels() {
        let failure = NlqError::LlmUnavailable("timeout".to_string()).to_failure();
        assert_eq!(failure.kind.to_string(), "LLMUnavailable");
        assert!(failure.message.contains("timeout"));
    }
}
