//! Translation strategies: free text in, [`TranslationResult`] out.
//!
//! Every strategy implements [`TranslationStrategy`] and is held in an
//! ordered [`StrategyRegistry`]. The registry order is the fallback priority
//! and the final tie-breaker when strategies are compared.

pub mod llm_enhanced;
pub mod semantic;

pub use llm_enhanced::{LlmEnhancedStrategy, LLM_STRATEGY};
pub use semantic::{SemanticParse, SemanticParsingStrategy, SEMANTIC_STRATEGY};

use crate::error::{Failure, NlqError};
use crate::query::{sql, StructuredQuery};
use crate::router::RouteDecision;
use crate::schema::SchemaContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub structured_query: Option<StructuredQuery>,
    /// Exactly one SELECT statement, or empty on failure
    pub raw_sql: String,
    pub confidence: f64,
    pub explanation: String,
    pub success: bool,
    pub error: Option<Failure>,
    pub strategy_name: String,
}

impl TranslationResult {
    /// Compile and explain a validated query.
    pub fn from_query(
        strategy_name: &str,
        query: StructuredQuery,
        schema: &SchemaContext,
        confidence: f64,
    ) -> Self {
        let raw_sql = sql::compile(&query, &schema.alias);
        let explanation = query.explain();
        Self {
            structured_query: Some(query),
            raw_sql,
            confidence: confidence.clamp(0.0, 1.0),
            explanation,
            success: true,
            error: None,
            strategy_name: strategy_name.to_string(),
        }
    }

    pub fn failure(strategy_name: &str, error: &NlqError) -> Self {
        Self {
            structured_query: None,
            raw_sql: String::new(),
            confidence: 0.0,
            explanation: error.to_string(),
            success: false,
            error: Some(error.to_failure()),
            strategy_name: strategy_name.to_string(),
        }
    }
}

/// Per-request information shared with strategies.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Caller deadline; bounds any LLM call a strategy makes
    pub deadline: Option<Instant>,
    pub route: Option<RouteDecision>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            route: None,
        }
    }
}

impl RequestContext {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[async_trait]
pub trait TranslationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails: problems are reported inside the result.
    async fn translate(
        &self,
        query: &str,
        schema: &SchemaContext,
        ctx: &RequestContext,
    ) -> TranslationResult;
}

/// Strategies in priority order.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn TranslationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn TranslationStrategy>) {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
    }

    pub fn with(mut self, strategy: Arc<dyn TranslationStrategy>) -> Self {
        self.register(strategy);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TranslationStrategy>> {
        self.strategies.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TranslationStrategy>> {
        self.strategies.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.strategies.iter().position(|s| s.name() == name)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
