//! Semantic Parsing strategy: deterministic composition of the column
//! resolver, condition parser and aggregation planner. No external calls.

use super::{RequestContext, TranslationResult, TranslationStrategy};
use crate::error::{NlqError, Result};
use crate::parsing::{AggregationPlanner, ColumnResolver, ConditionParser};
use crate::query::{QueryIntent, StructuredQuery};
use crate::router::match_rules;
use crate::schema::SchemaContext;
use crate::text::QueryText;
use crate::vocabulary::Vocabulary;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub const SEMANTIC_STRATEGY: &str = "semantic_parsing";

/// A validated query and the confidence the parse earned.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticParse {
    pub query: StructuredQuery,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct SemanticParsingStrategy {
    resolver: ColumnResolver,
    conditions: ConditionParser,
    planner: AggregationPlanner,
}

impl SemanticParsingStrategy {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        let resolver = ColumnResolver::new(vocabulary);
        Self {
            conditions: ConditionParser::with_resolver(resolver.clone()),
            planner: AggregationPlanner::with_resolver(resolver.clone()),
            resolver,
        }
    }

    pub fn build(&self, query: &str, schema: &SchemaContext) -> Result<SemanticParse> {
        let text = QueryText::new(query);
        if text.is_empty() {
            return Err(NlqError::RoutingAmbiguous("the question is empty".to_string()));
        }

        let resolution = self.resolver.resolve_text(&text, schema);
        let parsed = self.conditions.parse_resolved(&text, &resolution, schema);
        let plan = self
            .planner
            .plan_resolved(&text, &resolution, &parsed.conditions);

        let intent = match plan.ranking {
            Some(crate::query::SortDirection::Desc) => QueryIntent::TopN,
            Some(crate::query::SortDirection::Asc) => QueryIntent::BottomN,
            None if !plan.aggregations.is_empty() => QueryIntent::Aggregate,
            None if plan.explicit_sort => QueryIntent::Sort,
            None if !parsed.conditions.is_empty() => QueryIntent::Filter,
            None => QueryIntent::Select,
        };

        let nothing_bound = resolution.matches.is_empty() && resolution.values.is_empty();
        if nothing_bound && plan.aggregations.is_empty() && parsed.conditions.is_empty() {
            if let Some(unresolved) = resolution.unresolved.first() {
                return Err(unresolved.to_error());
            }
        }

        let mut structured = StructuredQuery::new(intent);
        if intent == QueryIntent::Select {
            structured.columns = resolution.columns();
        }
        structured.conditions = parsed.conditions;
        structured.aggregations = plan.aggregations;
        structured.group_by = plan.group_by;
        structured.order_by = plan.order_by;
        structured.limit = plan.limit;
        structured.validate_against(schema)?;

        let operator_score = if parsed.explicit_operator {
            1.0
        } else {
            0.5
        };
        let keyword_score = if match_rules(query, schema).is_some() {
            1.0
        } else {
            0.0
        };
        let confidence =
            0.4 * resolution.resolved_fraction() + 0.3 * operator_score + 0.3 * keyword_score;
        debug!(
            "Semantic parse: intent={}, resolved={:.2}, confidence={:.2}",
            intent,
            resolution.resolved_fraction(),
            confidence
        );

        Ok(SemanticParse {
            query: structured,
            confidence,
        })
    }
}

#[async_trait]
impl TranslationStrategy for SemanticParsingStrategy {
    fn name(&self) -> &str {
        SEMANTIC_STRATEGY
    }

    async fn translate(
        &self,
        query: &str,
        schema: &SchemaContext,
        _ctx: &RequestContext,
    ) -> TranslationResult {
        match self.build(query, schema) {
            Ok(parse) => {
                TranslationResult::from_query(SEMANTIC_STRATEGY, parse.query, schema, parse.confidence)
            }
            Err(e) => TranslationResult::failure(SEMANTIC_STRATEGY, &e),
        }
    }
}
