//! LLM-Enhanced strategy: asks the completion service for a JSON query,
//! validates it against the schema and retries once with the validation
//! error. Anything else falls back to the semantic parse.

use super::semantic::SemanticParsingStrategy;
use super::{RequestContext, TranslationResult, TranslationStrategy};
use crate::error::{NlqError, Result};
use crate::llm::{extract_json_object, CompletionService};
use crate::parsing::clamp_limit;
use crate::query::{
    aggregation_alias, AggregateFunc, Aggregation, Condition, ConditionValue, Connector,
    Operator, OrderBy, QueryIntent, SortDirection, StructuredQuery,
};
use crate::schema::SchemaContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const LLM_STRATEGY: &str = "llm_enhanced";

const LLM_CONFIDENCE: f64 = 0.85;
const RETRY_CONFIDENCE: f64 = 0.75;
const FALLBACK_CONFIDENCE_CAP: f64 = 0.5;

pub struct LlmEnhancedStrategy {
    llm: Arc<dyn CompletionService>,
    fallback: Arc<SemanticParsingStrategy>,
    timeout: Duration,
}

/// Lenient shape of the JSON the model returns.
#[derive(Debug, Deserialize)]
struct LlmQuery {
    intent: String,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    conditions: Vec<LlmCondition>,
    #[serde(default)]
    aggregations: Vec<LlmAggregation>,
    #[serde(default)]
    group_by: Vec<String>,
    #[serde(default)]
    order_by: Vec<LlmOrder>,
    #[serde(default)]
    limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LlmCondition {
    column: String,
    operator: String,
    value: serde_json::Value,
    #[serde(default)]
    connector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmAggregation {
    #[serde(alias = "function")]
    func: String,
    #[serde(default)]
    column: Option<String>,
    #[serde(default)]
    alias: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmOrder {
    column: String,
    #[serde(default)]
    direction: Option<String>,
}

impl LlmEnhancedStrategy {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        fallback: Arc<SemanticParsingStrategy>,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            fallback,
            timeout,
        }
    }

    async fn ask(&self, prompt: &str, deadline: Option<Instant>) -> Result<String> {
        let budget = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.timeout),
            None => self.timeout,
        };
        if budget.is_zero() {
            return Err(NlqError::LlmUnavailable("deadline already passed".to_string()));
        }
        tokio::time::timeout(budget, self.llm.complete(prompt))
            .await
            .map_err(|_| NlqError::LlmUnavailable("completion timed out".to_string()))?
    }

    async fn fall_back(
        &self,
        query: &str,
        schema: &SchemaContext,
        ctx: &RequestContext,
        reason: &NlqError,
    ) -> TranslationResult {
        warn!("LLM translation unusable ({}), using semantic parse", reason);
        let mut result = self.fallback.translate(query, schema, ctx).await;
        result.strategy_name = LLM_STRATEGY.to_string();
        result.confidence = result.confidence.min(FALLBACK_CONFIDENCE_CAP);
        result
    }
}

#[async_trait]
impl TranslationStrategy for LlmEnhancedStrategy {
    fn name(&self) -> &str {
        LLM_STRATEGY
    }

    async fn translate(
        &self,
        query: &str,
        schema: &SchemaContext,
        ctx: &RequestContext,
    ) -> TranslationResult {
        let prompt = build_prompt(query, schema);

        let first = match self.ask(&prompt, ctx.deadline).await {
            Ok(text) => text,
            Err(e) => return self.fall_back(query, schema, ctx, &e).await,
        };
        let problem = match parse_response(&first, schema) {
            Ok(structured) => {
                info!("🤖 LLM translation accepted on first attempt");
                return TranslationResult::from_query(LLM_STRATEGY, structured, schema, LLM_CONFIDENCE);
            }
            Err(e) => e,
        };

        // One corrective retry, never more.
        let retry_prompt = build_retry_prompt(&prompt, &first, &problem);
        let second = match self.ask(&retry_prompt, ctx.deadline).await {
            Ok(text) => text,
            Err(e) => return self.fall_back(query, schema, ctx, &e).await,
        };
        match parse_response(&second, schema) {
            Ok(structured) => {
                info!("🤖 LLM translation accepted after corrective retry");
                TranslationResult::from_query(LLM_STRATEGY, structured, schema, RETRY_CONFIDENCE)
            }
            Err(e) => self.fall_back(query, schema, ctx, &e).await,
        }
    }
}

fn build_prompt(query: &str, schema: &SchemaContext) -> String {
    format!(
        r#"You translate questions about a single table into a structured query.

Table: {}
Columns:
{}

Question: "{}"

Return JSON in this exact format:
{{
  "intent": "select | filter | aggregate | sort | top_n | bottom_n",
  "columns": ["column"],
  "conditions": [{{"column": "actual_sales", "operator": ">", "value": 100, "connector": "AND"}}],
  "aggregations": [{{"func": "SUM", "column": "actual_sales"}}],
  "group_by": ["region"],
  "order_by": [{{"column": "actual_sales", "direction": "DESC"}}],
  "limit": 5
}}

Rules:
- Use only the columns listed above.
- Operators: =, !=, >, <, >=, <=, LIKE, BETWEEN, IN.
- Functions: SUM, AVG, COUNT, MIN, MAX. Use "column": null for COUNT(*).
- To compare two columns use "value": {{"column": "budget_sales"}}.
- BETWEEN takes a two-element array, IN takes an array.

Only return the JSON, no other text."#,
        schema.alias,
        schema.describe(),
        query
    )
}

fn build_retry_prompt(prompt: &str, previous: &str, problem: &NlqError) -> String {
    format!(
        "{}\n\nYour previous answer was rejected: {}\nPrevious answer:\n{}\n\nReturn a corrected JSON object only.",
        prompt, problem, previous
    )
}

/// Parse and validate a model response into a query over `schema`.
fn parse_response(response: &str, schema: &SchemaContext) -> Result<StructuredQuery> {
    let json = extract_json_object(response)
        .ok_or_else(|| NlqError::LlmUnavailable("response contained no JSON object".to_string()))?;
    let raw: LlmQuery = serde_json::from_str(json)?;

    let intent: QueryIntent = raw.intent.parse()?;
    let mut query = StructuredQuery::new(intent);
    query.columns = raw.columns;
    query.group_by = raw.group_by;
    query.limit = raw.limit.map(clamp_limit);

    for cond in raw.conditions {
        let operator: Operator = cond.operator.parse()?;
        let value = convert_value(&cond.value, operator, schema)?;
        let connector = match cond.connector.as_deref().map(str::to_uppercase).as_deref() {
            Some("OR") => Connector::Or,
            _ => Connector::And,
        };
        query
            .conditions
            .push(Condition::new(cond.column, operator, value).with_connector(connector));
    }
    if let Some(first) = query.conditions.first_mut() {
        first.connector = Connector::And;
    }

    let mut llm_aliases: Vec<(String, String)> = Vec::new();
    for agg in raw.aggregations {
        let func: AggregateFunc = agg.func.parse()?;
        let column = agg.column.filter(|c| c != "*" && !c.trim().is_empty());
        if column.is_none() && func != AggregateFunc::Count {
            return Err(NlqError::SchemaMismatch(format!("{} needs a column", func)));
        }
        let aggregation = Aggregation::new(func, column);
        if let Some(alias) = agg.alias {
            llm_aliases.push((alias, aggregation.alias.clone()));
        }
        llm_aliases.push((aggregation.expression().to_lowercase(), aggregation.alias.clone()));
        query.aggregations.push(aggregation);
    }

    for order in raw.order_by {
        let direction = match order.direction {
            Some(d) => d.parse::<SortDirection>()?,
            None => SortDirection::Asc,
        };
        let column = llm_aliases
            .iter()
            .find(|(from, _)| from.eq_ignore_ascii_case(&order.column))
            .map(|(_, to)| to.clone())
            .unwrap_or(order.column);
        query.order_by.push(OrderBy::new(column, direction));
    }

    if query.aggregations.is_empty() && !query.group_by.is_empty() {
        return Err(NlqError::SchemaMismatch(
            "group_by without an aggregation".to_string(),
        ));
    }
    if !query.aggregations.is_empty() {
        // Ungrouped raw columns cannot sit next to aggregates.
        query.columns.clear();
        for order in &query.order_by {
            let is_alias = query.is_aggregation_alias(&order.column);
            let is_group = query.group_by.iter().any(|g| g.eq_ignore_ascii_case(&order.column));
            if !is_alias && !is_group {
                // Ordering by an aggregated column means ordering by its aggregate.
                let target = aggregation_alias(AggregateFunc::Sum, Some(&order.column));
                if !query.is_aggregation_alias(&target) {
                    return Err(NlqError::SchemaMismatch(format!(
                        "cannot order grouped rows by '{}'",
                        order.column
                    )));
                }
            }
        }
        let remap: Vec<(String, String)> = query
            .order_by
            .iter()
            .filter(|o| {
                !query.is_aggregation_alias(&o.column)
                    && !query.group_by.iter().any(|g| g.eq_ignore_ascii_case(&o.column))
            })
            .map(|o| {
                (
                    o.column.clone(),
                    aggregation_alias(AggregateFunc::Sum, Some(&o.column)),
                )
            })
            .collect();
        for order in &mut query.order_by {
            if let Some((_, alias)) = remap.iter().find(|(from, _)| from == &order.column) {
                order.column = alias.clone();
            }
        }
    }

    query.validate_against(schema)?;
    Ok(query)
}

fn convert_value(
    value: &serde_json::Value,
    operator: Operator,
    schema: &SchemaContext,
) -> Result<ConditionValue> {
    use serde_json::Value;

    let scalar = |v: &Value| -> Result<ConditionValue> {
        match v {
            Value::Number(n) => n
                .as_f64()
                .map(ConditionValue::Number)
                .ok_or_else(|| NlqError::UnsupportedOperator(format!("number {}", n))),
            Value::String(s) => Ok(ConditionValue::Text(s.clone())),
            Value::Bool(b) => Ok(ConditionValue::Text(b.to_string())),
            Value::Object(map) => match map.get("column").and_then(|c| c.as_str()) {
                Some(column) if schema.has_column(column) => {
                    Ok(ConditionValue::Column(column.to_string()))
                }
                Some(column) => Err(NlqError::SchemaMismatch(format!(
                    "Column '{}' does not exist in {}",
                    column, schema.alias
                ))),
                None => Err(NlqError::UnsupportedOperator("object value".to_string())),
            },
            Value::Null | Value::Array(_) => {
                Err(NlqError::UnsupportedOperator("null or nested value".to_string()))
            }
        }
    };

    match (operator, value) {
        (Operator::Between, Value::Array(items)) if items.len() == 2 => Ok(ConditionValue::Range(
            Box::new(scalar(&items[0])?),
            Box::new(scalar(&items[1])?),
        )),
        (Operator::Between, _) => Err(NlqError::UnsupportedOperator(
            "BETWEEN needs exactly two values".to_string(),
        )),
        (Operator::In, Value::Array(items)) if !items.is_empty() => Ok(ConditionValue::List(
            items.iter().map(scalar).collect::<Result<Vec<_>>>()?,
        )),
        (Operator::In, other) => Ok(ConditionValue::List(vec![scalar(other)?])),
        (_, other) => scalar(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ColumnType};
    use crate::vocabulary::Vocabulary;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a script, then fails once the script runs out.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(NlqError::LlmUnavailable("script exhausted".to_string())))
        }
    }

    fn schema() -> SchemaContext {
        SchemaContext::new(
            "financial_data",
            vec![
                ColumnDescriptor::new("product", ColumnType::Categorical),
                ColumnDescriptor::new("customer_satisfaction", ColumnType::Numeric),
                ColumnDescriptor::new("region", ColumnType::Categorical),
            ],
        )
    }

    fn strategy(llm: Arc<Scripted>) -> LlmEnhancedStrategy {
        LlmEnhancedStrategy::new(
            llm,
            Arc::new(SemanticParsingStrategy::new(Arc::new(Vocabulary::default()))),
            Duration::from_secs(30),
        )
    }

    const GOOD: &str = r#"```json
{"intent": "top_n", "columns": ["product", "customer_satisfaction"],
 "order_by": [{"column": "customer_satisfaction", "direction": "DESC"}], "limit": 1}
```"#;

    #[tokio::test]
    async fn test_valid_json_first_try() {
        let llm = Arc::new(Scripted::new(vec![Ok(GOOD.to_string())]));
        let result = strategy(llm.clone())
            .translate(
                "Find products with highest customer satisfaction",
                &schema(),
                &RequestContext::default(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.strategy_name, LLM_STRATEGY);
        assert_eq!(
            result.raw_sql,
            "SELECT product, customer_satisfaction FROM financial_data \
             ORDER BY customer_satisfaction DESC LIMIT 1"
        );
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_one_corrective_retry() {
        let bad = r#"{"intent": "filter", "conditions": [{"column": "nps", "operator": ">", "value": 3}]}"#;
        let llm = Arc::new(Scripted::new(vec![Ok(bad.to_string()), Ok(GOOD.to_string())]));
        let result = strategy(llm.clone())
            .translate("best products", &schema(), &RequestContext::default())
            .await;
        assert!(result.success);
        assert_eq!(result.confidence, RETRY_CONFIDENCE);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_repeated_failure_falls_back_capped() {
        let llm = Arc::new(Scripted::new(vec![
            Ok("not json".to_string()),
            Ok("{\"intent\": \"explode\"}".to_string()),
            Ok(GOOD.to_string()),
        ]));
        let result = strategy(llm.clone())
            .translate(
                "Find products with highest customer satisfaction",
                &schema(),
                &RequestContext::default(),
            )
            .await;
        assert_eq!(llm.calls(), 2);
        assert_eq!(result.strategy_name, LLM_STRATEGY);
        assert!(result.success);
        assert!(result.confidence <= FALLBACK_CONFIDENCE_CAP);
        assert!(result.raw_sql.contains("MAX(customer_satisfaction)"));
    }

    #[tokio::test]
    async fn test_transport_error_falls_back_without_retry() {
        let llm = Arc::new(Scripted::new(vec![Err(NlqError::LlmUnavailable(
            "connection refused".to_string(),
        ))]));
        let result = strategy(llm.clone())
            .translate("region is West", &schema(), &RequestContext::default())
            .await;
        assert_eq!(llm.calls(), 1);
        assert!(result.confidence <= FALLBACK_CONFIDENCE_CAP);
    }

    #[test]
    fn test_parse_response_aggregate_and_comparison() {
        let json = r#"{"intent": "aggregate",
            "aggregations": [{"function": "count", "column": "*", "alias": "n"}],
            "group_by": ["region"],
            "order_by": [{"column": "n", "direction": "desc"}]}"#;
        let q = parse_response(json, &schema()).unwrap();
        assert_eq!(q.aggregations[0].alias, "count_all");
        assert_eq!(q.order_by[0].column, "count_all");

        let json = r#"{"intent": "filter", "conditions": [
            {"column": "customer_satisfaction", "operator": "BETWEEN", "value": [3, 5]},
            {"column": "region", "operator": "IN", "value": ["West", "East"], "connector": "or"}]}"#;
        let q = parse_response(json, &schema()).unwrap();
        assert_eq!(q.conditions[1].connector, Connector::Or);
        assert!(matches!(q.conditions[0].value, ConditionValue::Range(_, _)));

        let json = r#"{"intent": "filter", "conditions": [{"column": "region", "operator": "REGEXP", "value": "W"}]}"#;
        assert!(matches!(
            parse_response(json, &schema()),
            Err(NlqError::UnsupportedOperator(_))
        ));
    }
}
