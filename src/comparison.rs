//! Strategy comparison: run every registered strategy on one question,
//! execute what they produce and rank them by a four-part quality score.

use crate::config::ComparatorConfig;
use crate::dataset::DatasetSnapshot;
use crate::error::{Failure, FailureKind};
use crate::execution::{guard, ExecutionResult, SafeQueryExecutor};
use crate::query::{QueryIntent, SortDirection, StructuredQuery};
use crate::strategy::{RequestContext, StrategyRegistry, TranslationResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub const MAX_SUBSCORE: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub syntax: f64,
    pub execution: f64,
    pub logic: f64,
    pub performance: f64,
    pub total: f64,
}

impl QualityScore {
    pub fn new(syntax: f64, execution: f64, logic: f64, performance: f64) -> Self {
        let clamp = |v: f64| v.clamp(0.0, MAX_SUBSCORE);
        let (syntax, execution, logic, performance) =
            (clamp(syntax), clamp(execution), clamp(logic), clamp(performance));
        Self {
            syntax,
            execution,
            logic,
            performance,
            total: syntax + execution + logic + performance,
        }
    }
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {:.1} (syntax {:.1}, execution {:.1}, logic {:.1}, performance {:.1})",
            self.total, self.syntax, self.execution, self.logic, self.performance
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityScorer {
    performance_budget_ms: u64,
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(&ComparatorConfig::default())
    }
}

impl QualityScorer {
    pub fn new(config: &ComparatorConfig) -> Self {
        Self {
            performance_budget_ms: config.performance_budget_ms.max(1),
        }
    }

    pub fn score(&self, translation: &TranslationResult, execution: &ExecutionResult) -> QualityScore {
        let syntax = if translation.success && guard::parses(&translation.raw_sql) {
            MAX_SUBSCORE
        } else {
            0.0
        };
        let executed = translation.success && execution.is_success();
        let execution_score = if executed { MAX_SUBSCORE } else { 0.0 };
        let logic = match (&translation.structured_query, executed) {
            (Some(query), true) => MAX_SUBSCORE * plausibility(query, execution),
            _ => 0.0,
        };
        let performance = if executed {
            let ratio = execution.execution_time_ms as f64 / self.performance_budget_ms as f64;
            MAX_SUBSCORE * (1.0 - ratio).clamp(0.0, 1.0)
        } else {
            0.0
        };
        QualityScore::new(syntax, execution_score, logic, performance)
    }
}

/// How believable the rows are for what the query claims to do, in [0, 1].
pub fn plausibility(query: &StructuredQuery, result: &ExecutionResult) -> f64 {
    let non_empty = result.row_count > 0;
    match query.intent {
        QueryIntent::Select | QueryIntent::Filter => bool_score(non_empty),
        QueryIntent::Aggregate => {
            if query.group_by.is_empty() {
                bool_score(result.row_count == 1)
            } else {
                bool_score(non_empty)
            }
        }
        QueryIntent::Sort => bool_score(non_empty && is_sorted(query, result, None)),
        QueryIntent::TopN | QueryIntent::BottomN => {
            let expected = if query.intent == QueryIntent::TopN {
                SortDirection::Desc
            } else {
                SortDirection::Asc
            };
            let within_limit = query
                .limit
                .map(|limit| result.row_count <= limit as usize)
                .unwrap_or(false);
            let sorted = non_empty && is_sorted(query, result, Some(expected));
            match (within_limit, sorted) {
                (true, true) => 1.0,
                (true, false) | (false, true) => 0.5,
                (false, false) => 0.0,
            }
        }
    }
}

fn bool_score(ok: bool) -> f64 {
    if ok {
        1.0
    } else {
        0.0
    }
}

/// Rows follow the first ORDER BY key (and `expected` direction, if given).
fn is_sorted(query: &StructuredQuery, result: &ExecutionResult, expected: Option<SortDirection>) -> bool {
    let Some(order) = query.order_by.first() else {
        return false;
    };
    if expected.map(|d| d != order.direction).unwrap_or(false) {
        return false;
    }
    let Some(values) = result.column_values(&order.column) else {
        return false;
    };
    values.windows(2).all(|pair| {
        let ord = compare_json(pair[0], pair[1]);
        match order.direction {
            SortDirection::Asc => ord != Ordering::Greater,
            SortDirection::Desc => ord != Ordering::Less,
        }
    })
}

fn compare_json(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonEntry {
    pub strategy_name: String,
    pub translation: TranslationResult,
    pub execution: ExecutionResult,
    pub score: QualityScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub query: String,
    /// Best first
    pub entries: Vec<ComparisonEntry>,
}

impl ComparisonReport {
    pub fn winner(&self) -> Option<&ComparisonEntry> {
        self.entries.first()
    }

    pub fn entry(&self, strategy_name: &str) -> Option<&ComparisonEntry> {
        self.entries.iter().find(|e| e.strategy_name == strategy_name)
    }

    pub fn render(&self) -> String {
        let mut out = format!("Strategy comparison for \"{}\"\n", self.query);
        for (rank, entry) in self.entries.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} - {} - confidence {:.2}\n",
                rank + 1,
                entry.strategy_name,
                entry.score,
                entry.translation.confidence
            ));
            if entry.translation.success {
                out.push_str(&format!("   SQL: {}\n", entry.translation.raw_sql));
            }
            if let Some(error) = entry
                .execution
                .error
                .as_ref()
                .or(entry.translation.error.as_ref())
            {
                out.push_str(&format!("   Error: {}\n", error));
            } else {
                out.push_str(&format!(
                    "   {} rows in {} ms\n",
                    entry.execution.row_count, entry.execution.execution_time_ms
                ));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyComparator {
    scorer: QualityScorer,
    executor: SafeQueryExecutor,
}

impl StrategyComparator {
    pub fn new(scorer: QualityScorer, executor: SafeQueryExecutor) -> Self {
        Self { scorer, executor }
    }

    pub async fn compare(
        &self,
        query: &str,
        dataset: Arc<DatasetSnapshot>,
        strategies: &StrategyRegistry,
        ctx: &RequestContext,
    ) -> ComparisonReport {
        let schema = dataset.schema();
        let mut ranked: Vec<(usize, ComparisonEntry)> = Vec::with_capacity(strategies.len());

        for (position, strategy) in strategies.iter().enumerate() {
            let translation = strategy.translate(query, schema, ctx).await;
            let execution = match (&translation.error, translation.success) {
                (None, true) => self.executor.run_sql(&translation.raw_sql, dataset.clone()).await,
                (Some(failure), _) => ExecutionResult::skipped(failure.clone()),
                (None, false) => ExecutionResult::skipped(Failure::new(
                    FailureKind::Internal,
                    "translation failed without an error",
                )),
            };
            let score = self.scorer.score(&translation, &execution);
            info!("📊 {} scored {:.1}", strategy.name(), score.total);
            ranked.push((
                position,
                ComparisonEntry {
                    strategy_name: strategy.name().to_string(),
                    translation,
                    execution,
                    score,
                },
            ));
        }

        ranked.sort_by(|(pa, a), (pb, b)| {
            b.score
                .total
                .partial_cmp(&a.score.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.translation
                        .confidence
                        .partial_cmp(&a.translation.confidence)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| pa.cmp(pb))
        });

        ComparisonReport {
            query: query.to_string(),
            entries: ranked.into_iter().map(|(_, entry)| entry).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Aggregation, AggregateFunc, OrderBy};

    fn rows(column: &str, values: &[f64]) -> ExecutionResult {
        ExecutionResult {
            columns: vec![column.to_string()],
            rows: values.iter().map(|v| vec![serde_json::json!(v)]).collect(),
            row_count: values.len(),
            execution_time_ms: 0,
            error: None,
            warnings: Vec::new(),
        }
    }

    fn top_query(limit: u32) -> StructuredQuery {
        let mut q = StructuredQuery::new(QueryIntent::TopN);
        q.aggregations = vec![Aggregation::new(AggregateFunc::Sum, Some("actual_sales".to_string()))];
        q.group_by = vec!["region".to_string()];
        q.order_by = vec![OrderBy::new("sum_actual_sales", SortDirection::Desc)];
        q.limit = Some(limit);
        q
    }

    #[test]
    fn test_plausibility_top_n() {
        let q = top_query(3);
        assert_eq!(plausibility(&q, &rows("sum_actual_sales", &[9.0, 5.0, 1.0])), 1.0);
        assert_eq!(plausibility(&q, &rows("sum_actual_sales", &[1.0, 5.0, 9.0])), 0.5);
        assert_eq!(plausibility(&q, &rows("sum_actual_sales", &[9.0, 5.0, 4.0, 1.0])), 0.5);
    }

    #[test]
    fn test_plausibility_aggregate() {
        let mut q = StructuredQuery::new(QueryIntent::Aggregate);
        q.aggregations = vec![Aggregation::new(AggregateFunc::Avg, Some("x".to_string()))];
        assert_eq!(plausibility(&q, &rows("avg_x", &[2.0])), 1.0);
        assert_eq!(plausibility(&q, &rows("avg_x", &[2.0, 3.0])), 0.0);
    }

    #[test]
    fn test_scores() {
        let scorer = QualityScorer::new(&ComparatorConfig {
            performance_budget_ms: 100,
        });
        let q = top_query(3);
        let translation = TranslationResult::from_query(
            "semantic_parsing",
            q,
            &crate::schema::SchemaContext::new("t", Vec::new()),
            0.9,
        );
        let mut execution = rows("sum_actual_sales", &[3.0, 2.0]);
        execution.execution_time_ms = 50;
        let score = scorer.score(&translation, &execution);
        assert_eq!(score.syntax, 25.0);
        assert_eq!(score.execution, 25.0);
        assert_eq!(score.logic, 25.0);
        assert!((score.performance - 12.5).abs() < 1e-9);
        assert!((score.total - 87.5).abs() < 1e-9);

        let failed = TranslationResult::failure(
            "llm_enhanced",
            &crate::error::NlqError::LlmUnavailable("down".to_string()),
        );
        let skipped = ExecutionResult::skipped(failed.error.clone().unwrap());
        assert_eq!(scorer.score(&failed, &skipped).total, 0.0);
    }
}
