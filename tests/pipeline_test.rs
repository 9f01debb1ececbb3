mod common;

use common::{as_f64s, engine, engine_with_llm, snapshot, HangingLlm, ScriptedLlm};
use nlq_engine::query::{
    AggregateFunc, Aggregation, Condition, ConditionValue, Operator, OrderBy, SortDirection,
};
use nlq_engine::router::RouteIntent;
use nlq_engine::strategy::LLM_STRATEGY;
use nlq_engine::{FailureKind, PipelineStage};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_sales_greater_than_resolves_single_column() {
    let response = engine()
        .translate_and_run("Show me sales greater than 60000")
        .await;
    assert!(response.is_success(), "{:?}", response.failure);

    let query = response.translation.unwrap().structured_query.unwrap();
    assert_eq!(
        query.conditions,
        vec![Condition::new(
            "budget_sales",
            Operator::Gt,
            ConditionValue::Number(60000.0)
        )]
    );

    let result = response.result.unwrap();
    assert_eq!(result.row_count, 4);
    let budgets = as_f64s(result.column_values("budget_sales").unwrap());
    assert!(budgets.iter().all(|b| *b > 60000.0));
}

#[tokio::test]
async fn test_top_five_regions_by_actual_sales() {
    let response = engine()
        .translate_and_run("Top 5 regions by actual sales")
        .await;
    assert_eq!(response.intent, RouteIntent::TopN);

    let translation = response.translation.unwrap();
    let query = translation.structured_query.unwrap();
    assert_eq!(query.group_by, vec!["region"]);
    assert_eq!(
        query.aggregations,
        vec![Aggregation::new(
            AggregateFunc::Sum,
            Some("actual_sales".to_string())
        )]
    );
    assert_eq!(
        query.order_by,
        vec![OrderBy::new("sum_actual_sales", SortDirection::Desc)]
    );
    assert_eq!(query.limit, Some(5));
    assert_eq!(
        translation.raw_sql,
        "SELECT region, SUM(actual_sales) AS sum_actual_sales FROM financial_data \
         GROUP BY region ORDER BY sum_actual_sales DESC LIMIT 5"
    );

    let result = response.result.unwrap();
    assert!(result.row_count <= 5);
    let totals = as_f64s(result.column_values("sum_actual_sales").unwrap());
    assert!(totals.windows(2).all(|w| w[0] >= w[1]));
    assert_eq!(result.rows[0][0], serde_json::json!("Central"));
}

#[tokio::test]
async fn test_bottom_n_is_ascending() {
    let response = engine()
        .translate_and_run("Bottom 3 regions by actual sales")
        .await;
    let result = response.result.unwrap();
    assert_eq!(result.row_count, 3);
    let totals = as_f64s(result.column_values("sum_actual_sales").unwrap());
    assert_eq!(totals, vec![20000.0, 35000.0, 55000.0]);
}

#[tokio::test]
async fn test_drop_table_is_rejected() {
    let engine = engine();
    let response = engine.translate_and_run("DROP TABLE financial_data").await;
    assert_eq!(response.failure.as_ref().unwrap().kind, FailureKind::UnsafeQuery);
    assert!(response.result.is_none());
    assert_eq!(response.final_stage(), PipelineStage::Failed);
    assert_eq!(engine.store().snapshot().unwrap().row_count(), 7);
}

#[tokio::test]
async fn test_blacklist_variants_never_execute() {
    let engine = engine();
    for question in [
        "drop table financial_data",
        "DrOp TaBlE financial_data",
        "show sales;\nDELETE FROM financial_data",
        "list rows where region = 'x'; ATTACH DATABASE 'evil.db' AS e",
        "PRAGMA table_info(financial_data)",
        "insert\tinto financial_data values (1)",
        "sum of sales /* note */ UPDATE financial_data",
        "alter the table please",
        "create a summary",
    ] {
        let response = engine.translate_and_run(question).await;
        assert_eq!(
            response.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::UnsafeQuery),
            "{}",
            question
        );
        assert!(response.result.is_none(), "{}", question);
    }
    assert_eq!(engine.store().snapshot().unwrap().row_count(), 7);
}

#[tokio::test]
async fn test_average_discount_by_product_line() {
    let response = engine()
        .translate_and_run("Average discount percentage by product line")
        .await;
    assert!(response.is_success(), "{:?}", response.failure);
    let query = response.translation.unwrap().structured_query.unwrap();
    assert_eq!(
        query.aggregations,
        vec![Aggregation::new(
            AggregateFunc::Avg,
            Some("discount_pct".to_string())
        )]
    );
    assert_eq!(query.group_by, vec!["product_line"]);
    assert_eq!(response.result.unwrap().row_count, 3);
}

#[tokio::test]
async fn test_semantic_translation_is_idempotent() {
    let engine = engine();
    let first = engine.translate_and_run("Total actual sales by region").await;
    let second = engine.translate_and_run("Total actual sales by region").await;

    let (a, b) = (first.translation.unwrap(), second.translation.unwrap());
    assert_eq!(a.structured_query, b.structured_query);
    assert_eq!(a.raw_sql, b.raw_sql);

    let (ra, rb) = (first.result.unwrap(), second.result.unwrap());
    assert_eq!(ra.columns, rb.columns);
    assert_eq!(ra.rows, rb.rows);
}

#[tokio::test]
async fn test_reload_does_not_corrupt_in_flight_requests() {
    let engine = Arc::new(engine());
    let old_total = 393_000.0;
    let new_total = 786_000.0;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            if i == 8 {
                engine.store().replace(snapshot(2.0));
            }
            engine.translate_and_run("Total actual sales by region").await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert!(response.is_success(), "{:?}", response.failure);
        let result = response.result.unwrap();
        let total: f64 = as_f64s(result.column_values("sum_actual_sales").unwrap())
            .iter()
            .sum();
        assert!(
            (total - old_total).abs() < 1e-6 || (total - new_total).abs() < 1e-6,
            "mixed snapshot total {}",
            total
        );
    }
}

#[tokio::test]
async fn test_deadline_cancels_llm_and_falls_back() {
    let engine = engine_with_llm(Some(Arc::new(HangingLlm)));
    let started = std::time::Instant::now();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
    let response = engine
        .translate_and_run_with_deadline("Top 5 regions by actual sales", Some(deadline))
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(response.is_success(), "{:?}", response.failure);
    let translation = response.translation.unwrap();
    assert_eq!(translation.strategy_name, LLM_STRATEGY);
    assert!(translation.confidence <= 0.5);
    assert_eq!(response.result.unwrap().row_count, 5);
}

#[tokio::test]
async fn test_llm_routing_and_translation() {
    let llm = ScriptedLlm::new(&[
        r#"{"intent": "filter"}"#,
        r#"{"intent": "filter", "conditions": [{"column": "region", "operator": "=", "value": "West"}]}"#,
    ]);
    let engine = engine_with_llm(Some(llm.clone()));
    let response = engine.translate_and_run("West region revenue please").await;

    assert!(response.is_success(), "{:?}", response.failure);
    assert_eq!(llm.calls(), 2);
    let translation = response.translation.unwrap();
    assert_eq!(translation.strategy_name, LLM_STRATEGY);
    assert_eq!(
        translation.raw_sql,
        "SELECT * FROM financial_data WHERE region = 'West'"
    );
    assert_eq!(response.result.unwrap().row_count, 1);
}

#[tokio::test]
async fn test_trend_questions_go_to_analyzer() {
    let response = engine()
        .translate_and_run("How has actual sales trended over time?")
        .await;
    assert_eq!(response.intent, RouteIntent::Trend);
    assert!(response.translation.is_none());
    assert!(!response.suggestions.is_empty());
}

#[tokio::test]
async fn test_negative_variance_without_variance_column() {
    let engine = engine();
    for question in ["show negative variance", "show rows with negative variance"] {
        let response = engine.translate_and_run(question).await;
        assert!(response.is_success(), "{}: {:?}", question, response.failure);
        let query = response.translation.unwrap().structured_query.unwrap();
        assert_eq!(
            query.conditions,
            vec![Condition::new(
                "actual_sales",
                Operator::Lt,
                ConditionValue::Column("budget_sales".to_string())
            )]
        );
        assert_eq!(response.result.unwrap().row_count, 3);
    }
}

#[tokio::test]
async fn test_single_letter_prefix_filter() {
    let response = engine()
        .translate_and_run("products starting with 'S'")
        .await;
    assert!(response.is_success(), "{:?}", response.failure);
    let query = response.translation.unwrap().structured_query.unwrap();
    assert_eq!(
        query.conditions,
        vec![Condition::new(
            "product",
            Operator::Like,
            ConditionValue::Text("S%".to_string())
        )]
    );
    // Suite and Support
    assert_eq!(response.result.unwrap().row_count, 2);
}

#[tokio::test]
async fn test_lowercase_value_outside_samples() {
    let response = engine()
        .translate_and_run("show rows where region is pacific")
        .await;
    assert!(response.is_success(), "{:?}", response.failure);
    let query = response.translation.unwrap().structured_query.unwrap();
    assert_eq!(
        query.conditions,
        vec![Condition::new(
            "region",
            Operator::Eq,
            ConditionValue::Text("Pacific".to_string())
        )]
    );
    assert_eq!(response.result.unwrap().row_count, 1);
}
