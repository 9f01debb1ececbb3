//! Compile a [`StructuredQuery`] into the SELECT subset the executor accepts.

use super::{Aggregation, Condition, ConditionValue, Connector, Operator, StructuredQuery};
use itertools::Itertools;
use sqlparser::keywords::ALL_KEYWORDS;

/// Render `query` as a single SELECT over `table`.
pub fn compile(query: &StructuredQuery, table: &str) -> String {
    let mut sql = format!("SELECT {} FROM {}", projection(query), quote_ident(table));

    if !query.conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clause(&query.conditions));
    }

    if !query.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&query.group_by.iter().map(|g| quote_ident(g)).join(", "));
    }

    if !query.order_by.is_empty() {
        let mut orders = query.order_by.iter().map(|o| {
            let target = if query.is_aggregation_alias(&o.column) {
                o.column.clone()
            } else {
                quote_ident(&o.column)
            };
            format!("{} {}", target, o.direction.as_sql())
        });
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    sql
}

fn projection(query: &StructuredQuery) -> String {
    if !query.aggregations.is_empty() {
        return query
            .group_by
            .iter()
            .map(|g| quote_ident(g))
            .chain(query.aggregations.iter().map(aggregation_sql))
            .join(", ");
    }
    if query.columns.is_empty() {
        "*".to_string()
    } else {
        query.columns.iter().map(|c| quote_ident(c)).join(", ")
    }
}

fn aggregation_sql(agg: &Aggregation) -> String {
    let target = agg
        .column
        .as_deref()
        .map(quote_ident)
        .unwrap_or_else(|| "*".to_string());
    format!("{}({}) AS {}", agg.func.as_sql(), target, agg.alias)
}

/// Conditions joined left-to-right; the accumulated expression is wrapped in
/// parentheses whenever the connector changes.
fn where_clause(conditions: &[Condition]) -> String {
    let mut expr = String::new();
    let mut previous: Option<Connector> = None;
    for (idx, cond) in conditions.iter().enumerate() {
        let rendered = condition_sql(cond);
        if idx == 0 {
            expr = rendered;
            continue;
        }
        if previous.map_or(false, |p| p != cond.connector) {
            expr = format!("({})", expr);
        }
        expr = format!("{} {} {}", expr, cond.connector, rendered);
        previous = Some(cond.connector);
    }
    expr
}

fn condition_sql(cond: &Condition) -> String {
    let column = quote_ident(&cond.column);
    match (&cond.operator, &cond.value) {
        (Operator::Between, ConditionValue::Range(low, high)) => {
            format!("{} BETWEEN {} AND {}", column, value_sql(low), value_sql(high))
        }
        (Operator::In, ConditionValue::List(items)) => {
            format!("{} IN ({})", column, items.iter().map(value_sql).join(", "))
        }
        (op, value) => format!("{} {} {}", column, op.as_sql(), value_sql(value)),
    }
}

fn value_sql(value: &ConditionValue) -> String {
    match value {
        ConditionValue::Number(n) => super::format_number(*n),
        ConditionValue::Text(t) => quote_literal(t),
        ConditionValue::Column(c) => quote_ident(c),
        ConditionValue::Range(low, high) => format!("{} AND {}", value_sql(low), value_sql(high)),
        ConditionValue::List(items) => format!("({})", items.iter().map(value_sql).join(", ")),
    }
}

/// Bare when the name is a lowercase identifier and not a keyword, otherwise
/// double-quoted with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    let upper = name.to_uppercase();
    if simple && !ALL_KEYWORDS.contains(&upper.as_str()) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregateFunc, OrderBy, QueryIntent, SortDirection};

    #[test]
    fn test_compile_ranked_aggregate() {
        let mut q = StructuredQuery::new(QueryIntent::TopN);
        q.aggregations
            .push(Aggregation::new(AggregateFunc::Sum, Some("actual_sales".to_string())));
        q.group_by.push("region".to_string());
        q.order_by
            .push(OrderBy::new("sum_actual_sales", SortDirection::Desc));
        q.limit = Some(5);
        assert_eq!(
            compile(&q, "financial_data"),
            "SELECT region, SUM(actual_sales) AS sum_actual_sales FROM financial_data \
             GROUP BY region ORDER BY sum_actual_sales DESC LIMIT 5"
        );
    }

    #[test]
    fn test_mixed_connectors_are_parenthesised() {
        let mut q = StructuredQuery::new(QueryIntent::Filter);
        q.conditions.push(Condition::new(
            "actual_sales",
            Operator::Gt,
            ConditionValue::Number(100.0),
        ));
        q.conditions.push(
            Condition::new("cost", Operator::Lt, ConditionValue::Number(5.5))
                .with_connector(Connector::And),
        );
        q.conditions.push(
            Condition::new("region", Operator::Eq, ConditionValue::Text("O'Hare".to_string()))
                .with_connector(Connector::Or),
        );
        assert_eq!(
            compile(&q, "t"),
            "SELECT * FROM t WHERE (actual_sales > 100 AND cost < 5.5) OR region = 'O''Hare'"
        );
    }

    #[test]
    fn test_between_in_and_count_all() {
        let mut q = StructuredQuery::new(QueryIntent::Aggregate);
        q.conditions.push(Condition::new(
            "units",
            Operator::Between,
            ConditionValue::Range(
                Box::new(ConditionValue::Number(1.0)),
                Box::new(ConditionValue::Number(10.0)),
            ),
        ));
        q.conditions.push(Condition::new(
            "region",
            Operator::In,
            ConditionValue::List(vec![
                ConditionValue::Text("West".to_string()),
                ConditionValue::Text("East".to_string()),
            ]),
        ));
        q.aggregations.push(Aggregation::new(AggregateFunc::Count, None));
        assert_eq!(
            compile(&q, "t"),
            "SELECT COUNT(*) AS count_all FROM t WHERE units BETWEEN 1 AND 10 \
             AND region IN ('West', 'East')"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("actual_sales"), "actual_sales");
        assert_eq!(quote_ident("Region"), "\"Region\"");
        assert_eq!(quote_ident("order date"), "\"order date\"");
        assert_eq!(quote_ident("date"), "\"date\"");
        assert_eq!(quote_ident("select"), "\"select\"");
    }
}
