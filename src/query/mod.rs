//! Structured Query - the engine-agnostic representation every translation
//! strategy produces and the executor consumes.

pub mod sql;

use crate::error::{NlqError, Result};
use crate::schema::SchemaContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 1000;
pub const DEFAULT_RANK_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Select,
    Filter,
    Aggregate,
    Sort,
    TopN,
    BottomN,
}

impl QueryIntent {
    pub const ALL: [QueryIntent; 6] = [
        QueryIntent::Select,
        QueryIntent::Filter,
        QueryIntent::Aggregate,
        QueryIntent::Sort,
        QueryIntent::TopN,
        QueryIntent::BottomN,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            QueryIntent::Select => "select",
            QueryIntent::Filter => "filter",
            QueryIntent::Aggregate => "aggregate",
            QueryIntent::Sort => "sort",
            QueryIntent::TopN => "top_n",
            QueryIntent::BottomN => "bottom_n",
        }
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for QueryIntent {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        QueryIntent::ALL
            .iter()
            .copied()
            .find(|i| i.label() == normalized)
            .ok_or_else(|| NlqError::RoutingAmbiguous(format!("Unknown query intent '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "BETWEEN")]
    Between,
    #[serde(rename = "IN")]
    In,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::GtEq => ">=",
            Operator::LtEq => "<=",
            Operator::Like => "LIKE",
            Operator::Between => "BETWEEN",
            Operator::In => "IN",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "=" | "==" | "EQ" => Ok(Operator::Eq),
            "!=" | "<>" | "NE" => Ok(Operator::NotEq),
            ">" | "GT" => Ok(Operator::Gt),
            "<" | "LT" => Ok(Operator::Lt),
            ">=" | "GTE" => Ok(Operator::GtEq),
            "<=" | "LTE" => Ok(Operator::LtEq),
            "LIKE" => Ok(Operator::Like),
            "BETWEEN" => Ok(Operator::Between),
            "IN" => Ok(Operator::In),
            other => Err(NlqError::UnsupportedOperator(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Connector {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::And => f.write_str("AND"),
            Connector::Or => f.write_str("OR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConditionValue {
    Number(f64),
    Text(String),
    /// Another column of the same dataset
    Column(String),
    Range(Box<ConditionValue>, Box<ConditionValue>),
    List(Vec<ConditionValue>),
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Number(n) => f.write_str(&format_number(*n)),
            ConditionValue::Text(t) => write!(f, "'{}'", t),
            ConditionValue::Column(c) => f.write_str(c),
            ConditionValue::Range(low, high) => write!(f, "{} AND {}", low, high),
            ConditionValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "({})", rendered.join(", "))
            }
        }
    }
}

/// Whole numbers without a trailing `.0`, everything else as-is.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub operator: Operator,
    pub value: ConditionValue,
    /// How this condition joins the one before it
    #[serde(default)]
    pub connector: Connector,
}

impl Condition {
    pub fn new(column: impl Into<String>, operator: Operator, value: ConditionValue) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            connector: Connector::And,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.column, self.operator, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    #[serde(rename = "SUM", alias = "sum")]
    Sum,
    #[serde(rename = "AVG", alias = "avg")]
    Avg,
    #[serde(rename = "COUNT", alias = "count")]
    Count,
    #[serde(rename = "MIN", alias = "min")]
    Min,
    #[serde(rename = "MAX", alias = "max")]
    Max,
}

impl AggregateFunc {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for AggregateFunc {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SUM" => Ok(AggregateFunc::Sum),
            "AVG" | "AVERAGE" | "MEAN" => Ok(AggregateFunc::Avg),
            "COUNT" => Ok(AggregateFunc::Count),
            "MIN" => Ok(AggregateFunc::Min),
            "MAX" => Ok(AggregateFunc::Max),
            other => Err(NlqError::UnsupportedOperator(format!(
                "aggregate function {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub func: AggregateFunc,
    /// `None` means `COUNT(*)`
    pub column: Option<String>,
    pub alias: String,
}

impl Aggregation {
    pub fn new(func: AggregateFunc, column: Option<String>) -> Self {
        let alias = aggregation_alias(func, column.as_deref());
        Self {
            func,
            column,
            alias,
        }
    }

    /// `SUM(actual_sales)`
    pub fn expression(&self) -> String {
        format!(
            "{}({})",
            self.func,
            self.column.as_deref().unwrap_or("*")
        )
    }
}

/// `sum_actual_sales`, `count_all`
pub fn aggregation_alias(func: AggregateFunc, column: Option<&str>) -> String {
    let column = column
        .map(|c| sanitize_alias_part(c))
        .unwrap_or_else(|| "all".to_string());
    format!("{}_{}", func.as_sql().to_lowercase(), column)
}

fn sanitize_alias_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "ASC" | "ASCENDING" => Ok(SortDirection::Asc),
            "DESC" | "DESCENDING" => Ok(SortDirection::Desc),
            other => Err(NlqError::UnsupportedOperator(format!("sort direction {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    /// A schema column or the alias of an aggregation in the same query
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub intent: QueryIntent,
    /// Projected columns; empty means every column
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl StructuredQuery {
    pub fn new(intent: QueryIntent) -> Self {
        Self {
            intent,
            columns: Vec::new(),
            conditions: Vec::new(),
            aggregations: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Every schema column the query touches, in first-use order.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !out.iter().any(|c| c == name) {
                out.push(name.to_string());
            }
        };
        for c in &self.columns {
            push(c);
        }
        for cond in &self.conditions {
            push(&cond.column);
            collect_value_columns(&cond.value, &mut push);
        }
        for agg in &self.aggregations {
            if let Some(c) = &agg.column {
                push(c);
            }
        }
        for g in &self.group_by {
            push(g);
        }
        for o in &self.order_by {
            if !self.is_aggregation_alias(&o.column) {
                push(&o.column);
            }
        }
        out
    }

    pub fn is_aggregation_alias(&self, name: &str) -> bool {
        self.aggregations.iter().any(|a| a.alias == name)
    }

    pub fn aggregation_by_alias(&self, alias: &str) -> Option<&Aggregation> {
        self.aggregations.iter().find(|a| a.alias == alias)
    }

    /// Check every referenced column against the schema and rewrite names to
    /// the schema's exact spelling.
    pub fn validate_against(&mut self, schema: &SchemaContext) -> Result<()> {
        for name in self.referenced_columns() {
            if !schema.has_column(&name) {
                return Err(NlqError::SchemaMismatch(format!(
                    "Column '{}' does not exist in {}",
                    name, schema.alias
                )));
            }
        }
        let canonical = |name: &mut String| {
            if let Some(column) = schema.column(name) {
                *name = column.name.clone();
            }
        };
        self.columns.iter_mut().for_each(canonical);
        self.group_by.iter_mut().for_each(canonical);
        for cond in &mut self.conditions {
            canonical(&mut cond.column);
            canonicalize_value(&mut cond.value, schema);
        }
        for agg in &mut self.aggregations {
            if let Some(c) = agg.column.as_mut() {
                canonical(c);
            }
        }
        let aliases: Vec<String> = self.aggregations.iter().map(|a| a.alias.clone()).collect();
        for order in &mut self.order_by {
            if !aliases.contains(&order.column) {
                canonical(&mut order.column);
            }
        }
        if let Some(limit) = self.limit {
            if limit == 0 {
                return Err(NlqError::UnsupportedOperator("LIMIT 0".to_string()));
            }
        }
        Ok(())
    }

    /// Human-readable sentence describing what the query does.
    pub fn explain(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !self.conditions.is_empty() {
            let mut rendered = String::new();
            for (idx, cond) in self.conditions.iter().enumerate() {
                if idx > 0 {
                    rendered.push_str(&format!(" {} ", cond.connector));
                }
                rendered.push_str(&cond.to_string());
            }
            parts.push(format!("filtering rows where {}", rendered));
        }

        if !self.aggregations.is_empty() {
            let aggs: Vec<String> = self.aggregations.iter().map(|a| a.expression()).collect();
            parts.push(format!("computing {}", aggs.join(", ")));
        } else if self.conditions.is_empty() {
            if self.columns.is_empty() {
                parts.push("selecting all columns".to_string());
            } else {
                parts.push(format!("selecting {}", self.columns.join(", ")));
            }
        }

        if !self.group_by.is_empty() {
            parts.push(format!("grouped by {}", self.group_by.join(", ")));
        }

        if !self.order_by.is_empty() {
            let orders: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    let target = self
                        .aggregation_by_alias(&o.column)
                        .map(|a| a.expression())
                        .unwrap_or_else(|| o.column.clone());
                    let direction = match o.direction {
                        SortDirection::Asc => "ascending",
                        SortDirection::Desc => "descending",
                    };
                    format!("{} {}", target, direction)
                })
                .collect();
            parts.push(format!("sorted by {}", orders.join(", ")));
        }

        if let Some(limit) = self.limit {
            parts.push(format!("limited to {}", limit));
        }

        let sentence = parts.join(", ");
        let mut chars = sentence.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => sentence,
        }
    }
}

fn collect_value_columns(value: &ConditionValue, push: &mut impl FnMut(&str)) {
    match value {
        ConditionValue::Column(c) => push(c),
        ConditionValue::Range(low, high) => {
            collect_value_columns(low, push);
            collect_value_columns(high, push);
        }
        ConditionValue::List(items) => {
            for item in items {
                collect_value_columns(item, push);
            }
        }
        ConditionValue::Number(_) | ConditionValue::Text(_) => {}
    }
}

fn canonicalize_value(value: &mut ConditionValue, schema: &SchemaContext) {
    match value {
        ConditionValue::Column(c) => {
            if let Some(column) = schema.column(c) {
                *c = column.name.clone();
            }
        }
        ConditionValue::Range(low, high) => {
            canonicalize_value(low, schema);
            canonicalize_value(high, schema);
        }
        ConditionValue::List(items) => {
            for item in items {
                canonicalize_value(item, schema);
            }
        }
        ConditionValue::Number(_) | ConditionValue::Text(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDescriptor, ColumnType};

    fn schema() -> SchemaContext {
        SchemaContext::new(
            "financial_data",
            vec![
                ColumnDescriptor::new("region", ColumnType::Categorical),
                ColumnDescriptor::new("budget_sales", ColumnType::Numeric),
                ColumnDescriptor::new("actual_sales", ColumnType::Numeric),
            ],
        )
    }

    fn ranked_query() -> StructuredQuery {
        let mut q = StructuredQuery::new(QueryIntent::TopN);
        q.conditions.push(Condition::new(
            "actual_sales",
            Operator::Lt,
            ConditionValue::Column("budget_sales".to_string()),
        ));
        q.aggregations
            .push(Aggregation::new(AggregateFunc::Sum, Some("actual_sales".to_string())));
        q.group_by.push("region".to_string());
        q.order_by
            .push(OrderBy::new("sum_actual_sales", SortDirection::Desc));
        q.limit = Some(5);
        q
    }

    #[test]
    fn test_explain_sentence() {
        assert_eq!(
            ranked_query().explain(),
            "Filtering rows where actual_sales < budget_sales, computing SUM(actual_sales), \
             grouped by region, sorted by SUM(actual_sales) descending, limited to 5"
        );
        assert_eq!(
            StructuredQuery::new(QueryIntent::Select).explain(),
            "Selecting all columns"
        );
    }

    #[test]
    fn test_referenced_columns_skip_aliases() {
        assert_eq!(
            ranked_query().referenced_columns(),
            vec!["actual_sales", "budget_sales", "region"]
        );
    }

    #[test]
    fn test_validate_canonicalizes_and_rejects_unknown() {
        let mut q = StructuredQuery::new(QueryIntent::Filter);
        q.conditions.push(Condition::new(
            "ACTUAL_SALES",
            Operator::Gt,
            ConditionValue::Number(10.0),
        ));
        q.validate_against(&schema()).unwrap();
        assert_eq!(q.conditions[0].column, "actual_sales");

        q.group_by.push("country".to_string());
        assert!(matches!(
            q.validate_against(&schema()),
            Err(NlqError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("<>".parse::<Operator>().unwrap(), Operator::NotEq);
        assert_eq!("between".parse::<Operator>().unwrap(), Operator::Between);
        assert!(matches!(
            "REGEXP".parse::<Operator>(),
            Err(NlqError::UnsupportedOperator(_))
        ));
        assert_eq!("top n".parse::<QueryIntent>().unwrap(), QueryIntent::TopN);
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_value(ranked_query()).unwrap();
        assert_eq!(json["intent"], "top_n");
        assert_eq!(json["conditions"][0]["operator"], "<");
        assert_eq!(json["aggregations"][0]["func"], "SUM");
        assert_eq!(json["order_by"][0]["direction"], "DESC");
        let back: StructuredQuery = serde_json::from_value(json).unwrap();
        assert_eq!(back, ranked_query());
    }
}
