//! Schema Context - column metadata for the currently loaded dataset
//!
//! Built once per upload from the polars frame and replaced wholesale on the
//! next upload. The resolver, parsers and executor all read from it; none of
//! them modify it.

use crate::error::{NlqError, Result};
use crate::vocabulary::Vocabulary;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

const SAMPLE_VALUES: usize = 5;
const SAMPLE_SCAN_ROWS: usize = 1000;
/// Categorical columns up to this cardinality keep their full value list.
const MAX_DISTINCT_VALUES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
    Date,
    Id,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Numeric => write!(f, "numeric"),
            ColumnType::Categorical => write!(f, "categorical"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Id => write!(f, "id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name exactly as it appears in the dataset
    pub name: String,

    pub inferred_type: ColumnType,

    /// Alternative phrasings ("actual sales", "revenue", ...)
    pub synonyms: Vec<String>,

    /// Up to five distinct non-null values, rendered as text
    pub sample_values: Vec<String>,

    /// Every distinct value of a low-cardinality categorical column
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distinct_values: Vec<String>,

    pub nullable: bool,

    /// Number of distinct values
    pub cardinality: usize,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, inferred_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            inferred_type,
            synonyms: Vec::new(),
            sample_values: Vec::new(),
            distinct_values: Vec::new(),
            nullable: false,
            cardinality: 0,
        }
    }

    pub fn with_samples(mut self, samples: &[&str]) -> Self {
        self.sample_values = samples.iter().map(|s| s.to_string()).collect();
        self.cardinality = self.cardinality.max(self.sample_values.len());
        self
    }

    pub fn with_distinct_values(mut self, values: &[&str]) -> Self {
        self.distinct_values = values.iter().map(|s| s.to_string()).collect();
        self.cardinality = self.cardinality.max(self.distinct_values.len());
        self
    }

    /// The full value list when it was captured, the samples otherwise.
    pub fn known_values(&self) -> &[String] {
        if self.distinct_values.is_empty() {
            &self.sample_values
        } else {
            &self.distinct_values
        }
    }

    /// The stored spelling of `value`, compared without regard to case.
    pub fn canonical_value(&self, value: &str) -> Option<&str> {
        self.known_values()
            .iter()
            .find(|v| v.eq_ignore_ascii_case(value))
            .map(|v| v.as_str())
    }

    /// Lowercased name split on `_`, `-` and spaces.
    pub fn words(&self) -> Vec<String> {
        split_identifier(&self.name)
    }

    pub fn is_numeric(&self) -> bool {
        self.inferred_type == ColumnType::Numeric
    }

    /// Categorical and date columns can be grouped on.
    pub fn is_dimension(&self) -> bool {
        matches!(
            self.inferred_type,
            ColumnType::Categorical | ColumnType::Date
        )
    }

    /// True when every numeric sample lies within [-1, 1], i.e. the column
    /// stores ratios rather than whole percentages.
    pub fn is_fraction_scaled(&self) -> bool {
        let values: Vec<f64> = self
            .sample_values
            .iter()
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .collect();
        !values.is_empty() && values.iter().all(|v| v.abs() <= 1.0)
    }
}

/// Lowercased identifier words: `Actual_Sales` -> `["actual", "sales"]`.
pub fn split_identifier(name: &str) -> Vec<String> {
    name.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Lowercase and drop everything that is not alphanumeric.
pub fn depunctuate(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContext {
    /// Table name the dataset is registered under for SQL execution
    pub alias: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl SchemaContext {
    pub fn new(alias: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            alias: alias.into(),
            columns,
        }
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn numeric_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_numeric())
    }

    /// Infer a schema from a loaded frame.
    pub fn infer(alias: &str, df: &DataFrame, vocabulary: &Vocabulary) -> Result<Self> {
        if df.width() == 0 {
            return Err(NlqError::Dataset("Dataset has no columns".to_string()));
        }

        let mut columns = Vec::with_capacity(df.width());
        for series in df.get_columns() {
            let name = series.name().to_string();
            let samples = sample_values(series)?;
            let inferred_type = infer_type(&name, series.dtype(), &samples);
            let cardinality = series.n_unique().unwrap_or(0);

            let mut descriptor = ColumnDescriptor::new(name, inferred_type);
            descriptor.nullable = series.null_count() > 0;
            descriptor.cardinality = cardinality;
            descriptor.sample_values = samples;
            if inferred_type == ColumnType::Categorical && cardinality <= MAX_DISTINCT_VALUES {
                descriptor.distinct_values = distinct_values(series)?;
            }
            descriptor.synonyms = derive_synonyms(&descriptor, vocabulary);
            columns.push(descriptor);
        }

        Ok(Self::new(alias, columns))
    }

    /// Compact description used in LLM prompts.
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                if c.sample_values.is_empty() {
                    format!("- {} ({})", c.name, c.inferred_type)
                } else {
                    format!(
                        "- {} ({}; e.g. {})",
                        c.name,
                        c.inferred_type,
                        c.sample_values.join(", ")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn infer_type(name: &str, dtype: &DataType, samples: &[String]) -> ColumnType {
    let words = split_identifier(name);
    let looks_like_id = words.last().map(|w| w == "id" || w == "uuid").unwrap_or(false);

    match dtype {
        DataType::Date | DataType::Datetime(_, _) => ColumnType::Date,
        dt if dt.is_integer() && looks_like_id => ColumnType::Id,
        dt if dt.is_numeric() => ColumnType::Numeric,
        DataType::String => {
            if looks_like_id {
                ColumnType::Id
            } else if !samples.is_empty() && samples.iter().all(|s| parses_as_date(s)) {
                ColumnType::Date
            } else {
                ColumnType::Categorical
            }
        }
        _ => ColumnType::Categorical,
    }
}

fn parses_as_date(value: &str) -> bool {
    let value = value.trim();
    ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%Y-%m"]
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
        || NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d").is_ok()
}

fn sample_values(series: &Series) -> Result<Vec<String>> {
    let mut samples: Vec<String> = Vec::new();
    let scan = series.len().min(SAMPLE_SCAN_ROWS);
    for idx in 0..scan {
        let value = series.get(idx)?;
        if let Some(text) = render_any_value(&value) {
            if !samples.contains(&text) {
                samples.push(text);
                if samples.len() == SAMPLE_VALUES {
                    break;
                }
            }
        }
    }
    Ok(samples)
}

fn distinct_values(series: &Series) -> Result<Vec<String>> {
    let unique = series.unique_stable()?;
    let mut values = Vec::with_capacity(unique.len());
    for idx in 0..unique.len() {
        if let Some(text) = render_any_value(&unique.get(idx)?) {
            values.push(text);
        }
    }
    Ok(values)
}

/// Render a cell as plain text; `None` for nulls.
pub fn render_any_value(value: &AnyValue) -> Option<String> {
    match value {
        AnyValue::Null => None,
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        other => Some(format!("{}", other)),
    }
}

fn derive_synonyms(column: &ColumnDescriptor, vocabulary: &Vocabulary) -> Vec<String> {
    let words = column.words();
    let mut synonyms = Vec::new();
    let spaced = words.join(" ");
    if spaced != column.name {
        synonyms.push(spaced);
    }
    for term in vocabulary.synonyms_of(&column.name.to_lowercase()) {
        if term != column.name.to_lowercase() && !synonyms.contains(&term) {
            synonyms.push(term);
        }
    }
    synonyms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_types_from_frame() {
        let df = df! [
            "order_id" => [1i64, 2, 3],
            "region" => ["West", "East", "West"],
            "order_date" => ["2024-01-05", "2024-02-11", "2024-03-09"],
            "actual_sales" => [100.0, 250.5, 75.0],
            "discount_pct" => [0.1, 0.25, 0.05]
        ]
        .unwrap();

        let schema = SchemaContext::infer("sales", &df, &Vocabulary::default()).unwrap();
        let types: Vec<ColumnType> = schema.columns.iter().map(|c| c.inferred_type).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Id,
                ColumnType::Categorical,
                ColumnType::Date,
                ColumnType::Numeric,
                ColumnType::Numeric
            ]
        );

        let region = schema.column("REGION").unwrap();
        assert_eq!(region.cardinality, 2);
        assert_eq!(region.sample_values, vec!["West", "East"]);
        assert_eq!(region.distinct_values, vec!["West", "East"]);
        assert_eq!(region.canonical_value("west"), Some("West"));
        assert!(!region.nullable);

        let sales = schema.column("actual_sales").unwrap();
        assert!(sales.synonyms.contains(&"actual sales".to_string()));
        assert!(sales.synonyms.contains(&"revenue".to_string()));

        assert!(schema.column("discount_pct").unwrap().is_fraction_scaled());
        assert!(!sales.is_fraction_scaled());
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let df = DataFrame::empty();
        assert!(SchemaContext::infer("t", &df, &Vocabulary::default()).is_err());
    }

    #[test]
    fn test_split_and_depunctuate() {
        assert_eq!(split_identifier("Budget_Sales"), vec!["budget", "sales"]);
        assert_eq!(depunctuate("product-line!"), "productline");
    }
}
