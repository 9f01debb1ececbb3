//! Execution Result - rows returned to the caller, as JSON values

use crate::error::{Failure, NlqError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub error: Option<Failure>,
    /// Non-fatal issues, e.g. the scan was truncated at the row cap
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Convert a collected frame, keeping at most `max_rows` rows.
    pub fn from_frame(df: &DataFrame, max_rows: usize, execution_time_ms: u64) -> Result<Self> {
        let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        let mut warnings = Vec::new();
        let kept = if df.height() > max_rows {
            warnings.push(format!(
                "Result truncated to {} of {} rows",
                max_rows,
                df.height()
            ));
            df.head(Some(max_rows))
        } else {
            df.clone()
        };

        let mut rows = Vec::with_capacity(kept.height());
        for row_idx in 0..kept.height() {
            let mut row = Vec::with_capacity(columns.len());
            for series in kept.get_columns() {
                row.push(series_to_json_value(series, row_idx)?);
            }
            rows.push(row);
        }

        Ok(Self {
            columns,
            row_count: rows.len(),
            rows,
            execution_time_ms,
            error: None,
            warnings,
        })
    }

    /// Zero rows and the error set. Never carries partial data.
    pub fn failed(error: &NlqError, execution_time_ms: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms,
            error: Some(error.to_failure()),
            warnings: Vec::new(),
        }
    }

    /// Result for a query that never reached execution.
    pub fn skipped(failure: Failure) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            execution_time_ms: 0,
            error: Some(failure),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        let mut all = warnings;
        all.append(&mut self.warnings);
        self.warnings = all;
        self
    }

    /// Values of one column, by name.
    pub fn column_values(&self, name: &str) -> Option<Vec<&serde_json::Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }

    /// Markdown table of the first `max_rows` rows.
    pub fn to_markdown(&self, max_rows: usize) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!(
            "|{}\n",
            self.columns.iter().map(|_| " --- |").collect::<String>()
        ));
        for row in self.rows.iter().take(max_rows) {
            let cells: Vec<String> = row.iter().map(render_cell).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        if self.rows.len() > max_rows {
            out.push_str(&format!("… {} more rows\n", self.rows.len() - max_rows));
        }
        out
    }
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.replace('|', "\\|"),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{:.2}", f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn series_to_json_value(series: &Series, row_idx: usize) -> Result<serde_json::Value> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| NlqError::Execution(format!("Failed to get value: {}", e)))?;

    match any_val {
        AnyValue::Null => Ok(serde_json::Value::Null),
        AnyValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        AnyValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        AnyValue::StringOwned(s) => Ok(serde_json::Value::String(s.to_string())),
        AnyValue::Int8(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int16(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int32(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int64(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::UInt8(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt16(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt32(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt64(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::Float32(f) => Ok(serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        AnyValue::Float64(f) => Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        other => Ok(serde_json::Value::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_frame_caps_rows() {
        let df = df!(
            "region" => &["West", "East", "North"],
            "actual_sales" => &[1.5f64, 2.0, 3.25]
        )
        .unwrap();
        let result = ExecutionResult::from_frame(&df, 2, 7).unwrap();
        assert_eq!(result.columns, vec!["region", "actual_sales"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0][0], serde_json::json!("West"));
        assert_eq!(result.rows[1][1], serde_json::json!(2.0));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.is_success());
    }

    #[test]
    fn test_failed_has_no_rows() {
        let result = ExecutionResult::failed(&NlqError::UnsafeQuery("DROP".to_string()), 0);
        assert_eq!(result.row_count, 0);
        assert!(result.rows.is_empty());
        assert!(!result.is_success());
    }

    #[test]
    fn test_markdown() {
        let df = df!("region" => &["West"], "n" => &[3i64]).unwrap();
        let md = ExecutionResult::from_frame(&df, 10, 1).unwrap().to_markdown(10);
        assert_eq!(md, "| region | n |\n| --- | --- |\n| West | 3 |\n");
    }
}
