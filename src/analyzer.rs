//! Analyzer collaborators: questions the engine does not translate into a
//! query (variance, trend, contribution, general) are handed to an
//! [`Analyzer`]. The crate ships one, [`GeneralAnalyzer`], which describes the
//! dataset and suggests phrasings the engine can answer.

use crate::dataset::DatasetSnapshot;
use crate::error::Result;
use crate::router::RouteIntent;
use crate::schema::ColumnType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerReply {
    pub text: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this analyzer takes questions routed to `intent`.
    fn handles(&self, intent: RouteIntent) -> bool;

    async fn analyze(
        &self,
        intent: RouteIntent,
        query: &str,
        dataset: &DatasetSnapshot,
    ) -> Result<AnalyzerReply>;
}

/// Catch-all: summarises the dataset and proposes example questions.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralAnalyzer;

impl GeneralAnalyzer {
    pub fn suggestions(dataset: &DatasetSnapshot) -> Vec<String> {
        let schema = dataset.schema();
        let metric = schema.numeric_columns().next().map(|c| c.name.replace('_', " "));
        let dimension = schema
            .columns
            .iter()
            .find(|c| c.inferred_type == ColumnType::Categorical)
            .map(|c| c.name.replace('_', " "));

        let mut out = Vec::new();
        match (&metric, &dimension) {
            (Some(metric), Some(dimension)) => {
                out.push(format!("Top 5 {} by {}", dimension, metric));
                out.push(format!("Total {} by {}", metric, dimension));
                out.push(format!("Show rows where {} is greater than 100", metric));
            }
            (Some(metric), None) => {
                out.push(format!("Average {}", metric));
                out.push(format!("Show rows where {} is greater than 100", metric));
            }
            (None, Some(dimension)) => {
                out.push(format!("Number of rows by {}", dimension));
            }
            (None, None) => out.push("Show all rows".to_string()),
        }
        out
    }
}

#[async_trait]
impl Analyzer for GeneralAnalyzer {
    fn name(&self) -> &str {
        "general"
    }

    fn handles(&self, _intent: RouteIntent) -> bool {
        true
    }

    async fn analyze(
        &self,
        intent: RouteIntent,
        _query: &str,
        dataset: &DatasetSnapshot,
    ) -> Result<AnalyzerReply> {
        let schema = dataset.schema();
        let columns: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.inferred_type))
            .collect();
        let lead = match intent {
            RouteIntent::General => "I could not turn that into a query.".to_string(),
            other => format!("No {} analyzer is configured.", other),
        };
        let text = format!(
            "{} The dataset '{}' has {} rows and these columns: {}.",
            lead,
            schema.alias,
            dataset.row_count(),
            columns.join(", ")
        );
        Ok(AnalyzerReply {
            text,
            suggestions: Self::suggestions(dataset),
        })
    }
}
