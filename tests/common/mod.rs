#![allow(dead_code)]

use async_trait::async_trait;
use nlq_engine::config::EngineConfig;
use nlq_engine::dataset::{DatasetSnapshot, DatasetStore};
use nlq_engine::llm::CompletionService;
use nlq_engine::vocabulary::Vocabulary;
use nlq_engine::{NlqEngine, NlqError, Result};
use polars::prelude::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REGIONS: [&str; 7] = ["West", "East", "North", "South", "Central", "North East", "Pacific"];

/// Seven regions, one row each, plus product attributes.
pub fn financial_frame(scale: f64) -> DataFrame {
    df!(
        "region" => &REGIONS,
        "product_line" => &["Hardware", "Software", "Hardware", "Services", "Software", "Services", "Hardware"],
        "product" => &["Laptop", "Suite", "Monitor", "Support", "Cloud", "Training", "Phone"],
        "budget_sales" => &[50_000.0f64, 70_000.0, 65_000.0, 40_000.0, 90_000.0, 30_000.0, 61_000.0],
        "actual_sales" => &[55_000.0 * scale, 60_000.0 * scale, 66_000.0 * scale, 35_000.0 * scale,
                            95_000.0 * scale, 20_000.0 * scale, 62_000.0 * scale],
        "discount_pct" => &[0.10f64, 0.05, 0.12, 0.20, 0.08, 0.15, 0.11],
        "customer_satisfaction" => &[4.1f64, 3.8, 4.6, 3.2, 4.9, 3.5, 4.0]
    )
    .unwrap()
}

pub fn snapshot(scale: f64) -> DatasetSnapshot {
    DatasetSnapshot::from_frame("financial_data", financial_frame(scale), &Vocabulary::default())
        .unwrap()
}

pub fn engine() -> NlqEngine {
    engine_with_llm(None)
}

pub fn engine_with_llm(llm: Option<Arc<dyn CompletionService>>) -> NlqEngine {
    let store = Arc::new(DatasetStore::with_snapshot(snapshot(1.0)));
    NlqEngine::new(&EngineConfig::default(), store, llm).unwrap()
}

/// Completion service that replays canned replies, then reports itself
/// unavailable.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NlqError::LlmUnavailable("script exhausted".to_string()))
    }
}

/// Never answers.
pub struct HangingLlm;

#[async_trait]
impl CompletionService for HangingLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(NlqError::LlmUnavailable("unreachable".to_string()))
    }
}

pub fn as_f64s(values: Vec<&serde_json::Value>) -> Vec<f64> {
    values.iter().filter_map(|v| v.as_f64()).collect()
}
