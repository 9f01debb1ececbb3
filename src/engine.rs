//! NLQ Engine - the request pipeline.
//!
//! Idle → Routed → Translated → Validated → Executed → Formatted, with a
//! direct exit to Failed from any stage. The caller always gets an
//! [`AssistantResponse`]; no stage propagates an error out of
//! [`NlqEngine::translate_and_run`].

use crate::analyzer::{Analyzer, AnalyzerReply, GeneralAnalyzer};
use crate::cache::{self, CacheKey, CachedAnswer, TranslationCache};
use crate::comparison::{ComparisonReport, QualityScorer, StrategyComparator};
use crate::config::EngineConfig;
use crate::dataset::{DatasetSnapshot, DatasetStore};
use crate::error::{Failure, FailureKind, NlqError, Result};
use crate::execution::{guard, ExecutionLimits, ExecutionResult, QueryInput, SafeQueryExecutor};
use crate::llm::{CompletionService, LlmClient};
use crate::router::{IntentRouter, RouteDecision, RouteIntent};
use crate::strategy::{
    LlmEnhancedStrategy, RequestContext, SemanticParsingStrategy, StrategyRegistry,
    TranslationResult, TranslationStrategy,
};
use crate::vocabulary::Vocabulary;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

/// Rows shown in the Markdown table of a response.
pub const TABLE_ROWS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    Routed,
    Translated,
    Validated,
    Executed,
    Formatted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantResponse {
    pub request_id: String,
    pub intent: RouteIntent,
    pub text: String,
    /// Markdown rendering of the result rows
    pub table: Option<String>,
    pub result: Option<ExecutionResult>,
    pub translation: Option<TranslationResult>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub stages: Vec<PipelineStage>,
    pub failure: Option<Failure>,
}

impl AssistantResponse {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            intent: RouteIntent::General,
            text: String::new(),
            table: None,
            result: None,
            translation: None,
            suggestions: Vec::new(),
            stages: vec![PipelineStage::Idle],
            failure: None,
        }
    }

    fn fail(mut self, failure: Failure) -> Self {
        self.text = failure.message.clone();
        self.failure = Some(failure);
        self.stages.push(PipelineStage::Failed);
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn final_stage(&self) -> PipelineStage {
        self.stages.last().copied().unwrap_or(PipelineStage::Idle)
    }
}

pub struct NlqEngine {
    store: Arc<DatasetStore>,
    vocabulary: Arc<Vocabulary>,
    router: IntentRouter,
    strategies: StrategyRegistry,
    executor: SafeQueryExecutor,
    comparator: StrategyComparator,
    analyzers: Vec<Arc<dyn Analyzer>>,
    cache: Option<Arc<dyn TranslationCache>>,
}

impl NlqEngine {
    /// Build from configuration, creating the HTTP LLM client when a key is
    /// configured.
    pub fn from_config(config: &EngineConfig, store: Arc<DatasetStore>) -> Result<Self> {
        let llm = LlmClient::from_config(&config.llm)
            .map(|client| Arc::new(client) as Arc<dyn CompletionService>);
        if llm.is_none() {
            info!("🔌 No LLM configured, using rule routing and semantic parsing only");
        }
        Self::new(config, store, llm)
    }

    pub fn new(
        config: &EngineConfig,
        store: Arc<DatasetStore>,
        llm: Option<Arc<dyn CompletionService>>,
    ) -> Result<Self> {
        let vocabulary = Arc::new(match &config.vocabulary {
            Some(path) => Vocabulary::load(path)?,
            None => Vocabulary::default(),
        });
        let llm_timeout = config.llm.timeout();

        let semantic = Arc::new(SemanticParsingStrategy::new(vocabulary.clone()));
        let mut strategies = StrategyRegistry::new();
        if let Some(llm) = &llm {
            strategies.register(Arc::new(LlmEnhancedStrategy::new(
                llm.clone(),
                semantic.clone(),
                llm_timeout,
            )));
        }
        strategies.register(semantic);

        let executor = SafeQueryExecutor::new(ExecutionLimits::from(&config.executor));
        let comparator =
            StrategyComparator::new(QualityScorer::new(&config.comparator), executor.clone());

        Ok(Self {
            store,
            vocabulary,
            router: IntentRouter::new(llm, &config.router, llm_timeout),
            strategies,
            executor,
            comparator,
            analyzers: vec![Arc::new(GeneralAnalyzer)],
            cache: cache::from_config(&config.cache)?,
        })
    }

    /// Analyzers registered later take precedence over earlier ones.
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.insert(0, analyzer);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn TranslationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn store(&self) -> &Arc<DatasetStore> {
        &self.store
    }

    /// Load a CSV or Parquet file and publish it as the current dataset.
    pub fn load_dataset(&self, path: impl AsRef<Path>, alias: &str) -> Result<()> {
        let snapshot = DatasetSnapshot::from_path(path, alias, &self.vocabulary)?;
        self.store.replace(snapshot);
        Ok(())
    }

    pub async fn translate_and_run(&self, query: &str) -> AssistantResponse {
        self.translate_and_run_with_deadline(query, None).await
    }

    /// The deadline bounds LLM calls only; the executor keeps its own caps.
    pub async fn translate_and_run_with_deadline(
        &self,
        query: &str,
        deadline: Option<Instant>,
    ) -> AssistantResponse {
        let ctx = RequestContext {
            deadline,
            ..RequestContext::default()
        };
        let span = info_span!("request", id = %ctx.request_id);
        self.run_pipeline(query, ctx).instrument(span).await
    }

    async fn run_pipeline(&self, query: &str, mut ctx: RequestContext) -> AssistantResponse {
        info!("💬 Question: {}", query);
        let response = AssistantResponse::new(&ctx.request_id);

        if let Err(e) = guard::check_blacklist(query) {
            return response.fail(e.to_failure());
        }
        let Some(dataset) = self.store.snapshot() else {
            return response.fail(NlqError::Dataset("no dataset is loaded".to_string()).to_failure());
        };
        let schema = dataset.schema();

        let route = self
            .router
            .route_with_deadline(query, schema, ctx.deadline)
            .await;
        let mut response = response;
        response.intent = route.intent;
        response.stages.push(PipelineStage::Routed);
        ctx.route = Some(route.clone());

        if !route.intent.is_engine_intent() && route.intent != RouteIntent::General {
            return self.analyze(response, &route, query, &dataset).await;
        }

        let mut last_failure: Option<Failure> = None;
        for strategy in self.strategies.iter() {
            let (translation, cached_execution) =
                self.translate_cached(strategy.as_ref(), query, &dataset, &ctx).await;
            if !translation.success {
                warn!(
                    "Strategy {} could not translate: {}",
                    translation.strategy_name, translation.explanation
                );
                last_failure = prefer_failure(last_failure, translation.error.clone());
                continue;
            }
            response.stages.push(PipelineStage::Translated);
            if let Some(intent) = translation.structured_query.as_ref().map(|q| q.intent) {
                response.intent = route_intent_for(intent);
            }

            let execution = match cached_execution {
                Some(execution) => execution,
                None => {
                    let input = match &translation.structured_query {
                        Some(query) => QueryInput::Structured(query),
                        None => QueryInput::Sql(&translation.raw_sql),
                    };
                    let execution = self.executor.compile_and_run(input, dataset.clone()).await;
                    self.store_in_cache(&dataset, query, &translation, &execution);
                    execution
                }
            };
            return finish(response, translation, execution);
        }

        // Every strategy failed: hand over to the general analyzer.
        let failure = last_failure.unwrap_or_else(|| {
            Failure::new(FailureKind::RoutingAmbiguous, "no translation strategy is available")
        });
        let reply = self
            .analyzer_reply(RouteIntent::General, query, &dataset)
            .await;
        let mut response = response.fail(failure);
        if let Some(reply) = reply {
            response.text = format!("{}\n{}", response.text, reply.text);
            response.suggestions = reply.suggestions;
        }
        response
    }

    async fn translate_cached(
        &self,
        strategy: &dyn TranslationStrategy,
        query: &str,
        dataset: &DatasetSnapshot,
        ctx: &RequestContext,
    ) -> (TranslationResult, Option<ExecutionResult>) {
        if let Some(cache) = &self.cache {
            let key = CacheKey::new(dataset.fingerprint(), query, strategy.name());
            if let Some(hit) = cache.get(&key) {
                if hit.translation.success {
                    info!("♻️ Reusing cached translation from {}", strategy.name());
                    return (hit.translation, hit.execution);
                }
            }
        }
        (strategy.translate(query, dataset.schema(), ctx).await, None)
    }

    fn store_in_cache(
        &self,
        dataset: &DatasetSnapshot,
        query: &str,
        translation: &TranslationResult,
        execution: &ExecutionResult,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !execution.is_success() {
            return;
        }
        let key = CacheKey::new(dataset.fingerprint(), query, &translation.strategy_name);
        let answer = CachedAnswer {
            translation: translation.clone(),
            execution: Some(execution.clone()),
        };
        if let Err(e) = cache.put(key, answer) {
            warn!("Failed to store translation in cache: {}", e);
        }
    }

    async fn analyze(
        &self,
        mut response: AssistantResponse,
        route: &RouteDecision,
        query: &str,
        dataset: &DatasetSnapshot,
    ) -> AssistantResponse {
        match self.analyzer_reply(route.intent, query, dataset).await {
            Some(reply) => {
                response.text = reply.text;
                response.suggestions = reply.suggestions;
                response.stages.push(PipelineStage::Formatted);
                response
            }
            None => response.fail(Failure::new(
                FailureKind::RoutingAmbiguous,
                format!("no analyzer is available for '{}' questions", route.intent),
            )),
        }
    }

    async fn analyzer_reply(
        &self,
        intent: RouteIntent,
        query: &str,
        dataset: &DatasetSnapshot,
    ) -> Option<AnalyzerReply> {
        for analyzer in self.analyzers.iter().filter(|a| a.handles(intent)) {
            match analyzer.analyze(intent, query, dataset).await {
                Ok(reply) => {
                    info!("🔎 Answered by the {} analyzer", analyzer.name());
                    return Some(reply);
                }
                Err(e) => warn!("Analyzer {} failed: {}", analyzer.name(), e),
            }
        }
        None
    }

    /// Run every registered strategy on `query` and rank them.
    pub async fn compare_strategies(&self, query: &str) -> Result<ComparisonReport> {
        guard::check_blacklist(query)?;
        let dataset = self
            .store
            .snapshot()
            .ok_or_else(|| NlqError::Dataset("no dataset is loaded".to_string()))?;
        let ctx = RequestContext::default();
        let span = info_span!("compare", id = %ctx.request_id);
        let report = self
            .comparator
            .compare(query, dataset, &self.strategies, &ctx)
            .instrument(span)
            .await;
        if let Some(winner) = report.winner() {
            info!(
                "🏆 {} ranked first with {:.1}",
                winner.strategy_name, winner.score.total
            );
        }
        Ok(report)
    }
}

fn finish(
    mut response: AssistantResponse,
    translation: TranslationResult,
    execution: ExecutionResult,
) -> AssistantResponse {
    if let Some(failure) = execution.error.clone() {
        let validation = matches!(
            failure.kind,
            FailureKind::UnsafeQuery | FailureKind::SchemaMismatch | FailureKind::UnsupportedOperator
        );
        if !validation {
            response.stages.push(PipelineStage::Validated);
        }
        response.translation = Some(translation);
        return response.fail(failure);
    }

    response.stages.push(PipelineStage::Validated);
    response.stages.push(PipelineStage::Executed);

    let mut text = format!(
        "{}\n{} rows returned in {} ms",
        translation.explanation, execution.row_count, execution.execution_time_ms
    );
    for warning in &execution.warnings {
        text.push_str(&format!("\nNote: {}", warning));
    }
    response.text = text;
    response.table = Some(execution.to_markdown(TABLE_ROWS));
    response.result = Some(execution);
    response.translation = Some(translation);
    response.stages.push(PipelineStage::Formatted);
    response
}

/// Keep the most informative translation failure: unresolved phrases carry
/// suggestions and win over transport problems.
fn prefer_failure(current: Option<Failure>, next: Option<Failure>) -> Option<Failure> {
    match (current, next) {
        (Some(c), Some(n)) if c.kind == FailureKind::ColumnUnresolved
            && n.kind != FailureKind::ColumnUnresolved =>
        {
            Some(c)
        }
        (c, None) => c,
        (_, n) => n,
    }
}

fn route_intent_for(intent: crate::query::QueryIntent) -> RouteIntent {
    use crate::query::QueryIntent;
    match intent {
        QueryIntent::Select => RouteIntent::Select,
        QueryIntent::Filter => RouteIntent::Filter,
        QueryIntent::Aggregate => RouteIntent::Aggregate,
        QueryIntent::Sort => RouteIntent::Sort,
        QueryIntent::TopN => RouteIntent::TopN,
        QueryIntent::BottomN => RouteIntent::BottomN,
    }
}
