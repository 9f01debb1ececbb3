//! Intent Router - decides whether a question belongs to the query engine or
//! to one of the external analyzers.
//!
//! Rules are grouped into priority tiers. The first tier with any match wins;
//! inside a tier the longest matched literal wins. Weak or missing matches go
//! to an LLM classifier constrained to the known labels, and anything it
//! cannot settle becomes `general`. Routing never fails.

use crate::config::RouterConfig;
use crate::error::NlqError;
use crate::llm::{extract_json_object, strip_code_fences, CompletionService};
use crate::query::QueryIntent;
use crate::schema::SchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COLUMN_BONUS: f64 = 0.1;
const LLM_CONFIDENCE: f64 = 0.6;
const DEFAULT_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteIntent {
    Select,
    Filter,
    Aggregate,
    Sort,
    TopN,
    BottomN,
    Variance,
    Trend,
    Contribution,
    General,
}

impl RouteIntent {
    pub const ALL: [RouteIntent; 10] = [
        RouteIntent::Select,
        RouteIntent::Filter,
        RouteIntent::Aggregate,
        RouteIntent::Sort,
        RouteIntent::TopN,
        RouteIntent::BottomN,
        RouteIntent::Variance,
        RouteIntent::Trend,
        RouteIntent::Contribution,
        RouteIntent::General,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            RouteIntent::Select => "select",
            RouteIntent::Filter => "filter",
            RouteIntent::Aggregate => "aggregate",
            RouteIntent::Sort => "sort",
            RouteIntent::TopN => "top_n",
            RouteIntent::BottomN => "bottom_n",
            RouteIntent::Variance => "variance",
            RouteIntent::Trend => "trend",
            RouteIntent::Contribution => "contribution",
            RouteIntent::General => "general",
        }
    }

    /// The query-engine intent, or `None` for externally analysed intents.
    pub fn query_intent(&self) -> Option<QueryIntent> {
        match self {
            RouteIntent::Select => Some(QueryIntent::Select),
            RouteIntent::Filter => Some(QueryIntent::Filter),
            RouteIntent::Aggregate => Some(QueryIntent::Aggregate),
            RouteIntent::Sort => Some(QueryIntent::Sort),
            RouteIntent::TopN => Some(QueryIntent::TopN),
            RouteIntent::BottomN => Some(QueryIntent::BottomN),
            RouteIntent::Variance
            | RouteIntent::Trend
            | RouteIntent::Contribution
            | RouteIntent::General => None,
        }
    }

    pub fn is_engine_intent(&self) -> bool {
        self.query_intent().is_some()
    }
}

impl fmt::Display for RouteIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RouteIntent {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .trim_matches(|c| c == '"' || c == '\'' || c == '.')
            .to_lowercase()
            .replace([' ', '-'], "_");
        RouteIntent::ALL
            .iter()
            .copied()
            .find(|i| i.label() == normalized)
            .ok_or_else(|| NlqError::RoutingAmbiguous(format!("unknown intent label '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Rules,
    Llm,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub intent: RouteIntent,
    pub confidence: f64,
    pub source: RouteSource,
    /// The literal text the winning rule matched
    pub matched: Option<String>,
}

impl RouteDecision {
    fn fallback() -> Self {
        Self {
            intent: RouteIntent::General,
            confidence: DEFAULT_CONFIDENCE,
            source: RouteSource::Default,
            matched: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub intent: RouteIntent,
    pub confidence: f64,
    pub literal: String,
}

struct IntentRule {
    intent: RouteIntent,
    tier: u8,
    pattern: Regex,
    confidence: f64,
}

fn rule(intent: RouteIntent, tier: u8, pattern: &str, confidence: f64) -> IntentRule {
    IntentRule {
        intent,
        tier,
        pattern: Regex::new(pattern).unwrap(),
        confidence,
    }
}

lazy_static! {
    static ref RULES: Vec<IntentRule> = vec![
        // Tier 0: external analyses
        rule(
            RouteIntent::Variance,
            0,
            r"\bvariance analysis\b|\b(?:analy[sz]e|explain|breakdown of|why)\b.*\b(?:variance|deviation)s?\b|\bbudget\s+(?:vs\.?|versus)\s+actuals?\b|\bactuals?\s+(?:vs\.?|versus)\s+budget\b",
            0.85,
        ),
        rule(
            RouteIntent::Trend,
            0,
            r"\btrends?\b|\bover time\b|\bmonth over month\b|\byear over year\b|\btrajectory\b|\bgrowth rate\b",
            0.85,
        ),
        rule(
            RouteIntent::Contribution,
            0,
            r"\bcontribut(?:ion|ions|es|ors?)\b|\bpareto\b|\bshare of\b|\b80/20\b|\bpercentage of total\b",
            0.85,
        ),
        // Tier 1: ranking
        rule(RouteIntent::TopN, 1, r"\b(?:top|best|largest|biggest)\s+\d+\b", 0.9),
        rule(RouteIntent::BottomN, 1, r"\b(?:bottom|worst|smallest)\s+\d+\b", 0.9),
        rule(RouteIntent::TopN, 1, r"\btop\b", 0.75),
        rule(RouteIntent::BottomN, 1, r"\bbottom\b", 0.75),
        // Tier 2: aggregation and explicit sorting
        rule(
            RouteIntent::Aggregate,
            2,
            r"\b(?:total|sum|average|avg|mean|count|number of|how many|maximum|minimum|max|min|highest|lowest)\b",
            0.8,
        ),
        rule(
            RouteIntent::Sort,
            2,
            r"\b(?:sort(?:ed)?|order(?:ed)?|rank(?:ed)?)\s+by\b",
            0.8,
        ),
        // Tier 3: filtering
        rule(
            RouteIntent::Filter,
            3,
            r"\b(?:negative|positive)\s+(?:variance|delta)\b|\bactuals?\s+(?:is\s+)?(?:below|under|above|over)\s+(?:the\s+)?(?:budget|plan|target)\b|\bmissed\s+(?:the\s+|their\s+)?(?:budget|plan|target)\b",
            0.8,
        ),
        rule(
            RouteIntent::Filter,
            3,
            r"\b(?:greater than|more than|less than|fewer than|higher than|lower than|at least|at most|above|below|over|under|between|equal to|equals|not equal|exceed(?:s|ing)?|contains|containing|starts with|ends with|one of|where|only)\b|[<>=]",
            0.75,
        ),
        // Tier 4: plain listing
        rule(
            RouteIntent::Select,
            4,
            r"^\s*(?:show|list|display|give|get|fetch|find|what|which)\b",
            0.5,
        ),
    ];
}

/// Evaluate the rule tiers without any LLM involvement.
pub fn match_rules(query: &str, schema: &SchemaContext) -> Option<RuleMatch> {
    let lowered = query.to_lowercase();
    let max_tier = RULES.iter().map(|r| r.tier).max().unwrap_or(0);

    for tier in 0..=max_tier {
        let best = RULES
            .iter()
            .filter(|r| r.tier == tier)
            .filter_map(|r| r.pattern.find(&lowered).map(|m| (r, m.as_str().to_string())))
            .fold(None::<(&IntentRule, String)>, |best, (r, literal)| match best {
                Some((b, ref l)) if l.len() >= literal.len() => Some((b, l.clone())),
                _ => Some((r, literal)),
            });

        if let Some((rule, literal)) = best {
            let bonus = if mentions_column(&lowered, schema) {
                COLUMN_BONUS
            } else {
                0.0
            };
            return Some(RuleMatch {
                intent: rule.intent,
                confidence: (rule.confidence + bonus).min(1.0),
                literal,
            });
        }
    }
    None
}

fn mentions_column(lowered: &str, schema: &SchemaContext) -> bool {
    schema.columns.iter().any(|c| {
        let name = c.name.to_lowercase();
        lowered.contains(&name) || lowered.contains(&c.words().join(" "))
    })
}

pub struct IntentRouter {
    llm: Option<Arc<dyn CompletionService>>,
    threshold: f64,
    llm_timeout: Duration,
}

impl IntentRouter {
    pub fn new(
        llm: Option<Arc<dyn CompletionService>>,
        config: &RouterConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            threshold: config.confidence_threshold,
            llm_timeout,
        }
    }

    pub async fn route(&self, query: &str, schema: &SchemaContext) -> RouteDecision {
        self.route_with_deadline(query, schema, None).await
    }

    /// Route a question. The optional deadline bounds the LLM fallback.
    pub async fn route_with_deadline(
        &self,
        query: &str,
        schema: &SchemaContext,
        deadline: Option<Instant>,
    ) -> RouteDecision {
        let rule_match = match_rules(query, schema);
        if let Some(m) = &rule_match {
            if m.confidence >= self.threshold {
                info!(
                    "🧭 Routed to '{}' by rule '{}' (confidence {:.2})",
                    m.intent, m.literal, m.confidence
                );
                return RouteDecision {
                    intent: m.intent,
                    confidence: m.confidence,
                    source: RouteSource::Rules,
                    matched: Some(m.literal.clone()),
                };
            }
        }

        match self.classify_with_llm(query, schema, deadline).await {
            Ok(intent) => {
                info!("🧭 Routed to '{}' by LLM classification", intent);
                RouteDecision {
                    intent,
                    confidence: LLM_CONFIDENCE,
                    source: RouteSource::Llm,
                    matched: rule_match.map(|m| m.literal),
                }
            }
            Err(e) => {
                debug!("LLM routing unavailable: {}", e);
                info!("🧭 No confident route, defaulting to 'general'");
                RouteDecision {
                    matched: rule_match.map(|m| m.literal),
                    ..RouteDecision::fallback()
                }
            }
        }
    }

    async fn classify_with_llm(
        &self,
        query: &str,
        schema: &SchemaContext,
        deadline: Option<Instant>,
    ) -> crate::error::Result<RouteIntent> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| NlqError::LlmUnavailable("no LLM configured".to_string()))?;

        let budget = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.llm_timeout),
            None => self.llm_timeout,
        };
        if budget.is_zero() {
            return Err(NlqError::LlmUnavailable("deadline already passed".to_string()));
        }

        let labels: Vec<&str> = RouteIntent::ALL.iter().map(|i| i.label()).collect();
        let prompt = format!(
            r#"Classify the user's question about the table "{}" into exactly one intent.

Allowed intents: {}

Columns:
{}

Question: "{}"

Return JSON in this exact format:
{{"intent": "filter"}}

Only return the JSON, no other text."#,
            schema.alias,
            labels.join(", "),
            schema.describe(),
            query
        );

        let response = tokio::time::timeout(budget, llm.complete(&prompt))
            .await
            .map_err(|_| NlqError::LlmUnavailable("classification timed out".to_string()))??;

        parse_intent_label(&response)
    }
}

/// Accept `{"intent": "x"}` or a bare label.
pub fn parse_intent_label(response: &str) -> crate::error::Result<RouteIntent> {
    if let Some(json) = extract_json_object(response) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            if let Some(label) = value.get("intent").and_then(|v| v.as_str()) {
                return label.parse();
            }
        }
    }
    let label = strip_code_fences(response);
    label.parse().map_err(|e| {
        warn!("LLM returned an unusable intent label");
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::schema::{ColumnDescriptor, ColumnType};
    use async_trait::async_trait;

    struct FixedReply(&'static str);

    #[async_trait]
    impl CompletionService for FixedReply {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Hanging;

    #[async_trait]
    impl CompletionService for Hanging {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("filter".to_string())
        }
    }

    fn schema() -> SchemaContext {
        SchemaContext::new(
            "financial_data",
            vec![
                ColumnDescriptor::new("region", ColumnType::Categorical),
                ColumnDescriptor::new("actual_sales", ColumnType::Numeric),
            ],
        )
    }

    fn router(llm: Option<Arc<dyn CompletionService>>) -> IntentRouter {
        IntentRouter::new(llm, &RouterConfig::default(), Duration::from_secs(30))
    }

    #[test]
    fn test_rule_tiers() {
        let s = schema();
        assert_eq!(
            match_rules("Top 5 regions by actual sales", &s).unwrap().intent,
            RouteIntent::TopN
        );
        assert_eq!(
            match_rules("Show me sales greater than 60000", &s).unwrap().intent,
            RouteIntent::Filter
        );
        assert_eq!(
            match_rules("Average discount percentage by product line", &s)
                .unwrap()
                .intent,
            RouteIntent::Aggregate
        );
        assert_eq!(
            match_rules("show the sales trend", &s).unwrap().intent,
            RouteIntent::Trend
        );
        assert!(match_rules("hello there", &s).is_none());
    }

    #[test]
    fn test_longest_literal_wins_within_tier() {
        let m = match_rules("list regions sorted by total", &schema()).unwrap();
        assert_eq!(m.intent, RouteIntent::Sort);
        assert_eq!(m.literal, "sorted by");
    }

    #[test]
    fn test_column_bonus() {
        let with_column = match_rules("top 3 actual sales", &schema()).unwrap();
        let without = match_rules("top 3 widgets", &schema()).unwrap();
        assert!((with_column.confidence - 1.0).abs() < 1e-9);
        assert!((without.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_fallback_and_default() {
        let decision = router(Some(Arc::new(FixedReply("```json\n{\"intent\": \"select\"}\n```"))))
            .route("hello there", &schema())
            .await;
        assert_eq!(decision.intent, RouteIntent::Select);
        assert_eq!(decision.source, RouteSource::Llm);

        let decision = router(Some(Arc::new(FixedReply("something odd"))))
            .route("hello there", &schema())
            .await;
        assert_eq!(decision.intent, RouteIntent::General);
        assert_eq!(decision.source, RouteSource::Default);

        let decision = router(None).route("hello there", &schema()).await;
        assert_eq!(decision.intent, RouteIntent::General);
    }

    #[tokio::test]
    async fn test_deadline_cancels_llm() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let decision = router(Some(Arc::new(Hanging)))
            .route_with_deadline("hello there", &schema(), Some(deadline))
            .await;
        assert_eq!(decision.intent, RouteIntent::General);
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!(parse_intent_label("top n").unwrap(), RouteIntent::TopN);
        assert_eq!(parse_intent_label("\"bottom_n\"").unwrap(), RouteIntent::BottomN);
        assert!(parse_intent_label("pivot").is_err());
    }
}
