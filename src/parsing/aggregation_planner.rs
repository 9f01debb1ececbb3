//! Aggregation Planner - aggregations, grouping, ordering and limits.

use super::column_resolver::{ColumnMatch, ColumnResolver, Resolution};
use super::condition_parser::ConditionParser;
use crate::query::{
    AggregateFunc, Aggregation, Condition, Operator, OrderBy, SortDirection, DEFAULT_RANK_LIMIT,
    MAX_LIMIT, MIN_LIMIT,
};
use crate::schema::{ColumnType, SchemaContext};
use crate::text::QueryText;
use crate::vocabulary::Vocabulary;
use std::sync::Arc;
use tracing::debug;

const AGGREGATE_VERBS: &[(&[&str], AggregateFunc)] = &[
    (&["number", "of"], AggregateFunc::Count),
    (&["how", "many"], AggregateFunc::Count),
    (&["count", "of"], AggregateFunc::Count),
    (&["count"], AggregateFunc::Count),
    (&["sum", "of"], AggregateFunc::Sum),
    (&["total"], AggregateFunc::Sum),
    (&["sum"], AggregateFunc::Sum),
    (&["average"], AggregateFunc::Avg),
    (&["avg"], AggregateFunc::Avg),
    (&["mean"], AggregateFunc::Avg),
    (&["maximum"], AggregateFunc::Max),
    (&["max"], AggregateFunc::Max),
    (&["highest"], AggregateFunc::Max),
    (&["minimum"], AggregateFunc::Min),
    (&["min"], AggregateFunc::Min),
    (&["lowest"], AggregateFunc::Min),
];

const GROUP_WORDS: &[&str] = &["by", "per", "each", "across"];
const SORT_WORDS: &[&str] = &["sort", "sorted", "order", "ordered", "rank", "ranked"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    pub aggregations: Vec<Aggregation>,
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    /// Set for "top N" (DESC) and "bottom N" (ASC)
    pub ranking: Option<SortDirection>,
    /// "sorted by"/"ordered by" appeared
    pub explicit_sort: bool,
}

#[derive(Debug, Clone)]
pub struct AggregationPlanner {
    resolver: ColumnResolver,
}

struct Ranking {
    direction: SortDirection,
    limit: u32,
    metric: Option<String>,
}

impl AggregationPlanner {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            resolver: ColumnResolver::new(vocabulary),
        }
    }

    pub fn with_resolver(resolver: ColumnResolver) -> Self {
        Self { resolver }
    }

    /// Plan the aggregation side of a free-text question.
    pub fn plan(&self, query: &str, schema: &SchemaContext) -> AggregationPlan {
        let text = QueryText::new(query);
        let resolution = self.resolver.resolve_text(&text, schema);
        let conditions = ConditionParser::with_resolver(self.resolver.clone())
            .parse_resolved(&text, &resolution, schema)
            .conditions;
        self.plan_resolved(&text, &resolution, &conditions)
    }

    pub fn plan_resolved(
        &self,
        text: &QueryText,
        resolution: &Resolution,
        conditions: &[Condition],
    ) -> AggregationPlan {
        let mut plan = AggregationPlan::default();
        let mut ranking = detect_ranking(text);

        // Aggregation verbs
        let mut i = 0;
        while i < text.len() {
            if let Some(m) = resolution.match_covering(i) {
                i = m.end;
                continue;
            }
            let Some((phrase, func)) = verb_at(text, i) else {
                i += 1;
                continue;
            };
            let end = i + phrase.len();
            let ranking_word = matches!(func, AggregateFunc::Max | AggregateFunc::Min)
                && matches!(text.text(i), Some("highest") | Some("lowest"));
            if ranking.is_some() && ranking_word {
                i = end;
                continue;
            }
            if let Some(aggregation) = bind_aggregation(func, i, end, resolution, text) {
                push_unique(&mut plan.aggregations, aggregation);
            }
            i = end;
        }

        // "by <dimension>", "sorted by <column>"
        for i in 0..text.len() {
            let Some(word) = text.text(i) else { continue };
            if resolution.match_covering(i).is_some() {
                continue;
            }

            if word == "by" && i > 0 && text.text(i - 1).map_or(false, |w| SORT_WORDS.contains(&w))
            {
                let target = skip_articles(text, i + 1);
                if let Some(m) = resolution.match_starting_at(target) {
                    let direction = sort_direction(text, m.end, text.text(i - 1));
                    let column = plan
                        .aggregations
                        .iter()
                        .find(|a| a.column.as_deref() == Some(m.column.as_str()))
                        .map(|a| a.alias.clone())
                        .unwrap_or_else(|| m.column.clone());
                    plan.order_by.push(OrderBy::new(column, direction));
                    plan.explicit_sort = true;
                }
                continue;
            }

            if GROUP_WORDS.contains(&word) {
                let target = skip_articles(text, i + 1);
                let Some(m) = resolution.match_starting_at(target) else { continue };
                if is_dimension(m) {
                    if !plan.group_by.contains(&m.column) {
                        plan.group_by.push(m.column.clone());
                    }
                } else if let Some(r) = ranking.as_mut() {
                    if r.metric.is_none() && m.column_type == ColumnType::Numeric {
                        r.metric = Some(m.column.clone());
                    }
                }
            }
        }

        let pinned: Vec<&str> = conditions
            .iter()
            .filter(|c| c.operator == Operator::Eq)
            .map(|c| c.column.as_str())
            .collect();

        if let Some(r) = ranking.take() {
            apply_ranking(&mut plan, r, resolution, &pinned);
        } else if !plan.aggregations.is_empty() && plan.group_by.is_empty() {
            let aggregated: Vec<&str> = plan
                .aggregations
                .iter()
                .filter_map(|a| a.column.as_deref())
                .collect();
            if let Some(m) = resolution.matches.iter().find(|m| {
                m.column_type == ColumnType::Categorical
                    && !aggregated.contains(&m.column.as_str())
                    && !pinned.contains(&m.column.as_str())
            }) {
                debug!("Inferred group-by column '{}'", m.column);
                plan.group_by.push(m.column.clone());
            }
        }

        if plan.limit.is_none() {
            plan.limit = explicit_limit(text);
        }

        // Grouped output has no natural order; sort by the group keys.
        if !plan.aggregations.is_empty() && !plan.group_by.is_empty() && plan.order_by.is_empty()
        {
            plan.order_by = plan
                .group_by
                .iter()
                .map(|g| OrderBy::new(g.clone(), SortDirection::Asc))
                .collect();
        }

        plan
    }
}

fn apply_ranking(
    plan: &mut AggregationPlan,
    ranking: Ranking,
    resolution: &Resolution,
    pinned: &[&str],
) {
    let metric = ranking
        .metric
        .or_else(|| plan.aggregations.iter().find_map(|a| a.column.clone()))
        .or_else(|| {
            resolution
                .matches
                .iter()
                .find(|m| m.column_type == ColumnType::Numeric)
                .map(|m| m.column.clone())
        });

    let dimension = plan.group_by.first().cloned().or_else(|| {
        resolution
            .matches
            .iter()
            .find(|m| {
                is_dimension(m)
                    && !pinned.contains(&m.column.as_str())
                    && Some(&m.column) != metric.as_ref()
            })
            .map(|m| m.column.clone())
    });

    plan.ranking = Some(ranking.direction);
    plan.limit = Some(ranking.limit);

    match dimension {
        Some(dimension) => {
            let existing = plan
                .aggregations
                .iter()
                .find(|a| a.column.is_some() && a.column == metric)
                .cloned();
            let aggregation = existing.unwrap_or_else(|| match &metric {
                Some(column) => Aggregation::new(AggregateFunc::Sum, Some(column.clone())),
                None => Aggregation::new(AggregateFunc::Count, None),
            });
            push_unique(&mut plan.aggregations, aggregation.clone());
            if plan.group_by.is_empty() {
                plan.group_by.push(dimension);
            }
            plan.order_by = vec![OrderBy::new(aggregation.alias, ranking.direction)];
        }
        None => {
            if let Some(metric) = metric {
                let target = plan
                    .aggregations
                    .iter()
                    .find(|a| a.column.as_deref() == Some(metric.as_str()))
                    .map(|a| a.alias.clone())
                    .unwrap_or(metric);
                plan.order_by = vec![OrderBy::new(target, ranking.direction)];
            }
        }
    }
}

fn detect_ranking(text: &QueryText) -> Option<Ranking> {
    for i in 0..text.len() {
        let word = text.text(i)?;
        let number = text.words.get(i + 1).and_then(|w| w.number());
        let direction = match word {
            "top" => SortDirection::Desc,
            "bottom" => SortDirection::Asc,
            "best" | "largest" | "biggest" if number.is_some() => SortDirection::Desc,
            "worst" | "smallest" if number.is_some() => SortDirection::Asc,
            _ => continue,
        };
        let limit = number
            .filter(|n| !n.percent)
            .map(|n| clamp_limit(n.value))
            .unwrap_or(DEFAULT_RANK_LIMIT);
        return Some(Ranking {
            direction,
            limit,
            metric: None,
        });
    }
    None
}

/// Round and clamp a requested row count to `[1, 1000]`.
pub fn clamp_limit(value: f64) -> u32 {
    if !value.is_finite() {
        return DEFAULT_RANK_LIMIT;
    }
    value.round().clamp(MIN_LIMIT as f64, MAX_LIMIT as f64) as u32
}

fn explicit_limit(text: &QueryText) -> Option<u32> {
    (0..text.len()).find_map(|i| match text.text(i) {
        Some("limit") | Some("first") => text
            .words
            .get(i + 1)
            .and_then(|w| w.number())
            .map(|n| clamp_limit(n.value)),
        _ => None,
    })
}

fn verb_at(text: &QueryText, idx: usize) -> Option<(&'static [&'static str], AggregateFunc)> {
    AGGREGATE_VERBS
        .iter()
        .filter(|(phrase, _)| text.matches_at(idx, phrase))
        .max_by_key(|(phrase, _)| phrase.len())
        .map(|(phrase, func)| (*phrase, *func))
}

/// Bind a verb spanning `[start, end)` to the nearest suitable column,
/// preferring columns after the verb.
fn bind_aggregation(
    func: AggregateFunc,
    start: usize,
    end: usize,
    resolution: &Resolution,
    text: &QueryText,
) -> Option<Aggregation> {
    if func == AggregateFunc::Count {
        let target = skip_articles(text, end);
        return Some(match resolution.match_starting_at(target) {
            Some(m) => Aggregation::new(func, Some(m.column.clone())),
            None => Aggregation::new(func, None),
        });
    }

    resolution
        .matches
        .iter()
        .filter(|m| m.column_type == ColumnType::Numeric)
        .min_by_key(|m| {
            if m.start >= end {
                2 * (m.start - end)
            } else {
                2 * (start.saturating_sub(m.end)) + 1
            }
        })
        .map(|m| Aggregation::new(func, Some(m.column.clone())))
}

fn sort_direction(text: &QueryText, from: usize, verb: Option<&str>) -> SortDirection {
    for idx in from..(from + 3).min(text.len()) {
        match text.text(idx) {
            Some("asc") | Some("ascending") | Some("lowest") | Some("smallest") => {
                return SortDirection::Asc
            }
            Some("desc") | Some("descending") | Some("highest") | Some("largest") => {
                return SortDirection::Desc
            }
            _ => {}
        }
    }
    match verb {
        Some("rank") | Some("ranked") => SortDirection::Desc,
        _ => SortDirection::Asc,
    }
}

fn is_dimension(m: &ColumnMatch) -> bool {
    matches!(m.column_type, ColumnType::Categorical | ColumnType::Date)
}

fn push_unique(aggregations: &mut Vec<Aggregation>, aggregation: Aggregation) {
    if !aggregations.iter().any(|a| a.alias == aggregation.alias) {
        aggregations.push(aggregation);
    }
}

fn skip_articles(text: &QueryText, mut idx: usize) -> usize {
    while matches!(text.text(idx), Some("the") | Some("a") | Some("an") | Some("all")) {
        idx += 1;
    }
    idx
}
