//! Financial idioms recognised before the general condition parser.
//!
//! Each entry is a `(pattern, builder)` pair evaluated in priority order
//! against the lowercased word stream. A builder may decline (return `None`)
//! when the schema lacks the columns the idiom needs, in which case the words
//! are left for the general parser.

use crate::query::{Condition, ConditionValue, Operator};
use crate::schema::{ColumnDescriptor, SchemaContext};
use crate::text::{same_word, QueryText};
use crate::vocabulary::Vocabulary;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::debug;

pub struct IdiomContext<'a> {
    pub schema: &'a SchemaContext,
    pub vocabulary: &'a Vocabulary,
}

/// Conditions produced by one idiom and the word span `[start, end)` it used.
#[derive(Debug, Clone, PartialEq)]
pub struct IdiomMatch {
    pub name: &'static str,
    pub conditions: Vec<Condition>,
    pub start: usize,
    pub end: usize,
}

type Builder = fn(&Captures, &IdiomContext) -> Option<Vec<Condition>>;

pub struct SpecialCase {
    pub name: &'static str,
    pattern: Regex,
    build: Builder,
}

lazy_static! {
    static ref SPECIAL_CASES: Vec<SpecialCase> = vec![
        SpecialCase {
            name: "actual_vs_budget",
            pattern: Regex::new(
                r"\b(?:actual|actuals)(?:\s+(\w+))?\s+(?:is\s+|are\s+|was\s+|were\s+|came\s+in\s+)?(below|under|less than|lower than|short of|above|over|more than|greater than|higher than|exceeding|exceeded|exceeds|beat|beats)\s+(?:the\s+)?(?:budget|plan|planned|target|forecast)\b"
            )
            .unwrap(),
            build: build_actual_vs_budget,
        },
        SpecialCase {
            name: "signed_variance",
            pattern: Regex::new(
                r"\b(negative|unfavourable|unfavorable|adverse|positive|favourable|favorable)\s+(?:variance|variances|delta|difference|gap)\b"
            )
            .unwrap(),
            build: build_signed_variance,
        },
        SpecialCase {
            name: "missed_target",
            pattern: Regex::new(
                r"\b(missed|fell short of|falls short of|below|under|beat|beats|exceeded|exceeds|above|over)\s+(?:the\s+|their\s+|its\s+)?(?:budget|plan|target|forecast)\b"
            )
            .unwrap(),
            build: build_missed_target,
        },
    ];
}

fn comparator(word: &str) -> Operator {
    match word {
        "below" | "under" | "less than" | "lower than" | "short of" | "missed" | "fell short of"
        | "falls short of" => Operator::Lt,
        _ => Operator::Gt,
    }
}

fn build_actual_vs_budget(caps: &Captures, ctx: &IdiomContext) -> Option<Vec<Condition>> {
    let hint = caps.get(1).map(|m| m.as_str());
    let op = comparator(caps.get(2)?.as_str());
    let actual = actual_column(ctx, hint)?;
    let budget = budget_column(ctx, hint)?;
    Some(vec![Condition::new(
        actual.name.clone(),
        op,
        ConditionValue::Column(budget.name.clone()),
    )])
}

fn build_signed_variance(caps: &Captures, ctx: &IdiomContext) -> Option<Vec<Condition>> {
    let negative = matches!(
        caps.get(1)?.as_str(),
        "negative" | "unfavourable" | "unfavorable" | "adverse"
    );
    let op = if negative { Operator::Lt } else { Operator::Gt };

    if let Some(variance) = variance_column(ctx) {
        return Some(vec![Condition::new(
            variance.name.clone(),
            op,
            ConditionValue::Number(0.0),
        )]);
    }
    // No stored variance: compare the two sides directly.
    let actual = actual_column(ctx, None)?;
    let budget = budget_column(ctx, None)?;
    Some(vec![Condition::new(
        actual.name.clone(),
        op,
        ConditionValue::Column(budget.name.clone()),
    )])
}

fn build_missed_target(caps: &Captures, ctx: &IdiomContext) -> Option<Vec<Condition>> {
    let op = comparator(caps.get(1)?.as_str());
    let actual = actual_column(ctx, None)?;
    let budget = budget_column(ctx, None)?;
    Some(vec![Condition::new(
        actual.name.clone(),
        op,
        ConditionValue::Column(budget.name.clone()),
    )])
}

fn side_column<'a>(
    ctx: &IdiomContext<'a>,
    hint: Option<&str>,
    is_side: impl Fn(&str) -> bool,
) -> Option<&'a ColumnDescriptor> {
    let candidates: Vec<&ColumnDescriptor> = ctx
        .schema
        .numeric_columns()
        .filter(|c| c.words().iter().any(|w| is_side(w)))
        .collect();
    if let Some(hint) = hint {
        let hinted = candidates.iter().copied().find(|c| {
            c.words()
                .iter()
                .any(|w| same_word(w, hint) || ctx.vocabulary.are_synonyms(w, hint))
        });
        if hinted.is_some() {
            return hinted;
        }
    }
    candidates.into_iter().next()
}

fn actual_column<'a>(ctx: &IdiomContext<'a>, hint: Option<&str>) -> Option<&'a ColumnDescriptor> {
    side_column(ctx, hint, |w| ctx.vocabulary.is_actual_term(w))
}

fn budget_column<'a>(ctx: &IdiomContext<'a>, hint: Option<&str>) -> Option<&'a ColumnDescriptor> {
    side_column(ctx, hint, |w| ctx.vocabulary.is_budget_term(w))
}

fn variance_column<'a>(ctx: &IdiomContext<'a>) -> Option<&'a ColumnDescriptor> {
    side_column(ctx, None, |w| ctx.vocabulary.is_variance_term(w))
}

/// Run every idiom in priority order; later idioms may not overlap earlier
/// matches.
pub fn match_special_cases(text: &QueryText, ctx: &IdiomContext) -> Vec<IdiomMatch> {
    let mut joined = String::new();
    let mut offsets = Vec::with_capacity(text.len());
    for word in &text.words {
        if !joined.is_empty() {
            joined.push(' ');
        }
        offsets.push(joined.len());
        joined.push_str(&word.text);
    }

    let word_at = |offset: usize| -> usize {
        offsets
            .iter()
            .rposition(|&start| start <= offset)
            .unwrap_or(0)
    };

    let mut matches: Vec<IdiomMatch> = Vec::new();
    for case in SPECIAL_CASES.iter() {
        for caps in case.pattern.captures_iter(&joined) {
            let Some(whole) = caps.get(0) else { continue };
            let start = word_at(whole.start());
            let end = word_at(whole.end().saturating_sub(1)) + 1;
            if matches.iter().any(|m| start < m.end && m.start < end) {
                continue;
            }
            if let Some(conditions) = (case.build)(&caps, ctx) {
                debug!("Idiom '{}' matched words {}..{}", case.name, start, end);
                matches.push(IdiomMatch {
                    name: case.name,
                    conditions,
                    start,
                    end,
                });
            }
        }
    }
    matches.sort_by_key(|m| m.start);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn schema(with_variance: bool) -> SchemaContext {
        let mut columns = vec![
            ColumnDescriptor::new("region", ColumnType::Categorical),
            ColumnDescriptor::new("budget_sales", ColumnType::Numeric),
            ColumnDescriptor::new("actual_sales", ColumnType::Numeric),
            ColumnDescriptor::new("budget_cost", ColumnType::Numeric),
            ColumnDescriptor::new("actual_cost", ColumnType::Numeric),
        ];
        if with_variance {
            columns.push(ColumnDescriptor::new("sales_variance", ColumnType::Numeric));
        }
        SchemaContext::new("financial_data", columns)
    }

    fn run(query: &str, with_variance: bool) -> Vec<IdiomMatch> {
        let schema = schema(with_variance);
        let vocabulary = Vocabulary::default();
        let ctx = IdiomContext {
            schema: &schema,
            vocabulary: &vocabulary,
        };
        match_special_cases(&QueryText::new(query), &ctx)
    }

    #[test]
    fn test_actual_below_budget() {
        let found = run("regions where actual is below budget", false);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].conditions[0],
            Condition::new(
                "actual_sales",
                Operator::Lt,
                ConditionValue::Column("budget_sales".to_string())
            )
        );
        assert_eq!((found[0].start, found[0].end), (2, 6));
    }

    #[test]
    fn test_hint_picks_matching_measure() {
        let found = run("actual cost over budget", false);
        assert_eq!(found[0].conditions[0].column, "actual_cost");
        assert_eq!(found[0].conditions[0].operator, Operator::Gt);
        assert_eq!(
            found[0].conditions[0].value,
            ConditionValue::Column("budget_cost".to_string())
        );
    }

    #[test]
    fn test_negative_variance() {
        let found = run("show negative variance rows", true);
        assert_eq!(
            found[0].conditions[0],
            Condition::new("sales_variance", Operator::Lt, ConditionValue::Number(0.0))
        );

        let found = run("show negative variance rows", false);
        assert_eq!(found[0].conditions[0].column, "actual_sales");
        assert_eq!(
            found[0].conditions[0].value,
            ConditionValue::Column("budget_sales".to_string())
        );
    }

    #[test]
    fn test_missed_target_and_no_match() {
        let found = run("which regions missed their target", false);
        assert_eq!(found[0].name, "missed_target");
        assert_eq!(found[0].conditions[0].operator, Operator::Lt);

        assert!(run("sales greater than 100", false).is_empty());
    }
}
