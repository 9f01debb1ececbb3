//! Condition Parser - extracts filter predicates from a question.
//!
//! Financial idioms run first (see [`super::special_cases`]); the remaining
//! words are scanned left to right for comparator phrases, symbols and
//! categorical value mentions. Each predicate binds to the nearest column
//! before the comparator, and clauses join on a literal "and"/"or".

use super::column_resolver::{ColumnResolver, Resolution};
use super::special_cases::{match_special_cases, IdiomContext};
use crate::query::{Condition, ConditionValue, Connector, Operator};
use crate::schema::{ColumnDescriptor, ColumnType, SchemaContext};
use crate::text::{is_function_word, QueryText, WordKind};
use crate::vocabulary::Vocabulary;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
enum LikeShape {
    None,
    Contains,
    StartsWith,
    EndsWith,
}

/// Comparator phrase families. Longer phrases win at the same position.
const COMPARATORS: &[(&[&str], Operator, LikeShape)] = &[
    (&["greater", "than", "or", "equal", "to"], Operator::GtEq, LikeShape::None),
    (&["more", "than", "or", "equal", "to"], Operator::GtEq, LikeShape::None),
    (&["less", "than", "or", "equal", "to"], Operator::LtEq, LikeShape::None),
    (&["is", "not", "equal", "to"], Operator::NotEq, LikeShape::None),
    (&["not", "equal", "to"], Operator::NotEq, LikeShape::None),
    (&["no", "less", "than"], Operator::GtEq, LikeShape::None),
    (&["no", "more", "than"], Operator::LtEq, LikeShape::None),
    (&["other", "than"], Operator::NotEq, LikeShape::None),
    (&["is", "not"], Operator::NotEq, LikeShape::None),
    (&["greater", "than"], Operator::Gt, LikeShape::None),
    (&["more", "than"], Operator::Gt, LikeShape::None),
    (&["higher", "than"], Operator::Gt, LikeShape::None),
    (&["larger", "than"], Operator::Gt, LikeShape::None),
    (&["bigger", "than"], Operator::Gt, LikeShape::None),
    (&["less", "than"], Operator::Lt, LikeShape::None),
    (&["fewer", "than"], Operator::Lt, LikeShape::None),
    (&["lower", "than"], Operator::Lt, LikeShape::None),
    (&["smaller", "than"], Operator::Lt, LikeShape::None),
    (&["at", "least"], Operator::GtEq, LikeShape::None),
    (&["at", "most"], Operator::LtEq, LikeShape::None),
    (&["equal", "to"], Operator::Eq, LikeShape::None),
    (&["starts", "with"], Operator::Like, LikeShape::StartsWith),
    (&["starting", "with"], Operator::Like, LikeShape::StartsWith),
    (&["ends", "with"], Operator::Like, LikeShape::EndsWith),
    (&["ending", "with"], Operator::Like, LikeShape::EndsWith),
    (&["one", "of"], Operator::In, LikeShape::None),
    (&["above"], Operator::Gt, LikeShape::None),
    (&["over"], Operator::Gt, LikeShape::None),
    (&["exceeds"], Operator::Gt, LikeShape::None),
    (&["exceeding"], Operator::Gt, LikeShape::None),
    (&["exceed"], Operator::Gt, LikeShape::None),
    (&["below"], Operator::Lt, LikeShape::None),
    (&["under"], Operator::Lt, LikeShape::None),
    (&["equals"], Operator::Eq, LikeShape::None),
    (&["is"], Operator::Eq, LikeShape::None),
    (&["except"], Operator::NotEq, LikeShape::None),
    (&["excluding"], Operator::NotEq, LikeShape::None),
    (&["contains"], Operator::Like, LikeShape::Contains),
    (&["containing"], Operator::Like, LikeShape::Contains),
    (&["like"], Operator::Like, LikeShape::Contains),
    (&["between"], Operator::Between, LikeShape::None),
];

const PERCENT_WORDS: &[&str] = &["percent", "pct", "percentage"];

/// Output of a full parse, with bookkeeping the strategies need.
#[derive(Debug, Clone, Default)]
pub struct ParsedConditions {
    pub conditions: Vec<Condition>,
    /// A comparator phrase, symbol or idiom produced at least one condition
    pub explicit_operator: bool,
    /// Word indices consumed by conditions
    pub consumed: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct ConditionParser {
    resolver: ColumnResolver,
}

struct Operand {
    value: ConditionValue,
    end: usize,
    /// Set when the operand names a value of a different column than the subject
    column_override: Option<String>,
}

impl ConditionParser {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            resolver: ColumnResolver::new(vocabulary),
        }
    }

    pub fn with_resolver(resolver: ColumnResolver) -> Self {
        Self { resolver }
    }

    /// Parse the conditions of a free-text question.
    pub fn parse(&self, query: &str, schema: &SchemaContext) -> Vec<Condition> {
        let text = QueryText::new(query);
        let resolution = self.resolver.resolve_text(&text, schema);
        self.parse_resolved(&text, &resolution, schema).conditions
    }

    pub fn parse_resolved(
        &self,
        text: &QueryText,
        resolution: &Resolution,
        schema: &SchemaContext,
    ) -> ParsedConditions {
        let mut parsed = ParsedConditions::default();
        let ctx = IdiomContext {
            schema,
            vocabulary: self.resolver.vocabulary(),
        };

        // (first word index, condition) so idioms and general clauses keep
        // sentence order.
        let mut found: Vec<(usize, Condition)> = Vec::new();
        for idiom in match_special_cases(text, &ctx) {
            for condition in idiom.conditions {
                found.push((idiom.start, condition));
            }
            parsed.consumed.extend(idiom.start..idiom.end);
            parsed.explicit_operator = true;
        }

        let mut pending = Connector::And;
        let mut i = 0;
        while i < text.len() {
            if parsed.consumed.contains(&i) {
                i += 1;
                continue;
            }
            if let Some(m) = resolution.match_covering(i) {
                i = m.end;
                continue;
            }

            let word = &text.words[i];
            match word.text.as_str() {
                "and" => {
                    pending = Connector::And;
                    i += 1;
                    continue;
                }
                "or" => {
                    pending = Connector::Or;
                    i += 1;
                    continue;
                }
                _ => {}
            }

            let comparator = if word.kind == WordKind::Symbol {
                word.text
                    .parse::<Operator>()
                    .ok()
                    .map(|op| (op, 1, LikeShape::None))
            } else {
                comparator_at(text, i)
            };

            if let Some((op, len, shape)) = comparator {
                if let Some((condition, end)) =
                    self.clause(text, resolution, schema, i, op, len, shape)
                {
                    debug!("Condition parsed: {}", condition);
                    found.push((i, condition.with_connector(pending)));
                    parsed.consumed.extend(i..end);
                    parsed.explicit_operator = true;
                    pending = Connector::And;
                    i = end;
                    continue;
                }
                i += 1;
                continue;
            }

            if let Some(mention) = resolution.value_starting_at(i) {
                let condition = Condition::new(
                    mention.column.clone(),
                    Operator::Eq,
                    ConditionValue::Text(mention.value.clone()),
                )
                .with_connector(pending);
                found.push((i, condition));
                parsed.consumed.extend(mention.start..mention.end);
                pending = Connector::And;
                i = mention.end;
                continue;
            }

            i += 1;
        }

        found.sort_by_key(|(idx, _)| *idx);
        parsed.conditions = dedup_last(found.into_iter().map(|(_, c)| c).collect());
        parsed
    }

    /// Build one `column op value` clause around the comparator at `idx`.
    #[allow(clippy::too_many_arguments)]
    fn clause(
        &self,
        text: &QueryText,
        resolution: &Resolution,
        schema: &SchemaContext,
        idx: usize,
        op: Operator,
        len: usize,
        shape: LikeShape,
    ) -> Option<(Condition, usize)> {
        let rhs = skip_articles(text, idx + len);

        let (subject, operand) = match resolution.last_match_before(idx) {
            Some(m) => {
                let subject = schema.column(&m.column)?;
                (subject, self.operand(text, resolution, schema, subject, op, shape, rhs)?)
            }
            None => {
                // "over 100 units": the column follows the value.
                let after = resolution.first_match_from(rhs)?;
                let subject = schema.column(&after.column)?;
                let operand = self.operand(text, resolution, schema, subject, op, shape, rhs)?;
                if operand.end != after.start {
                    return None;
                }
                let end = after.end;
                (
                    subject,
                    Operand {
                        end,
                        ..operand
                    },
                )
            }
        };

        let column = operand
            .column_override
            .clone()
            .unwrap_or_else(|| subject.name.clone());
        if let ConditionValue::Column(other) = &operand.value {
            if other == &column {
                return None;
            }
        }
        Some((Condition::new(column, op, operand.value), operand.end))
    }

    #[allow(clippy::too_many_arguments)]
    fn operand(
        &self,
        text: &QueryText,
        resolution: &Resolution,
        schema: &SchemaContext,
        subject: &ColumnDescriptor,
        op: Operator,
        shape: LikeShape,
        idx: usize,
    ) -> Option<Operand> {
        match op {
            Operator::Between => {
                let low = scalar(text, resolution, subject, idx)?;
                if text.text(low.end) != Some("and") {
                    return None;
                }
                let high = scalar(text, resolution, subject, low.end + 1)?;
                Some(Operand {
                    value: ConditionValue::Range(Box::new(low.value), Box::new(high.value)),
                    end: high.end,
                    column_override: None,
                })
            }
            Operator::In => {
                let mut items = Vec::new();
                let mut column_override = None;
                let mut pos = idx;
                let mut end = idx;
                while let Some(item) = scalar(text, resolution, subject, pos) {
                    if column_override.is_none() {
                        column_override = item.column_override.clone();
                    }
                    items.push(item.value);
                    end = item.end;
                    pos = item.end;
                    if matches!(text.text(pos), Some("and") | Some("or")) {
                        pos += 1;
                    }
                }
                if items.is_empty() {
                    return None;
                }
                Some(Operand {
                    value: ConditionValue::List(items),
                    end,
                    column_override,
                })
            }
            Operator::Like => {
                let word = text.words.get(idx)?;
                let bare_function_word =
                    word.kind != WordKind::Quoted && is_function_word(&word.text);
                if word.kind == WordKind::Symbol || bare_function_word {
                    return None;
                }
                let raw = word.raw.clone();
                let pattern = match shape {
                    LikeShape::StartsWith => format!("{}%", raw),
                    LikeShape::EndsWith => format!("%{}", raw),
                    LikeShape::Contains | LikeShape::None if raw.contains('%') => raw,
                    LikeShape::Contains | LikeShape::None => format!("%{}%", raw),
                };
                Some(Operand {
                    value: ConditionValue::Text(pattern),
                    end: idx + 1,
                    column_override: None,
                })
            }
            _ => {
                if let Some(m) = resolution.match_starting_at(idx) {
                    let other = schema.column(&m.column)?;
                    return Some(Operand {
                        value: ConditionValue::Column(other.name.clone()),
                        end: m.end,
                        column_override: None,
                    });
                }
                scalar(text, resolution, subject, idx)
            }
        }
    }
}

/// A number, quoted string, sample value or bare word (for categorical
/// subjects) at `idx`.
fn scalar(
    text: &QueryText,
    resolution: &Resolution,
    subject: &ColumnDescriptor,
    idx: usize,
) -> Option<Operand> {
    let word = text.words.get(idx)?;

    if let Some(number) = word.number() {
        let mut end = idx + 1;
        let mut percent = number.percent;
        if text
            .text(end)
            .map_or(false, |next| PERCENT_WORDS.contains(&next))
        {
            percent = true;
            end += 1;
        }
        let value = if percent && subject.is_fraction_scaled() {
            number.value / 100.0
        } else {
            number.value
        };
        return Some(Operand {
            value: ConditionValue::Number(value),
            end,
            column_override: None,
        });
    }

    if let Some(mention) = resolution.value_starting_at(idx) {
        let column_override = if mention.column != subject.name {
            Some(mention.column.clone())
        } else {
            None
        };
        return Some(Operand {
            value: ConditionValue::Text(mention.value.clone()),
            end: mention.end,
            column_override,
        });
    }

    let text_subject = matches!(
        subject.inferred_type,
        ColumnType::Categorical | ColumnType::Id | ColumnType::Date
    );
    match word.kind {
        WordKind::Quoted => {
            let value = subject
                .canonical_value(&word.raw)
                .unwrap_or(&word.raw)
                .to_string();
            Some(Operand {
                value: ConditionValue::Text(value),
                end: idx + 1,
                column_override: None,
            })
        }
        WordKind::Word
            if text_subject
                && !is_function_word(&word.text)
                && resolution.match_covering(idx).is_none() =>
        {
            let value = subject
                .canonical_value(&word.raw)
                .unwrap_or(&word.raw)
                .to_string();
            Some(Operand {
                value: ConditionValue::Text(value),
                end: idx + 1,
                column_override: None,
            })
        }
        _ => None,
    }
}

fn comparator_at(text: &QueryText, idx: usize) -> Option<(Operator, usize, LikeShape)> {
    COMPARATORS
        .iter()
        .filter(|(phrase, _, _)| text.matches_at(idx, phrase))
        .max_by_key(|(phrase, _, _)| phrase.len())
        .map(|(phrase, op, shape)| (*op, phrase.len(), *shape))
}

fn skip_articles(text: &QueryText, mut idx: usize) -> usize {
    while matches!(text.text(idx), Some("the") | Some("a") | Some("an") | Some("to")) {
        idx += 1;
    }
    idx
}

/// Keep only the last occurrence of each `(column, operator)` pair.
fn dedup_last(conditions: Vec<Condition>) -> Vec<Condition> {
    let mut seen: BTreeSet<(String, &'static str)> = BTreeSet::new();
    let mut kept: Vec<Condition> = Vec::new();
    for condition in conditions.into_iter().rev() {
        if seen.insert((condition.column.clone(), condition.operator.as_sql())) {
            kept.push(condition);
        }
    }
    kept.reverse();
    if let Some(first) = kept.first_mut() {
        first.connector = Connector::And;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaContext {
        SchemaContext::new(
            "financial_data",
            vec![
                ColumnDescriptor::new("region", ColumnType::Categorical)
                    .with_samples(&["West", "East", "North"]),
                ColumnDescriptor::new("budget_sales", ColumnType::Numeric),
                ColumnDescriptor::new("actual_sales", ColumnType::Numeric),
                ColumnDescriptor::new("discount_pct", ColumnType::Numeric)
                    .with_samples(&["0.1", "0.25", "0.05"]),
                ColumnDescriptor::new("product_name", ColumnType::Categorical),
                ColumnDescriptor::new("channel", ColumnType::Categorical)
                    .with_samples(&["Retail", "Online"])
                    .with_distinct_values(&["Retail", "Online", "Wholesale"]),
            ],
        )
    }

    fn parse(query: &str) -> Vec<Condition> {
        ConditionParser::new(Arc::new(Vocabulary::default())).parse(query, &schema())
    }

    #[test]
    fn test_simple_comparison() {
        assert_eq!(
            parse("Show me sales greater than 60000"),
            vec![Condition::new(
                "budget_sales",
                Operator::Gt,
                ConditionValue::Number(60000.0)
            )]
        );
        assert_eq!(
            parse("actual sales at least $1.5k")[0],
            Condition::new("actual_sales", Operator::GtEq, ConditionValue::Number(1500.0))
        );
    }

    #[test]
    fn test_connectors_and_values() {
        let conditions = parse("actual sales above 100 or region is West");
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].column, "region");
        assert_eq!(conditions[1].operator, Operator::Eq);
        assert_eq!(conditions[1].value, ConditionValue::Text("West".to_string()));
        assert_eq!(conditions[1].connector, Connector::Or);
    }

    #[test]
    fn test_value_mention_without_operator() {
        let conditions = parse("total actual sales in the west");
        assert_eq!(
            conditions,
            vec![Condition::new(
                "region",
                Operator::Eq,
                ConditionValue::Text("West".to_string())
            )]
        );
    }

    #[test]
    fn test_percent_on_fraction_column() {
        let conditions = parse("discount pct above 15%");
        assert_eq!(conditions[0].value, ConditionValue::Number(0.15));
        let conditions = parse("discount pct below 20 percent");
        assert_eq!(conditions[0].value, ConditionValue::Number(0.2));
    }

    #[test]
    fn test_between_in_like() {
        let c = parse("actual sales between 10 and 20");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].operator, Operator::Between);

        let c = parse("region is one of West, East");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].operator, Operator::In);
        assert_eq!(
            c[0].value,
            ConditionValue::List(vec![
                ConditionValue::Text("West".to_string()),
                ConditionValue::Text("East".to_string())
            ])
        );

        let c = parse("product name starts with 'Pro'");
        assert_eq!(c[0].value, ConditionValue::Text("Pro%".to_string()));
    }

    #[test]
    fn test_single_letter_quoted_prefix() {
        let c = parse("product name starting with 'S'");
        assert_eq!(
            c,
            vec![Condition::new(
                "product_name",
                Operator::Like,
                ConditionValue::Text("S%".to_string())
            )]
        );
    }

    #[test]
    fn test_unsampled_value_takes_stored_casing() {
        let c = parse("rows where channel is wholesale");
        assert_eq!(
            c,
            vec![Condition::new(
                "channel",
                Operator::Eq,
                ConditionValue::Text("Wholesale".to_string())
            )]
        );
    }

    #[test]
    fn test_idiom_and_column_comparison() {
        let c = parse("regions where actual below budget");
        assert_eq!(
            c,
            vec![Condition::new(
                "actual_sales",
                Operator::Lt,
                ConditionValue::Column("budget_sales".to_string())
            )]
        );

        let c = parse("actual sales greater than budget sales");
        assert_eq!(
            c[0].value,
            ConditionValue::Column("budget_sales".to_string())
        );
    }

    #[test]
    fn test_dedup_keeps_last() {
        let c = parse("actual sales above 10 and actual sales above 50");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].value, ConditionValue::Number(50.0));
    }

    #[test]
    fn test_symbols() {
        let c = parse("actual_sales >= 5 and discount_pct < 0.2");
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].operator, Operator::GtEq);
        assert_eq!(c[1].operator, Operator::Lt);
        assert_eq!(c[1].connector, Connector::And);
    }
}
