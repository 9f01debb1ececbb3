//! Column Resolver - maps phrases in a question to schema columns.
//!
//! Match order per phrase: exact name, then vocabulary synonym or word
//! containment, then fuzzy edit distance on de-punctuated names. Phrases of up
//! to three consecutive content words are tried longest-first. Words that name
//! a categorical sample value ("West") are recorded as value mentions instead.

use crate::error::NlqError;
use crate::schema::{depunctuate, ColumnDescriptor, ColumnType, SchemaContext};
use crate::text::{same_word, singularize, QueryText, WordKind};
use crate::vocabulary::Vocabulary;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const MAX_PHRASE_WORDS: usize = 3;
const MAX_EDIT_DISTANCE: usize = 2;
const MIN_FUZZY_LEN: usize = 4;
const MAX_SUGGESTIONS: usize = 3;
const MIN_SUGGESTION_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    Exact,
    Synonym,
    Fuzzy,
}

/// A phrase bound to a column, with its word span `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMatch {
    pub column: String,
    pub column_type: ColumnType,
    pub phrase: String,
    pub start: usize,
    pub end: usize,
    pub method: MatchMethod,
}

/// A phrase naming one of a categorical column's sample values.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMention {
    pub column: String,
    /// The value spelled as stored in the dataset
    pub value: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedPhrase {
    pub phrase: String,
    pub position: usize,
    pub suggestions: Vec<String>,
}

impl UnresolvedPhrase {
    pub fn to_error(&self) -> NlqError {
        NlqError::ColumnUnresolved {
            phrase: self.phrase.clone(),
            suggestions: self.suggestions.clone(),
        }
    }
}

/// Sentence-level resolution result.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub matches: Vec<ColumnMatch>,
    pub values: Vec<ValueMention>,
    pub unresolved: Vec<UnresolvedPhrase>,
}

impl Resolution {
    /// Share of content words that were bound to a column or a value.
    pub fn resolved_fraction(&self) -> f64 {
        let resolved: usize = self.matches.iter().map(|m| m.end - m.start).sum::<usize>()
            + self.values.iter().map(|v| v.end - v.start).sum::<usize>();
        let total = resolved + self.unresolved.len();
        if total == 0 {
            0.0
        } else {
            resolved as f64 / total as f64
        }
    }

    pub fn match_starting_at(&self, idx: usize) -> Option<&ColumnMatch> {
        self.matches.iter().find(|m| m.start == idx)
    }

    pub fn match_covering(&self, idx: usize) -> Option<&ColumnMatch> {
        self.matches.iter().find(|m| m.start <= idx && idx < m.end)
    }

    pub fn value_starting_at(&self, idx: usize) -> Option<&ValueMention> {
        self.values.iter().find(|v| v.start == idx)
    }

    /// The closest column match ending at or before `idx`.
    pub fn last_match_before(&self, idx: usize) -> Option<&ColumnMatch> {
        self.matches.iter().filter(|m| m.end <= idx).max_by_key(|m| m.end)
    }

    /// The first column match starting at or after `idx`.
    pub fn first_match_from(&self, idx: usize) -> Option<&ColumnMatch> {
        self.matches.iter().filter(|m| m.start >= idx).min_by_key(|m| m.start)
    }

    /// Distinct resolved column names in sentence order.
    pub fn columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in &self.matches {
            if !out.contains(&m.column) {
                out.push(m.column.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ColumnResolver {
    vocabulary: Arc<Vocabulary>,
}

impl ColumnResolver {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Resolve standalone tokens. Unresolvable tokens map to `None`.
    pub fn resolve(
        &self,
        tokens: &[&str],
        schema: &SchemaContext,
    ) -> BTreeMap<String, Option<ColumnDescriptor>> {
        let mut out = BTreeMap::new();
        for token in tokens {
            let text = QueryText::new(token);
            let found = if text.is_empty() {
                None
            } else {
                self.match_phrase(&text, 0, text.len(), schema, true)
                    .and_then(|(idx, _)| schema.columns.get(idx).cloned())
            };
            out.insert(token.to_string(), found);
        }
        out
    }

    /// Resolve every content phrase of a question.
    pub fn resolve_text(&self, text: &QueryText, schema: &SchemaContext) -> Resolution {
        let mut resolution = Resolution::default();
        let mut i = 0;

        while i < text.len() {
            let word = &text.words[i];
            if word.kind == WordKind::Quoted {
                if let Some(mention) = self.value_in_span(text, i, i + 1, schema) {
                    resolution.values.push(mention);
                }
                i += 1;
                continue;
            }
            if !text.is_content(i) {
                i += 1;
                continue;
            }

            let max_len = content_run(text, i).min(MAX_PHRASE_WORDS);

            if let Some(m) = longest(i, max_len, |end| {
                self.match_phrase(text, i, end, schema, false)
                    .map(|(idx, method)| column_match(schema, idx, method, text, i, end))
            }) {
                i = m.end;
                resolution.matches.push(m);
                continue;
            }

            if let Some(v) = longest(i, max_len, |end| {
                self.value_in_span(text, i, end, schema)
            }) {
                i = v.end;
                resolution.values.push(v);
                continue;
            }

            if let Some(m) = longest(i, max_len, |end| {
                self.fuzzy_match(&phrase_of(text, i, end), schema)
                    .map(|idx| column_match(schema, idx, MatchMethod::Fuzzy, text, i, end))
            }) {
                i = m.end;
                resolution.matches.push(m);
                continue;
            }

            let phrase = text.words[i].text.clone();
            let suggestions = self.suggest(&phrase, schema);
            debug!("Unresolved phrase '{}' (suggestions: {:?})", phrase, suggestions);
            resolution.unresolved.push(UnresolvedPhrase {
                phrase,
                position: i,
                suggestions,
            });
            i += 1;
        }

        resolution
    }

    /// Exact or synonym match for the words `[start, end)`. Returns the column
    /// index in schema order.
    fn match_phrase(
        &self,
        text: &QueryText,
        start: usize,
        end: usize,
        schema: &SchemaContext,
        allow_fuzzy: bool,
    ) -> Option<(usize, MatchMethod)> {
        let words: Vec<&str> = (start..end).filter_map(|i| text.text(i)).collect();
        if words.is_empty() {
            return None;
        }
        let joined = words.join("_");
        let spaced = words.join(" ");

        // Exact: the name itself or its words, allowing plurals.
        if let Some(idx) = schema.columns.iter().position(|c| {
            let name = c.name.to_lowercase();
            if name == joined || name == spaced {
                return true;
            }
            let column_words = c.words();
            column_words.len() == words.len()
                && column_words.iter().zip(&words).all(|(a, b)| same_word(a, b))
        }) {
            return Some((idx, MatchMethod::Exact));
        }

        // Synonym: vocabulary group, declared synonym, or every phrase word
        // contained in the column name. Fewest non-qualifier extra words wins.
        let scored: Vec<(usize, usize)> = schema
            .columns
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| {
                let name = c.name.to_lowercase();
                if self.vocabulary.are_synonyms(&joined, &name)
                    || c.synonyms.iter().any(|s| s == &spaced)
                {
                    Some((0, idx))
                } else {
                    self.extra_words(c, &words).map(|extra| (extra, idx))
                }
            })
            .collect();

        if let Some(best) = scored.iter().map(|(extra, _)| *extra).min() {
            let candidates: Vec<usize> = scored
                .iter()
                .filter(|(extra, _)| *extra == best)
                .map(|(_, idx)| *idx)
                .collect();
            let chosen = if candidates.len() == 1 {
                candidates[0]
            } else {
                self.break_tie(&candidates, text, start, end, schema)
            };
            return Some((chosen, MatchMethod::Synonym));
        }

        if allow_fuzzy {
            return self
                .fuzzy_match(&spaced, schema)
                .map(|idx| (idx, MatchMethod::Fuzzy));
        }
        None
    }

    fn word_matches(&self, phrase_word: &str, column_word: &str) -> bool {
        same_word(phrase_word, column_word)
            || self.vocabulary.are_synonyms(phrase_word, column_word)
            || self
                .vocabulary
                .are_synonyms(&singularize(phrase_word), &singularize(column_word))
    }

    fn is_qualifier_word(&self, word: &str) -> bool {
        self.vocabulary.is_qualifier(word)
            || self.vocabulary.is_actual_term(word)
            || self.vocabulary.is_budget_term(word)
    }

    /// When every phrase word appears in the column name, the number of
    /// column words left over that are not qualifiers.
    fn extra_words(&self, column: &ColumnDescriptor, words: &[&str]) -> Option<usize> {
        let column_words = column.words();
        let all_found = words
            .iter()
            .all(|w| column_words.iter().any(|cw| self.word_matches(w, cw)));
        if !all_found {
            return None;
        }
        Some(
            column_words
                .iter()
                .filter(|cw| {
                    !words.iter().any(|w| self.word_matches(w, cw)) && !self.is_qualifier_word(cw)
                })
                .count(),
        )
    }

    /// Prefer the candidate whose qualifier word sits next to the phrase,
    /// otherwise the first-declared column.
    fn break_tie(
        &self,
        candidates: &[usize],
        text: &QueryText,
        start: usize,
        end: usize,
        schema: &SchemaContext,
    ) -> usize {
        let mut neighbours: Vec<&str> = Vec::new();
        if start > 0 {
            neighbours.extend(text.text(start - 1));
        }
        neighbours.extend(text.text(end));

        for neighbour in neighbours {
            if !self.is_qualifier_word(neighbour) {
                continue;
            }
            if let Some(idx) = candidates.iter().copied().find(|&idx| {
                schema.columns[idx]
                    .words()
                    .iter()
                    .any(|cw| cw == neighbour || self.vocabulary.are_synonyms(cw, neighbour))
            }) {
                return idx;
            }
        }
        candidates[0]
    }

    fn fuzzy_match(&self, phrase: &str, schema: &SchemaContext) -> Option<usize> {
        let target = depunctuate(phrase);
        if target.chars().count() < MIN_FUZZY_LEN {
            return None;
        }
        // Edits (an adjacent swap counts as one) scale with length, up to two.
        let allowed = MAX_EDIT_DISTANCE.min(target.chars().count() / 3);
        schema
            .columns
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let by_name = strsim::osa_distance(&target, &depunctuate(&c.name));
                let by_synonym = c
                    .synonyms
                    .iter()
                    .map(|s| strsim::osa_distance(&target, &depunctuate(s)))
                    .min()
                    .unwrap_or(usize::MAX);
                (idx, by_name.min(by_synonym))
            })
            .filter(|(_, distance)| *distance <= allowed)
            .min_by_key(|(idx, distance)| (*distance, *idx))
            .map(|(idx, _)| idx)
    }

    fn value_in_span(
        &self,
        text: &QueryText,
        start: usize,
        end: usize,
        schema: &SchemaContext,
    ) -> Option<ValueMention> {
        let phrase = phrase_of(text, start, end);
        schema
            .columns
            .iter()
            .filter(|c| c.inferred_type == ColumnType::Categorical)
            .find_map(|c| {
                c.known_values()
                    .iter()
                    .find(|v| v.to_lowercase() == phrase)
                    .map(|v| ValueMention {
                        column: c.name.clone(),
                        value: v.clone(),
                        start,
                        end,
                    })
            })
    }

    /// Up to three column names ranked by Jaro-Winkler similarity.
    pub fn suggest(&self, phrase: &str, schema: &SchemaContext) -> Vec<String> {
        let phrase = phrase.to_lowercase();
        let mut scored: Vec<(f64, usize)> = schema
            .columns
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let by_name = strsim::jaro_winkler(&phrase, &c.name.to_lowercase());
                let by_words = c
                    .words()
                    .iter()
                    .map(|w| strsim::jaro_winkler(&phrase, w))
                    .fold(0.0, f64::max);
                (by_name.max(by_words), idx)
            })
            .filter(|(score, _)| *score >= MIN_SUGGESTION_SCORE)
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored
            .into_iter()
            .take(MAX_SUGGESTIONS)
            .map(|(_, idx)| schema.columns[idx].name.clone())
            .collect()
    }
}

/// Try spans `[start, start + len)` from the longest down.
fn longest<T>(start: usize, max_len: usize, mut try_span: impl FnMut(usize) -> Option<T>) -> Option<T> {
    (1..=max_len).rev().find_map(|len| try_span(start + len))
}

fn content_run(text: &QueryText, start: usize) -> usize {
    (start..text.len())
        .take_while(|&i| text.is_content(i))
        .count()
}

fn phrase_of(text: &QueryText, start: usize, end: usize) -> String {
    (start..end)
        .filter_map(|i| text.text(i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn column_match(
    schema: &SchemaContext,
    idx: usize,
    method: MatchMethod,
    text: &QueryText,
    start: usize,
    end: usize,
) -> ColumnMatch {
    let column = &schema.columns[idx];
    ColumnMatch {
        column: column.name.clone(),
        column_type: column.inferred_type,
        phrase: phrase_of(text, start, end),
        start,
        end,
        method,
    }
}
