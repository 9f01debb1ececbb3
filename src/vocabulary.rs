//! Domain vocabulary used by column resolution and the financial idioms.
//!
//! The vocabulary is loaded once (built-in defaults or a JSON file) and then
//! shared read-only through an `Arc`. Nothing in the crate mutates it after
//! construction.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Synonym groups and qualifier words for business column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    /// Groups of interchangeable terms. A term may be a single word
    /// ("revenue") or a full column name ("actual_sales").
    pub synonym_groups: Vec<Vec<String>>,

    /// Qualifier words that distinguish otherwise identical measures
    /// (`budget_sales` vs `actual_sales`).
    pub qualifiers: Vec<String>,

    /// Words naming the "actual" side of a budget comparison.
    #[serde(default = "default_actual_terms")]
    pub actual_terms: Vec<String>,

    /// Words naming the "plan" side of a budget comparison.
    #[serde(default = "default_budget_terms")]
    pub budget_terms: Vec<String>,

    /// Words naming a variance/delta measure.
    #[serde(default = "default_variance_terms")]
    pub variance_terms: Vec<String>,

    #[serde(skip)]
    index: BTreeMap<String, BTreeSet<usize>>,
}

fn default_actual_terms() -> Vec<String> {
    words(&["actual", "actuals", "real"])
}

fn default_budget_terms() -> Vec<String> {
    words(&["budget", "plan", "planned", "target", "forecast"])
}

fn default_variance_terms() -> Vec<String> {
    words(&["variance", "delta", "difference", "diff", "gap"])
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        let groups = vec![
            words(&["sales", "revenue", "actual_sales", "turnover"]),
            words(&["budget", "plan", "target", "planned"]),
            words(&["variance", "delta", "difference"]),
            words(&["percentage", "percent", "pct", "rate"]),
            words(&["quantity", "qty", "units", "volume"]),
            words(&["amount", "amt", "value"]),
            words(&["cost", "expense", "expenses", "spend"]),
            words(&["profit", "margin", "earnings"]),
            words(&["customer", "client"]),
            words(&["satisfaction", "csat"]),
            words(&["date", "day", "period"]),
            words(&["region", "area", "territory"]),
            words(&["employee", "staff", "headcount"]),
        ];
        Self::new(
            groups,
            words(&["budget", "actual", "target", "plan", "forecast", "prior"]),
        )
    }
}

impl Vocabulary {
    pub fn new(synonym_groups: Vec<Vec<String>>, qualifiers: Vec<String>) -> Self {
        let mut vocabulary = Self {
            synonym_groups,
            qualifiers,
            actual_terms: default_actual_terms(),
            budget_terms: default_budget_terms(),
            variance_terms: default_variance_terms(),
            index: BTreeMap::new(),
        };
        vocabulary.rebuild_index();
        vocabulary
    }

    /// Load a vocabulary from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NlqError::Config(format!("Failed to read vocabulary {}: {}", path.display(), e))
        })?;
        let mut vocabulary: Vocabulary = serde_json::from_str(&content)?;
        vocabulary.rebuild_index();
        Ok(vocabulary)
    }

    fn rebuild_index(&mut self) {
        for group in &mut self.synonym_groups {
            for term in group.iter_mut() {
                *term = term.trim().to_lowercase();
            }
        }
        self.index.clear();
        for (idx, group) in self.synonym_groups.iter().enumerate() {
            for term in group {
                self.index.entry(term.clone()).or_default().insert(idx);
            }
        }
    }

    /// Every term sharing a group with `term`, including `term` itself.
    pub fn synonyms_of(&self, term: &str) -> BTreeSet<String> {
        let term = term.to_lowercase();
        let mut out = BTreeSet::new();
        out.insert(term.clone());
        if let Some(groups) = self.index.get(&term) {
            for idx in groups {
                out.extend(self.synonym_groups[*idx].iter().cloned());
            }
        }
        out
    }

    /// Whether two terms are equal or share a synonym group.
    pub fn are_synonyms(&self, a: &str, b: &str) -> bool {
        let a = a.to_lowercase();
        let b = b.to_lowercase();
        if a == b {
            return true;
        }
        match (self.index.get(&a), self.index.get(&b)) {
            (Some(ga), Some(gb)) => ga.intersection(gb).next().is_some(),
            _ => false,
        }
    }

    pub fn is_qualifier(&self, word: &str) -> bool {
        self.qualifiers.iter().any(|q| q == word)
    }

    pub fn is_actual_term(&self, word: &str) -> bool {
        self.actual_terms.iter().any(|q| q == word)
    }

    pub fn is_budget_term(&self, word: &str) -> bool {
        self.budget_terms.iter().any(|q| q == word)
    }

    pub fn is_variance_term(&self, word: &str) -> bool {
        self.variance_terms.iter().any(|q| q == word)
    }
}
