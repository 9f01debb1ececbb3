//! Tokenisation of free-text questions.
//!
//! Produces an ordered list of [`Word`]s: lowercased words, numeric literals
//! (with `$`, `,`, `%` and `k/m/b` handled), quoted strings and comparison
//! symbols. Word indices are the coordinate system every parser uses.

use lazy_static::lazy_static;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberLiteral {
    pub value: f64,
    pub percent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WordKind {
    Word,
    Number(NumberLiteral),
    /// Text inside quotes, case preserved in `raw`
    Quoted,
    /// `<`, `>`, `<=`, `>=`, `=`, `!=`
    Symbol,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    /// Lowercased form used for matching
    pub text: String,
    /// Original spelling
    pub raw: String,
    pub kind: WordKind,
}

impl Word {
    pub fn is_word(&self) -> bool {
        self.kind == WordKind::Word
    }

    pub fn number(&self) -> Option<NumberLiteral> {
        match self.kind {
            WordKind::Number(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryText {
    pub original: String,
    pub words: Vec<Word>,
}

impl QueryText {
    pub fn new(query: &str) -> Self {
        Self {
            original: query.to_string(),
            words: tokenize(query),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn text(&self, idx: usize) -> Option<&str> {
        self.words.get(idx).map(|w| w.text.as_str())
    }

    /// Whether the words starting at `idx` spell out `phrase` (space separated).
    pub fn matches_at(&self, idx: usize, phrase: &[&str]) -> bool {
        phrase.iter().enumerate().all(|(offset, expected)| {
            self.words
                .get(idx + offset)
                .map(|w| w.text == *expected)
                .unwrap_or(false)
        })
    }

    /// Index of the first occurrence of a single word.
    pub fn find(&self, word: &str) -> Option<usize> {
        self.words.iter().position(|w| w.text == word)
    }

    /// Whether a word is a content word (a candidate column reference).
    pub fn is_content(&self, idx: usize) -> bool {
        self.words
            .get(idx)
            .map(|w| w.is_word() && !is_function_word(&w.text))
            .unwrap_or(false)
    }
}

lazy_static! {
    static ref FUNCTION_WORDS: HashSet<&'static str> = [
        "a", "an", "the", "of", "for", "with", "without", "by", "in", "on", "at", "to", "from",
        "and", "or", "not", "no", "is", "are", "was", "were", "be", "been", "has", "have", "had",
        "do", "does", "did", "what", "which", "who", "whose", "where", "when", "how", "many",
        "much", "me", "my", "our", "i", "we", "you", "show", "list", "display", "give", "get",
        "find", "tell", "fetch", "return", "see", "view", "let", "us", "please", "all", "every",
        "each", "everything", "any", "rows", "row", "records", "record", "data", "dataset",
        "table", "entries", "entry", "that", "this", "these", "those", "than", "then", "there",
        "their", "its", "it", "as", "per", "greater", "more", "less", "fewer", "higher", "lower",
        "larger", "smaller", "bigger", "above", "below", "over", "under", "exceed", "exceeds",
        "exceeding", "least", "most", "equal", "equals", "between", "like", "contains",
        "containing", "starting", "starts", "ending", "ends", "one", "other", "except", "total",
        "sum", "average", "avg", "mean", "count", "number", "maximum", "max", "highest",
        "minimum", "min", "lowest", "top", "bottom", "best", "worst", "sorted", "sort", "order",
        "ordered", "rank", "ranked", "ascending", "descending", "asc", "desc", "having", "group",
        "grouped", "vs", "versus", "also", "only", "just", "up", "can", "could", "would",
        "should", "will", "want", "need", "know", "whats", "s", "negative", "positive",
        "missed", "beat", "exceeded", "across", "each", "them", "they", "those", "some",
    ]
    .into_iter()
    .collect();
}

pub fn is_function_word(word: &str) -> bool {
    FUNCTION_WORDS.contains(word)
}

/// Crude English singular form, used only as a secondary comparison.
pub fn singularize(word: &str) -> String {
    if word.len() > 4 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 4 && word.ends_with("sses") {
        word[..word.len() - 2].to_string()
    } else if word.len() > 3
        && word.ends_with('s')
        && !word.ends_with("ss")
        && !word.ends_with("us")
        && !word.ends_with("is")
    {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Equal, or equal once both sides are singularised.
pub fn same_word(a: &str, b: &str) -> bool {
    a == b || singularize(a) == singularize(b)
}

/// Parse `60000`, `$60,000`, `60k`, `1.5m`, `12%`, `-3`.
pub fn parse_number(raw: &str) -> Option<NumberLiteral> {
    let mut text = raw.trim().to_lowercase().replace(['$', ','], "");
    let percent = text.ends_with('%');
    if percent {
        text.pop();
    }
    let multiplier = match text.chars().last() {
        Some('k') => 1_000.0,
        Some('m') => 1_000_000.0,
        Some('b') => 1_000_000_000.0,
        _ => 1.0,
    };
    if multiplier != 1.0 {
        text.pop();
    }
    let value = text.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(NumberLiteral {
        value: value * multiplier,
        percent,
    })
}

pub fn tokenize(query: &str) -> Vec<Word> {
    let chars: Vec<char> = query.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let at_boundary = i == 0 || chars[i - 1].is_whitespace() || chars[i - 1] == '(';

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' || (c == '\'' && at_boundary) {
            if let Some(len) = chars[i + 1..].iter().position(|&q| q == c) {
                let raw: String = chars[i + 1..i + 1 + len].iter().collect();
                if !raw.trim().is_empty() {
                    words.push(Word {
                        text: raw.to_lowercase(),
                        raw,
                        kind: WordKind::Quoted,
                    });
                }
                i += len + 2;
                continue;
            }
            i += 1;
            continue;
        }

        let starts_number = c.is_ascii_digit()
            || (c == '$' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()))
            || (c == '-'
                && at_boundary
                && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()));
        if starts_number {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == ',')
            {
                i += 1;
            }
            if i < chars.len() && chars[i] == '%' {
                i += 1;
            } else if i < chars.len()
                && matches!(chars[i].to_ascii_lowercase(), 'k' | 'm' | 'b')
                && chars.get(i + 1).map_or(true, |n| !n.is_alphanumeric())
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            let raw = raw.trim_end_matches(['.', ',']).to_string();
            match parse_number(&raw) {
                Some(number) => words.push(Word {
                    text: raw.to_lowercase(),
                    raw,
                    kind: WordKind::Number(number),
                }),
                None => words.push(Word {
                    text: raw.to_lowercase(),
                    raw,
                    kind: WordKind::Word,
                }),
            }
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric()
                    || chars[i] == '_'
                    || (chars[i] == '\''
                        && chars.get(i + 1).map_or(false, |n| n.is_alphabetic())))
            {
                i += 1;
            }
            let raw: String = chars[start..i].iter().collect();
            let mut text = raw.to_lowercase();
            if let Some(stripped) = text.strip_suffix("'s") {
                text = stripped.to_string();
            }
            text = text.replace('\'', "");
            words.push(Word {
                text,
                raw,
                kind: WordKind::Word,
            });
            continue;
        }

        if matches!(c, '<' | '>' | '=' | '!') {
            let mut symbol = c.to_string();
            if chars.get(i + 1) == Some(&'=') {
                symbol.push('=');
                i += 1;
            } else if c == '<' && chars.get(i + 1) == Some(&'>') {
                symbol = "!=".to_string();
                i += 1;
            }
            i += 1;
            if symbol != "!" {
                words.push(Word {
                    text: symbol.clone(),
                    raw: symbol,
                    kind: WordKind::Symbol,
                });
            }
            continue;
        }

        i += 1;
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(query: &str) -> Vec<String> {
        tokenize(query).into_iter().map(|w| w.text).collect()
    }

    #[test]
    fn test_tokenize_words_and_numbers() {
        let words = tokenize("Show me sales greater than $60,000.");
        assert_eq!(
            words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>(),
            vec!["show", "me", "sales", "greater", "than", "$60,000"]
        );
        assert_eq!(words[5].number().unwrap().value, 60000.0);
    }

    #[test]
    fn test_percent_and_suffixes() {
        assert_eq!(
            parse_number("15%"),
            Some(NumberLiteral {
                value: 15.0,
                percent: true
            })
        );
        assert_eq!(parse_number("60k").unwrap().value, 60_000.0);
        assert_eq!(parse_number("1.5m").unwrap().value, 1_500_000.0);
        assert_eq!(parse_number("-3").unwrap().value, -3.0);
        assert!(parse_number("abc").is_none());
    }

    #[test]
    fn test_quotes_and_apostrophes() {
        assert_eq!(
            texts("what's region 'North East' doing"),
            vec!["what", "region", "north east", "doing"]
        );
        let words = tokenize(r#"name is "Acme Corp""#);
        assert_eq!(words[2].kind, WordKind::Quoted);
        assert_eq!(words[2].raw, "Acme Corp");
    }

    #[test]
    fn test_symbols() {
        assert_eq!(texts("sales >= 10 and cost<>5"), vec!["sales", ">=", "10", "and", "cost", "!=", "5"]);
    }

    #[test]
    fn test_singularize() {
        assert_eq!(singularize("regions"), "region");
        assert_eq!(singularize("categories"), "category");
        assert_eq!(singularize("status"), "status");
        assert!(same_word("products", "product"));
        assert!(same_word("sales", "sales"));
    }
}
