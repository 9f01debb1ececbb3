//! SQL guard: decides whether a statement may run against the dataset.
//!
//! Three passes, cheapest first: keyword blacklist on the raw text (and on
//! the text with comments removed), AST structure via `sqlparser`, then a
//! token whitelist that also checks every identifier against the schema.

use crate::error::{NlqError, Result};
use crate::schema::SchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{GroupByExpr, SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;
use tracing::{debug, warn};

lazy_static! {
    static ref BLACKLIST: Regex =
        Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|attach|pragma)\b")
            .expect("valid blacklist regex");
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").expect("valid comment regex");
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").expect("valid comment regex");
}

const ALLOWED_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "ORDER", "LIMIT", "AS", "AND", "OR", "NOT", "LIKE",
    "BETWEEN", "IN", "IS", "NULL", "ASC", "DESC", "DISTINCT",
];

const ALLOWED_FUNCTIONS: &[&str] = &["SUM", "AVG", "COUNT", "MIN", "MAX"];

/// First blacklisted keyword in `text`, looking through SQL comments too.
pub fn blacklisted_keyword(text: &str) -> Option<String> {
    if let Some(m) = BLACKLIST.find(text) {
        return Some(m.as_str().to_uppercase());
    }
    let without_blocks = BLOCK_COMMENT.replace_all(text, "");
    let stripped = LINE_COMMENT.replace_all(&without_blocks, "");
    BLACKLIST.find(&stripped).map(|m| m.as_str().to_uppercase())
}

pub fn check_blacklist(text: &str) -> Result<()> {
    match blacklisted_keyword(text) {
        Some(keyword) => {
            warn!("🚫 Blocked statement containing {}", keyword);
            Err(NlqError::UnsafeQuery(format!(
                "{} statements are not allowed",
                keyword
            )))
        }
        None => Ok(()),
    }
}

/// True when `sql` is syntactically valid SQL of any kind.
pub fn parses(sql: &str) -> bool {
    !sql.trim().is_empty() && Parser::parse_sql(&GenericDialect {}, sql).is_ok()
}

/// Run every check. `Ok` means the statement is a single read-only SELECT
/// over `schema.alias` touching only known columns.
pub fn validate(sql: &str, schema: &SchemaContext) -> Result<()> {
    check_blacklist(sql)?;
    check_structure(sql, &schema.alias)?;
    check_tokens(sql, schema)?;
    debug!("SQL passed guard: {}", sql);
    Ok(())
}

fn check_structure(sql: &str, alias: &str) -> Result<()> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| {
        warn!("SQL parse failed: {}", e);
        NlqError::UnsafeQuery("the statement could not be parsed".to_string())
    })?;

    let query = match statements.as_slice() {
        [Statement::Query(query)] => query,
        [_] => {
            return Err(NlqError::UnsafeQuery(
                "only SELECT statements are allowed".to_string(),
            ))
        }
        _ => {
            return Err(NlqError::UnsafeQuery(
                "exactly one statement is allowed".to_string(),
            ))
        }
    };
    if query.with.is_some() {
        return Err(NlqError::UnsafeQuery("WITH clauses are not allowed".to_string()));
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            return Err(NlqError::UnsafeQuery(
                "set operations and nested queries are not allowed".to_string(),
            ))
        }
    };

    let [source] = select.from.as_slice() else {
        return Err(NlqError::UnsafeQuery(
            "the query must read from exactly one table".to_string(),
        ));
    };
    if !source.joins.is_empty() {
        return Err(NlqError::UnsafeQuery("joins are not allowed".to_string()));
    }
    match &source.relation {
        TableFactor::Table { name, .. } => {
            let table = name
                .0
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default();
            if name.0.len() != 1 || table != alias {
                return Err(NlqError::UnsafeQuery(format!(
                    "unknown table '{}', expected '{}'",
                    name, alias
                )));
            }
        }
        _ => {
            return Err(NlqError::UnsafeQuery(
                "subqueries are not allowed".to_string(),
            ))
        }
    }

    if select.having.is_some() {
        return Err(NlqError::UnsafeQuery("HAVING is not allowed".to_string()));
    }
    if matches!(select.group_by, GroupByExpr::All) {
        return Err(NlqError::UnsafeQuery("GROUP BY ALL is not allowed".to_string()));
    }
    Ok(())
}

fn check_tokens(sql: &str, schema: &SchemaContext) -> Result<()> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize().map_err(|e| {
        warn!("SQL tokenize failed: {}", e);
        NlqError::UnsafeQuery("the statement could not be tokenized".to_string())
    })?;
    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();

    // Names introduced with AS may be referenced later (ORDER BY alias).
    let mut output_aliases: BTreeSet<String> = BTreeSet::new();
    for pair in tokens.windows(2) {
        if let (Token::Word(kw), Token::Word(name)) = (&pair[0], &pair[1]) {
            if kw.quote_style.is_none() && kw.keyword == Keyword::AS {
                output_aliases.insert(name.value.to_lowercase());
            }
        }
    }

    let last = tokens.len().saturating_sub(1);
    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::Word(word) => {
                let upper = word.value.to_uppercase();
                let unquoted = word.quote_style.is_none();
                if unquoted
                    && (ALLOWED_KEYWORDS.contains(&upper.as_str())
                        || ALLOWED_FUNCTIONS.contains(&upper.as_str()))
                {
                    continue;
                }
                // The engine resolves identifiers case-sensitively.
                if schema.columns.iter().any(|c| c.name == word.value)
                    || word.value == schema.alias
                    || output_aliases.contains(&word.value.to_lowercase())
                {
                    continue;
                }
                if let Some(column) = schema.column(&word.value) {
                    return Err(NlqError::SchemaMismatch(format!(
                        "Column '{}' does not exist in {}; did you mean '{}'?",
                        word.value, schema.alias, column.name
                    )));
                }
                if unquoted && word.keyword != Keyword::NoKeyword {
                    return Err(NlqError::UnsafeQuery(format!("{} is not allowed", upper)));
                }
                return Err(NlqError::SchemaMismatch(format!(
                    "Column '{}' does not exist in {}",
                    word.value, schema.alias
                )));
            }
            Token::SemiColon if idx == last => {}
            Token::SemiColon => {
                return Err(NlqError::UnsafeQuery(
                    "exactly one statement is allowed".to_string(),
                ))
            }
            Token::Number(_, _)
            | Token::SingleQuotedString(_)
            | Token::Comma
            | Token::LParen
            | Token::RParen
            | Token::Period
            | Token::Mul
            | Token::Eq
            | Token::DoubleEq
            | Token::Neq
            | Token::Lt
            | Token::Gt
            | Token::LtEq
            | Token::GtEq
            | Token::Plus
            | Token::Minus
            | Token::Div => {}
            other => {
                return Err(NlqError::UnsafeQuery(format!(
                    "unsupported token '{}'",
                    other
                )))
            }
        }
    }
    Ok(())
}
