//! SQL action/table classification and sensitive-field redaction.
//!
//! Every pattern here is a lazily-compiled `Regex` behind `lazy_static`,
//! matched once per process rather than recompiled per call.

use std::collections::HashMap;

use lazy_static::lazy_static;
use openssl::sha::Sha256;
use regex::Regex;
use serde_json::Value;

use crate::entry::Action;

lazy_static! {
    static ref INSERT_TABLE: Regex =
        Regex::new(r"(?i)^\s*insert\s+into\s+([A-Za-z0-9_.\"]+)").unwrap();
    static ref UPDATE_TABLE: Regex = Regex::new(r"(?i)^\s*update\s+([A-Za-z0-9_.\"]+)").unwrap();
    static ref DELETE_TABLE: Regex =
        Regex::new(r"(?i)^\s*delete\s+from\s+([A-Za-z0-9_.\"]+)").unwrap();
    static ref SELECT_TABLE: Regex =
        Regex::new(r"(?i)\bfrom\s+([A-Za-z0-9_.\"]+)").unwrap();
    static ref DDL_TABLE: Regex =
        Regex::new(r"(?i)^\s*(?:create|alter|drop|truncate)\s+table\s+(?:if\s+(?:not\s+)?exists\s+)?([A-Za-z0-9_.\"]+)").unwrap();

    static ref INSERT_COLUMNS: Regex =
        Regex::new(r"(?is)^\s*insert\s+into\s+[A-Za-z0-9_.\"]+\s*\(([^)]*)\)\s*values\s*\(([^)]*)\)").unwrap();
    static ref FIELD_DOLLAR_PARAM: Regex =
        Regex::new(r"(?i)([A-Za-z0-9_\"]+)\s*=\s*\$(\d+)").unwrap();
    static ref FIELD_QMARK_PARAM: Regex = Regex::new(r"(?i)([A-Za-z0-9_\"]+)\s*=\s*\?").unwrap();
    static ref FIELD_LITERAL: Regex =
        Regex::new(r#"(?i)([A-Za-z0-9_\"]+)\s*=\s*('(?:[^'\\]|\\.)*'|\d+(?:\.\d+)?)"#).unwrap();

    static ref NORMALIZE_WS: Regex = Regex::new(r"\s+").unwrap();
    static ref STRING_LITERAL: Regex = Regex::new(r"'(?:[^'\\]|\\.)*'").unwrap();
    static ref NUMBER_LITERAL: Regex = Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap();
    static ref DOLLAR_LITERAL: Regex = Regex::new(r"\$\d+").unwrap();
}

pub fn parse_action(sql: &str) -> Action {
    let trimmed = sql.trim_start();
    let first_word: String = trimmed
        .split(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match first_word.as_str() {
        "SELECT" | "WITH" => Action::Select,
        "INSERT" => Action::Insert,
        "UPDATE" => Action::Update,
        "DELETE" => Action::Delete,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Action::Ddl,
        _ => Action::Other,
    }
}

pub fn extract_table(sql: &str) -> Option<String> {
    let re = match parse_action(sql) {
        Action::Insert => &*INSERT_TABLE,
        Action::Update => &*UPDATE_TABLE,
        Action::Delete => &*DELETE_TABLE,
        Action::Ddl => &*DDL_TABLE,
        Action::Select => &*SELECT_TABLE,
        Action::Other => return None,
    };
    re.captures(sql)
        .map(|c| c[1].trim_matches('"').to_string())
}

/// A structural hash over the *query text only*: whitespace is
/// collapsed, keywords upper-cased, and string/number/`$N` literals
/// folded to `?` before hashing, so two statements that differ only in
/// parameter values hash identically. Returns the low 64 bits of
/// SHA-256, hex encoded to 16 characters.
pub fn hash_query(sql: &str) -> String {
    let mut normalized = NORMALIZE_WS.replace_all(sql.trim(), " ").to_uppercase();
    normalized = STRING_LITERAL.replace_all(&normalized, "?").to_string();
    normalized = DOLLAR_LITERAL.replace_all(&normalized, "?").to_string();
    normalized = NUMBER_LITERAL.replace_all(&normalized, "?").to_string();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finish();
    hex::encode(&digest[24..32])
}

#[derive(Debug, Clone)]
pub struct Redactor {
    sensitive: Vec<String>,
    patterns: Vec<Regex>,
    placeholder: String,
}

impl Redactor {
    pub fn new(sensitive_fields: &[String], additional_patterns: &[String], placeholder: &str) -> Self {
        let sensitive = sensitive_fields
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        let patterns = additional_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Redactor {
            sensitive,
            patterns,
            placeholder: placeholder.to_string(),
        }
    }

    fn is_sensitive(&self, field: &str) -> bool {
        let lower = field.to_ascii_lowercase();
        if self.sensitive.iter().any(|s| lower == *s || lower.contains(s.as_str())) {
            return true;
        }
        self.patterns.iter().any(|p| p.is_match(&lower))
    }

    /// Returns the redacted query text and the set of (0-based) argument
    /// indices identified as sensitive.
    pub fn redact_query(&self, sql: &str) -> (String, Vec<usize>) {
        let mut indices = Vec::new();

        if let Some(caps) = INSERT_COLUMNS.captures(sql) {
            let columns: Vec<&str> = caps[1].split(',').map(|c| c.trim()).collect();
            for (i, col) in columns.iter().enumerate() {
                let bare = col.trim_matches('"');
                if self.is_sensitive(bare) {
                    indices.push(i);
                }
            }
        }

        for caps in FIELD_DOLLAR_PARAM.captures_iter(sql) {
            let field = caps[1].trim_matches('"');
            if self.is_sensitive(field) {
                if let Ok(n) = caps[2].parse::<usize>() {
                    if n >= 1 {
                        indices.push(n - 1);
                    }
                }
            }
        }

        if FIELD_QMARK_PARAM.is_match(sql) {
            let mut qmark_count = 0usize;
            let mut last_end = 0usize;
            for caps in FIELD_QMARK_PARAM.captures_iter(sql) {
                let m = caps.get(0).unwrap();
                qmark_count += sql[last_end..m.start()].matches('?').count();
                last_end = m.start();
                let field = caps[1].trim_matches('"');
                if self.is_sensitive(field) {
                    indices.push(qmark_count);
                }
            }
        }

        let redacted_query = FIELD_LITERAL.replace_all(sql, |caps: &regex::Captures| {
            let field = caps[1].trim_matches('"');
            if self.is_sensitive(field) {
                format!("{} = {}", &caps[1], self.placeholder_literal())
            } else {
                caps[0].to_string()
            }
        });

        indices.sort_unstable();
        indices.dedup();
        (redacted_query.into_owned(), indices)
    }

    fn placeholder_literal(&self) -> String {
        format!("'{}'", self.placeholder)
    }

    pub fn redact_args(&self, args: &[String], sensitive_indices: &[usize]) -> Vec<String> {
        args.iter()
            .enumerate()
            .map(|(i, a)| {
                if sensitive_indices.contains(&i) {
                    self.placeholder.clone()
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    pub fn redact_metadata(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    if self.is_sensitive(k) {
                        out.insert(k.clone(), Value::String(self.placeholder.clone()));
                    } else {
                        out.insert(k.clone(), self.redact_metadata(v));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_metadata(v)).collect()),
            other => other.clone(),
        }
    }

    pub fn redact_args_map(&self, args: &[String], sensitive_indices: &[usize]) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        let redacted = self.redact_args(args, sensitive_indices);
        map.insert(
            "args".to_string(),
            Value::Array(redacted.into_iter().map(Value::String).collect()),
        );
        map
    }
}
