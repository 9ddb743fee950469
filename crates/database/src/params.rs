//! Statement inspection and parameter normalization.
//!
//! SQLite numbers named parameters (`:name`, `@name`, `$name`) in order of
//! first appearance; the driver only binds positionally, so named parameters
//! are rewritten to `?NNN` and their values ordered to match.

use crate::DatabaseError;
use serde_json::Value;

/// Lexer state while scanning SQL text.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    SingleQuoted,
    DoubleQuoted,
    Bracketed,
    LineComment,
    BlockComment,
}

/// Whether the statement's first keyword is `SELECT` or `WITH`.
///
/// Leading whitespace, comments and opening parentheses are skipped.
pub fn is_read_only(sql: &str) -> bool {
    let keyword = first_keyword(sql).to_ascii_lowercase();
    keyword == "select" || keyword == "with"
}

fn first_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Normalize `params` into SQL text plus positional bind values.
///
/// - `null` or missing: no parameters
/// - array: positional, bound in order
/// - object: named, placeholders rewritten to `?NNN`
/// - scalar: a single positional parameter
pub fn normalize(sql: &str, params: &Value) -> Result<(String, Vec<Value>), DatabaseError> {
    match params {
        Value::Null => Ok((sql.to_string(), Vec::new())),
        Value::Array(values) => Ok((sql.to_string(), values.clone())),
        Value::Object(map) => {
            let (rewritten, names) = rewrite_named(sql);
            let mut values = Vec::with_capacity(names.len());
            for name in &names {
                let value = map.get(name).ok_or_else(|| {
                    DatabaseError::InvalidParams(format!("missing value for named parameter '{name}'"))
                })?;
                values.push(value.clone());
            }
            Ok((rewritten, values))
        }
        scalar => Ok((sql.to_string(), vec![scalar.clone()])),
    }
}

/// Replace named placeholders with `?N`, returning the unique names in index order.
fn rewrite_named(sql: &str) -> (String, Vec<String>) {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut state = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Scan::Code => match c {
                '\'' => state = Scan::SingleQuoted,
                '"' => state = Scan::DoubleQuoted,
                '[' => state = Scan::Bracketed,
                '-' if next == Some('-') => state = Scan::LineComment,
                '/' if next == Some('*') => state = Scan::BlockComment,
                ':' | '@' | '$' if next.is_some_and(|n| n.is_alphabetic() || n == '_') => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                        end += 1;
                    }
                    let name: String = chars[start..end].iter().collect();
                    let index = match names.iter().position(|n| *n == name) {
                        Some(pos) => pos + 1,
                        None => {
                            names.push(name);
                            names.len()
                        }
                    };
                    out.push('?');
                    out.push_str(&index.to_string());
                    i = end;
                    continue;
                }
                _ => {}
            },
            Scan::SingleQuoted if c == '\'' => state = Scan::Code,
            Scan::DoubleQuoted if c == '"' => state = Scan::Code,
            Scan::Bracketed if c == ']' => state = Scan::Code,
            Scan::LineComment if c == '\n' => state = Scan::Code,
            Scan::BlockComment if c == '*' && next == Some('/') => {
                out.push_str("*/");
                state = Scan::Code;
                i += 2;
                continue;
            }
            _ => {}
        }
        out.push(c);
        i += 1;
    }

    (out, names)
}
