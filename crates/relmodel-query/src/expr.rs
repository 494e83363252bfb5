//! WHERE fragments and ORDER BY terms.
//!
//! Fragments are written with anonymous `?` markers and carry their bound
//! values alongside. Markers are renumbered into the connection's dialect
//! only when a whole statement is rendered, so fragments from different
//! sources can be combined freely.

use std::sync::OnceLock;

use regex::Regex;
use relmodel_core::{Dialect, Error, Result, Value};

/// A boolean SQL condition with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    sql: String,
    params: Vec<Value>,
}

impl Filter {
    /// An arbitrary condition using `?` markers.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// `column = ?`
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::raw(format!("{column} = ?"), vec![value.into()])
    }

    /// `column IS NULL`
    pub fn is_null(column: &str) -> Self {
        Self::raw(format!("{column} IS NULL"), Vec::new())
    }

    /// `column NOT IN (?, ...)`, or `None` for an empty list, which would
    /// exclude nothing.
    pub fn not_in(column: &str, values: Vec<Value>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let markers = vec!["?"; values.len()].join(", ");
        Some(Self::raw(format!("{column} NOT IN ({markers})"), values))
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// Render `filters` as a ` WHERE a AND b` clause, appending their
/// parameters to `params`.
pub(crate) fn where_clause(filters: &[Filter], params: &mut Vec<Value>) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let mut clause = String::from(" WHERE ");
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            clause.push_str(" AND ");
        }
        if filters.len() > 1 {
            clause.push('(');
            clause.push_str(&filter.sql);
            clause.push(')');
        } else {
            clause.push_str(&filter.sql);
        }
        params.extend(filter.params.iter().cloned());
    }
    clause
}

/// Replace every bare `?` marker outside quoted text with the dialect's
/// placeholder, numbering from 1.
///
/// Markers that already carry a number (`?3`) are copied through, and a
/// bare marker after one continues from its number.
pub fn bind_markers(sql: &str, dialect: Dialect) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                out.push(ch);
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '?' if chars.peek().is_some_and(char::is_ascii_digit) => {
                    let mut digits = String::new();
                    while let Some(digit) = chars.next_if(char::is_ascii_digit) {
                        digits.push(digit);
                    }
                    out.push(ch);
                    out.push_str(&digits);
                    index = index.max(digits.parse().unwrap_or(index));
                }
                '?' => {
                    index += 1;
                    out.push_str(&dialect.placeholder(index));
                }
                _ => out.push(ch),
            },
        }
    }
    out
}

/// Direction of an ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A single validated `column [asc|desc]` ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

fn order_by_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*(\w+(?:\.\w+)?)(?:\s+(asc|desc))?\s*$"))
        .as_ref()
        .map_err(|e| Error::builder(format!("order_by pattern failed to compile: {e}")))
}

impl OrderBy {
    /// Parse `"name"`, `"name desc"` or `"t.name ASC"`.
    pub fn parse(term: &str) -> Result<Self> {
        let caps = order_by_pattern()?
            .captures(term)
            .ok_or_else(|| Error::builder(format!("invalid order_by term '{term}'")))?;
        let direction = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(d) if d == "desc" => Direction::Desc,
            _ => Direction::Asc,
        };
        Ok(Self {
            column: caps[1].to_string(),
            direction,
        })
    }

    pub fn to_sql(&self) -> String {
        match self.direction {
            Direction::Asc => format!("{} ASC", self.column),
            Direction::Desc => format!("{} DESC", self.column),
        }
    }
}
