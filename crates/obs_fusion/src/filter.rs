//! Composable SQL accumulator used to build observation queries step by step.
//!
//! Several collaborating steps shape one query: the entity-kind base query,
//! the user selection, decimation grouping and pagination. `FilterQuery` is a
//! plain value; deriving a variant (`with_*`, `without_*`, `clone`) never
//! touches the instance it came from.

use std::fmt::Write as _;

use chrono::NaiveDateTime;

use crate::error::{Result, StoreError};

/// Connective every appended predicate starts with.
pub const CONNECTIVE: &str = " AND ";

/// Typed positional parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Null,
}

impl SqlParam {
    /// Renders the parameter as an escaped SQL literal.
    pub fn to_literal(&self) -> String {
        match self {
            Self::Text(v) => quote_literal(v),
            Self::Int(v) => v.to_string(),
            Self::Float(v) if v.is_finite() => format!("{v:?}"),
            Self::Float(_) => "CAST('NaN' AS DOUBLE)".to_string(),
            Self::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
            Self::Timestamp(t) => {
                format!("TIMESTAMP '{}'", t.format("%Y-%m-%dT%H:%M:%S%.3f"))
            }
            Self::Null => "NULL".to_string(),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SqlParam {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<NaiveDateTime> for SqlParam {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quotes an identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Row window applied last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl Pagination {
    pub fn new(offset: Option<u64>, limit: Option<u64>) -> Self {
        Self { offset, limit }
    }

    pub fn is_empty(&self) -> bool {
        self.offset.is_none() && self.limit.is_none()
    }
}

/// Incrementally built, parameterized SQL query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterQuery {
    projection: String,
    from: String,
    /// Predicate text; fragments start with [`CONNECTIVE`].
    predicate: String,
    group_by: Vec<String>,
    order_by: Vec<String>,
    pagination: Pagination,
    params: Vec<SqlParam>,
    first_replaced: bool,
}

impl FilterQuery {
    /// Starts a query selecting `projection` from `from`.
    pub fn new(projection: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            projection: projection.into(),
            from: from.into(),
            ..Self::default()
        }
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    pub fn from_clause(&self) -> &str {
        &self.from
    }

    pub fn predicate(&self) -> &str {
        &self.predicate
    }

    pub fn pagination(&self) -> Pagination {
        self.pagination
    }

    pub fn has_predicate(&self) -> bool {
        !self.predicate.trim().is_empty()
    }

    /// Appends raw text to the predicate.
    pub fn append(&mut self, fragment: &str) -> &mut Self {
        self.predicate.push_str(fragment);
        self
    }

    /// Appends `<connective><condition>`.
    pub fn and(&mut self, condition: &str) -> &mut Self {
        self.predicate.push_str(CONNECTIVE);
        self.predicate.push_str(condition);
        self
    }

    /// Replaces the first occurrence of `token` in the predicate.
    ///
    /// Only the first call per logical query applies; later calls return
    /// `false` without touching the predicate.
    pub fn replace_first(&mut self, token: &str, replacement: &str) -> bool {
        if self.first_replaced {
            return false;
        }
        match self.predicate.find(token) {
            Some(pos) => {
                self.predicate
                    .replace_range(pos..pos + token.len(), replacement);
                self.first_replaced = true;
                true
            }
            None => false,
        }
    }

    /// Drops the connective in front of the first predicate, if any.
    pub fn seal(&mut self) -> &mut Self {
        if self.predicate.starts_with(CONNECTIVE) {
            self.replace_first(CONNECTIVE, " ");
        }
        self
    }

    /// Extends the join chain of the from clause.
    pub fn join(&mut self, clause: &str) -> &mut Self {
        self.from.push(' ');
        self.from.push_str(clause);
        self
    }

    /// Records `value` and returns its `$n` placeholder.
    pub fn set_param(&mut self, value: impl Into<SqlParam>) -> String {
        self.params.push(value.into());
        format!("${}", self.params.len())
    }

    /// Renders a comma separated list of placeholders for `values`.
    pub fn set_params<I, V>(&mut self, values: I) -> String
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlParam>,
    {
        values
            .into_iter()
            .map(|value| self.set_param(value))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn with_projection(&self, projection: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.projection = projection.into();
        out
    }

    pub fn with_group_by(&self, group_by: Vec<String>) -> Self {
        let mut out = self.clone();
        out.group_by = group_by;
        out
    }

    pub fn with_order_by(&self, order_by: Vec<String>) -> Self {
        let mut out = self.clone();
        out.order_by = order_by;
        out
    }

    pub fn without_order(&self) -> Self {
        self.with_order_by(Vec::new())
    }

    pub fn with_pagination(&self, pagination: Pagination) -> Self {
        let mut out = self.clone();
        out.pagination = pagination;
        out
    }

    pub fn without_pagination(&self) -> Self {
        self.with_pagination(Pagination::default())
    }

    /// Assembles the SQL text with `$n` placeholders left in place.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.projection, self.from);
        // A leading connective left by callers that never sealed the query is
        // dropped on a copy; rendering has no side effects.
        let predicate = self.predicate.trim();
        let predicate = predicate
            .strip_prefix(CONNECTIVE.trim_start())
            .unwrap_or(predicate)
            .trim();
        if !predicate.is_empty() {
            let _ = write!(sql, " WHERE {predicate}");
        }
        if !self.group_by.is_empty() {
            let _ = write!(sql, " GROUP BY {}", self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            let _ = write!(sql, " ORDER BY {}", self.order_by.join(", "));
        }
        if let Some(limit) = self.pagination.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = self.pagination.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }
        sql
    }

    /// Renders the final SQL with every placeholder bound positionally.
    pub fn fill_params(&self) -> Result<String> {
        bind_placeholders(&self.to_sql(), &self.params)
    }
}

/// Substitutes `$n` placeholders outside quoted literals and identifiers.
fn bind_placeholders(sql: &str, params: &[SqlParam]) -> Result<String> {
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' if chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                let position = digits.parse::<usize>().unwrap_or(0);
                let param = position
                    .checked_sub(1)
                    .and_then(|idx| params.get(idx))
                    .ok_or_else(|| {
                        StoreError::InvalidRequest(format!("unbound query parameter ${digits}"))
                    })?;
                out.push_str(&param.to_literal());
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}
