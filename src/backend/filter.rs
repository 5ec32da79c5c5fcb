//! Typed PostgREST query construction.
//!
//! Filters are built as values and rendered to query parameters in one place,
//! so user text never gets spliced into a filter expression unescaped.

use std::fmt;

/// A single row filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
  Eq(String, String),
  Gte(String, String),
  Lte(String, String),
  In(String, Vec<String>),
  /// Array column shares at least one element with the list
  Overlaps(String, Vec<String>),
  /// Case-insensitive substring match on user-provided text
  Contains(String, String),
  /// Any of the nested filters matches
  Or(Vec<Filter>),
}

impl Filter {
  pub fn eq(column: &str, value: impl Into<String>) -> Self {
    Self::Eq(column.to_string(), value.into())
  }

  pub fn contains(column: &str, text: impl Into<String>) -> Self {
    Self::Contains(column.to_string(), text.into())
  }

  /// Render as a `(key, value)` query parameter.
  fn to_param(&self) -> (String, String) {
    match self {
      Self::Or(filters) => {
        let inner: Vec<String> = filters.iter().map(|f| f.to_expression()).collect();
        ("or".to_string(), format!("({})", inner.join(",")))
      }
      other => (other.column().to_string(), other.operator_value()),
    }
  }

  /// Render as `column.op.value`, the form used inside `or=(...)`.
  fn to_expression(&self) -> String {
    match self {
      Self::Or(filters) => {
        let inner: Vec<String> = filters.iter().map(|f| f.to_expression()).collect();
        format!("or({})", inner.join(","))
      }
      other => format!("{}.{}", other.column(), other.operator_value()),
    }
  }

  fn column(&self) -> &str {
    match self {
      Self::Eq(c, _)
      | Self::Gte(c, _)
      | Self::Lte(c, _)
      | Self::In(c, _)
      | Self::Overlaps(c, _)
      | Self::Contains(c, _) => c,
      Self::Or(_) => "or",
    }
  }

  fn operator_value(&self) -> String {
    match self {
      Self::Eq(_, v) => format!("eq.{}", quote(v)),
      Self::Gte(_, v) => format!("gte.{}", quote(v)),
      Self::Lte(_, v) => format!("lte.{}", quote(v)),
      Self::In(_, values) => {
        let values: Vec<String> = values.iter().map(|v| quote(v)).collect();
        format!("in.({})", values.join(","))
      }
      Self::Overlaps(_, values) => {
        let values: Vec<String> = values.iter().map(|v| quote(v)).collect();
        format!("ov.{{{}}}", values.join(","))
      }
      Self::Contains(_, text) => format!("ilike.{}", quote(&format!("*{}*", escape_like(text)))),
      Self::Or(_) => String::new(),
    }
  }
}

impl fmt::Display for Filter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (key, value) = self.to_param();
    write!(f, "{}={}", key, value)
  }
}

/// Characters with meaning in PostgREST filter syntax
const RESERVED: &[char] = &[',', '.', ':', '(', ')', '{', '}', '"', '\\', ' '];

/// Double-quote a value if it contains reserved characters.
fn quote(value: &str) -> String {
  if !value.contains(RESERVED) {
    return value.to_string();
  }
  let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{}\"", escaped)
}

/// Escape LIKE wildcards so user text matches literally.
fn escape_like(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for c in text.chars() {
    if matches!(c, '%' | '_' | '*' | '\\') {
      out.push('\\');
    }
    out.push(c);
  }
  out
}

/// A read query against one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBuilder {
  select: Option<String>,
  filters: Vec<Filter>,
  order: Option<(String, bool)>,
  limit: Option<usize>,
  offset: Option<usize>,
}

impl QueryBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn select(mut self, columns: &str) -> Self {
    self.select = Some(columns.to_string());
    self
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn eq(self, column: &str, value: impl Into<String>) -> Self {
    self.filter(Filter::eq(column, value))
  }

  pub fn order(mut self, column: &str, ascending: bool) -> Self {
    self.order = Some((column.to_string(), ascending));
    self
  }

  /// Rows `from..=to`, both zero-based.
  pub fn range(mut self, from: usize, to: usize) -> Self {
    self.offset = Some(from);
    self.limit = Some(to.saturating_sub(from) + 1);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Query parameters in a stable order.
  pub fn to_params(&self) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if let Some(select) = &self.select {
      params.push(("select".to_string(), select.clone()));
    }
    params.extend(self.filters.iter().map(Filter::to_param));
    if let Some((column, ascending)) = &self.order {
      let direction = if *ascending { "asc" } else { "desc" };
      params.push(("order".to_string(), format!("{}.{}", column, direction)));
    }
    if let Some(limit) = self.limit {
      params.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = self.offset {
      params.push(("offset".to_string(), offset.to_string()));
    }
    params
  }
}
