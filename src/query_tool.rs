//! Read-only SQL tool over the `youtube_analytics` table.
//!
//! Callers send a SELECT statement that may reference `{start_date}` and
//! `{end_date}`. Placeholders are turned into bound parameters where they stand
//! alone or fill a whole quoted span, e.g. `date >= '{start_date}'` or
//! `date >= "{start_date}"`. Inside a longer quoted span the validated
//! `YYYY-MM-DD` text is spliced in. `{{` and `}}` produce literal
//! braces.
//!
//! Bad caller input (non-SELECT, missing placeholder value, malformed date) is
//! an error. SQL that fails to execute yields `success: true` with no rows.

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use tracing::warn;

pub const AVAILABLE_PARAMETERS: &str = "start_date, end_date";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryToolError {
  NotSelect,
  MissingParameter(String),
  InvalidDate { name: &'static str, value: String },
}

impl std::fmt::Display for QueryToolError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      QueryToolError::NotSelect => write!(f, "Only SELECT queries are allowed"),
      QueryToolError::MissingParameter(name) => write!(
        f,
        "Missing parameter in query: '{name}'. Available parameters: {AVAILABLE_PARAMETERS}"
      ),
      QueryToolError::InvalidDate { name, value } => {
        write!(f, "Invalid {name} {value:?}: expected YYYY-MM-DD")
      }
    }
  }
}

impl std::error::Error for QueryToolError {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryToolOutput {
  pub success: bool,
  pub results: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQuery {
  pub sql: String,
  pub params: Vec<String>,
}

#[derive(Debug, Default)]
struct DateParams {
  start_date: Option<String>,
  end_date: Option<String>,
}

impl DateParams {
  fn resolve(&self, name: &str) -> Result<String, QueryToolError> {
    let value = match name {
      "start_date" => self.start_date.clone(),
      "end_date" => self.end_date.clone(),
      _ => None,
    };
    value.ok_or_else(|| QueryToolError::MissingParameter(name.to_string()))
  }
}

fn normalize_date(name: &'static str, value: Option<&str>) -> Result<Option<String>, QueryToolError> {
  let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
    return Ok(None);
  };
  NaiveDate::parse_from_str(raw, "%Y-%m-%d")
    .map(|d| Some(d.format("%Y-%m-%d").to_string()))
    .map_err(|_| QueryToolError::InvalidDate {
      name,
      value: raw.to_string(),
    })
}

/// `{identifier}` starting at `start`; returns the name and the token length in chars.
fn placeholder_at(chars: &[char], start: usize) -> Option<(String, usize)> {
  if chars.get(start) != Some(&'{') {
    return None;
  }
  let mut end = start + 1;
  while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
    end += 1;
  }
  let name: String = chars[start + 1..end].iter().collect();
  let starts_ok = name
    .chars()
    .next()
    .map(|c| c.is_ascii_alphabetic() || c == '_')
    .unwrap_or(false);
  if !starts_ok || chars.get(end) != Some(&'}') {
    return None;
  }
  Some((name, end + 1 - start))
}

fn expand_template(sql: &str, dates: &DateParams) -> Result<BoundQuery, QueryToolError> {
  let chars: Vec<char> = sql.chars().collect();
  let mut out = String::with_capacity(sql.len());
  let mut params = Vec::new();
  // Open quote char while inside a string literal or quoted identifier.
  let mut quote: Option<char> = None;
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    match (quote, c) {
      (None, '\'') | (None, '"') => {
        if let Some((name, len)) = placeholder_at(&chars, i + 1) {
          if chars.get(i + 1 + len) == Some(&c) {
            params.push(dates.resolve(&name)?);
            out.push('?');
            i += len + 2;
            continue;
          }
        }
        quote = Some(c);
        out.push(c);
        i += 1;
      }
      (None, '`') => {
        quote = Some(c);
        out.push(c);
        i += 1;
      }
      (Some(q), _) if c == q => {
        out.push(c);
        if chars.get(i + 1) == Some(&q) {
          out.push(q);
          i += 2;
        } else {
          quote = None;
          i += 1;
        }
      }
      (_, '{') if chars.get(i + 1) == Some(&'{') => {
        out.push('{');
        i += 2;
      }
      (_, '}') if chars.get(i + 1) == Some(&'}') => {
        out.push('}');
        i += 2;
      }
      (_, '{') => match placeholder_at(&chars, i) {
        Some((name, len)) => {
          let value = dates.resolve(&name)?;
          if quote.is_some() {
            // Validated ISO date: digits and dashes only.
            out.push_str(&value);
          } else {
            out.push('?');
            params.push(value);
          }
          i += len;
        }
        None => {
          out.push(c);
          i += 1;
        }
      },
      _ => {
        out.push(c);
        i += 1;
      }
    }
  }

  Ok(BoundQuery { sql: out, params })
}

/// Validates caller input and turns placeholders into bound parameters.
pub fn prepare_query(
  sql_query: &str,
  start_date: Option<&str>,
  end_date: Option<&str>,
) -> Result<BoundQuery, QueryToolError> {
  let sql = sql_query.trim();
  if !sql.to_uppercase().starts_with("SELECT") {
    return Err(QueryToolError::NotSelect);
  }

  let dates = DateParams {
    start_date: normalize_date("start_date", start_date)?,
    end_date: normalize_date("end_date", end_date)?,
  };
  expand_template(sql, &dates)
}

fn column_value(row: &SqliteRow, idx: usize) -> Result<Value, sqlx::Error> {
  let raw = row.try_get_raw(idx)?;
  if raw.is_null() {
    return Ok(Value::Null);
  }
  let type_name = raw.type_info().name().to_string();

  let value = match type_name.as_str() {
    "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
    "REAL" | "NUMERIC" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
      .map(Value::Number)
      .unwrap_or(Value::Null),
    "BLOB" => {
      let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
      Value::String(String::from_utf8_lossy(&bytes).into_owned())
    }
    _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
  };
  Ok(value)
}

fn row_to_json(row: &SqliteRow) -> Result<Map<String, Value>, sqlx::Error> {
  let mut map = Map::new();
  for (idx, column) in row.columns().iter().enumerate() {
    map.insert(column.name().to_string(), column_value(row, idx)?);
  }
  Ok(map)
}

async fn execute(pool: &SqlitePool, bound: &BoundQuery) -> Result<Vec<Map<String, Value>>, sqlx::Error> {
  let mut query = sqlx::query(&bound.sql);
  for param in &bound.params {
    query = query.bind(param.clone());
  }
  let rows = query.fetch_all(pool).await?;
  rows.iter().map(row_to_json).collect()
}

pub async fn run_query(
  pool: &SqlitePool,
  sql_query: &str,
  start_date: Option<&str>,
  end_date: Option<&str>,
) -> Result<QueryToolOutput, QueryToolError> {
  let bound = prepare_query(sql_query, start_date, end_date)?;

  let results = match execute(pool, &bound).await {
    Ok(rows) => rows,
    Err(err) => {
      warn!(error = %err, sql = %bound.sql, "analytics query failed; returning no rows");
      Vec::new()
    }
  };

  Ok(QueryToolOutput {
    success: true,
    results,
  })
}
