use std::path::Path;

use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{info, warn};
use vercel_runtime::Error;

use crate::providers::youtube_analytics::ChannelDailyMetricRow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
  pub inserted: usize,
  pub skipped: usize,
  pub failed: usize,
}

pub async fn connect(path: &Path) -> Result<SqlitePool, Error> {
  let options = SqliteConnectOptions::new()
    .filename(path)
    .create_if_missing(true);

  SqlitePoolOptions::new()
    .max_connections(1)
    .connect_with(options)
    .await
    .map_err(|e| -> Error { Box::new(e) })
}

/// Read-only handle for the query path; the file must already exist.
pub async fn open_read_only(path: &Path) -> Result<SqlitePool, Error> {
  let options = SqliteConnectOptions::new()
    .filename(path)
    .read_only(true)
    .create_if_missing(false);

  SqlitePoolOptions::new()
    .max_connections(1)
    .connect_with(options)
    .await
    .map_err(|e| -> Error { Box::new(e) })
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), Error> {
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS youtube_analytics (
        date TEXT PRIMARY KEY,
        estimated_minutes_watched INTEGER,
        views INTEGER,
        likes INTEGER,
        subscribers_gained INTEGER,
        average_view_duration INTEGER,
        average_view_percentage REAL,
        dislikes INTEGER,
        shares INTEGER
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}

/// Inserts rows whose date is not stored yet. Existing dates are never overwritten;
/// per-row insert errors are logged and counted rather than returned.
pub async fn upsert_daily_metrics(
  pool: &SqlitePool,
  rows: &[ChannelDailyMetricRow],
) -> Result<UpsertSummary, Error> {
  let mut summary = UpsertSummary::default();
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;

  for row in rows {
    let day = row.date.format("%Y-%m-%d").to_string();
    let result = sqlx::query(
      r#"
        INSERT INTO youtube_analytics
          (date, estimated_minutes_watched, views, likes, subscribers_gained,
           average_view_duration, average_view_percentage, dislikes, shares)
        VALUES
          (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(date) DO NOTHING;
      "#,
    )
    .bind(&day)
    .bind(row.estimated_minutes_watched)
    .bind(row.views)
    .bind(row.likes)
    .bind(row.subscribers_gained)
    .bind(row.average_view_duration)
    .bind(row.average_view_percentage)
    .bind(row.dislikes)
    .bind(row.shares)
    .execute(&mut *tx)
    .await;

    match result {
      Ok(done) if done.rows_affected() > 0 => {
        info!(date = %day, "inserted daily metrics");
        summary.inserted += 1;
      }
      Ok(_) => {
        info!(date = %day, "daily metrics already stored, skipping");
        summary.skipped += 1;
      }
      Err(err) => {
        warn!(date = %day, error = %err, "failed to insert daily metrics");
        summary.failed += 1;
      }
    }
  }

  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;
  Ok(summary)
}

pub async fn latest_stored_date(pool: &SqlitePool) -> Result<Option<NaiveDate>, Error> {
  let max_date: Option<String> = sqlx::query_scalar("SELECT MAX(date) FROM youtube_analytics;")
    .fetch_one(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  Ok(max_date.and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok()))
}

pub async fn count_daily_metrics(pool: &SqlitePool) -> Result<i64, Error> {
  sqlx::query_scalar("SELECT COUNT(*) FROM youtube_analytics;")
    .fetch_one(pool)
    .await
    .map_err(|e| -> Error { Box::new(e) })
}
