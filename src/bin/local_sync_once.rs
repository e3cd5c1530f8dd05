use chrono::{Duration, NaiveDate, Utc};
use tracing::{info, warn};
use vercel_runtime::Error;

use yt_analytics_store::config::AppConfig;
use yt_analytics_store::credentials::{CredentialProvider, FileTokenStore};
use yt_analytics_store::db::{
  connect, count_daily_metrics, ensure_schema, latest_stored_date, upsert_daily_metrics,
};
use yt_analytics_store::logging::init_tracing;
use yt_analytics_store::providers::youtube::load_client_secret;
use yt_analytics_store::providers::youtube_analytics::{
  fetch_daily_channel_metrics_with_base_url, parse_daily_metric_rows,
  youtube_analytics_error_to_vercel_error,
};
use yt_analytics_store::providers::youtube_api::fetch_my_channel;

const DEFAULT_DAYS: i64 = 28;

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

/// Explicit `--start` wins, then the latest stored day (re-fetched, then skipped
/// by the upsert), then `end - days`.
fn resolve_range(
  start_arg: Option<NaiveDate>,
  end_arg: Option<NaiveDate>,
  days_arg: Option<i64>,
  latest_stored: Option<NaiveDate>,
  today: NaiveDate,
) -> (NaiveDate, NaiveDate) {
  let end_dt = end_arg.unwrap_or(today);
  let days = days_arg.unwrap_or(DEFAULT_DAYS).clamp(1, 365);
  let start_dt = start_arg
    .or(latest_stored)
    .unwrap_or_else(|| end_dt - Duration::days(days));
  (start_dt, end_dt)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  let config = AppConfig::from_env()?;
  let args: Vec<String> = std::env::args().collect();

  let start_arg = parse_flag_value(&args, "--start-dt")
    .or_else(|| parse_flag_value(&args, "--start"))
    .and_then(|v| parse_dt(&v));
  let end_arg = parse_flag_value(&args, "--end-dt")
    .or_else(|| parse_flag_value(&args, "--end"))
    .and_then(|v| parse_dt(&v));
  let days_arg = parse_flag_value(&args, "--days").and_then(|v| v.parse::<i64>().ok());

  let pool = connect(&config.db_path).await?;
  ensure_schema(&pool).await?;

  let latest = latest_stored_date(&pool).await?;
  let today = Utc::now().date_naive();
  let (start_dt, end_dt) = resolve_range(start_arg, end_arg, days_arg, latest, today);

  if start_dt > end_dt {
    eprintln!("Invalid range: start_dt ({start_dt}) > end_dt ({end_dt})");
    return Ok(());
  }

  let before_rows = count_daily_metrics(&pool).await?;

  let secret = load_client_secret(&config.client_secret_file)?;
  let provider = CredentialProvider::new(
    secret,
    FileTokenStore::new(&config.token_file),
    config.callback_port,
  );
  let token = provider.obtain().await?;

  match fetch_my_channel(&token.access_token).await {
    Ok(identity) => info!(
      channel_id = %identity.channel_id,
      title = identity.title.as_deref().unwrap_or("unknown"),
      "token resolves to channel"
    ),
    Err(err) => warn!(error = %err, "failed to resolve channel for token via YouTube Data API"),
  }

  let raw = fetch_daily_channel_metrics_with_base_url(
    &token.access_token,
    &config.analytics_base_url,
    start_dt,
    end_dt,
  )
  .await
  .map_err(youtube_analytics_error_to_vercel_error)?;
  info!(%start_dt, %end_dt, "YouTube Analytics data retrieved");

  let rows = parse_daily_metric_rows(&raw);
  let summary = upsert_daily_metrics(&pool, &rows).await?;
  let after_rows = count_daily_metrics(&pool).await?;
  pool.close().await;

  println!(
    "ok=true start_dt={} end_dt={} fetched_rows={} inserted={} skipped={} failed={} rows_before={} rows_after={}",
    start_dt,
    end_dt,
    rows.len(),
    summary.inserted,
    summary.skipped,
    summary.failed,
    before_rows,
    after_rows,
  );

  Ok(())
}
