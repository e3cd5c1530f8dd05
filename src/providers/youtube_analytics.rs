use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use serde_json::Value;
use vercel_runtime::Error;

pub const DAILY_CHANNEL_METRICS: &str = "estimatedMinutesWatched,views,likes,subscribersGained,averageViewDuration,averageViewPercentage,dislikes,shares";

/// One calendar day of channel totals, in `youtube_analytics` column order.
/// Metrics absent from the report stay `None` and are stored as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDailyMetricRow {
  pub date: NaiveDate,
  pub estimated_minutes_watched: Option<i64>,
  pub views: Option<i64>,
  pub likes: Option<i64>,
  pub subscribers_gained: Option<i64>,
  pub average_view_duration: Option<i64>,
  pub average_view_percentage: Option<f64>,
  pub dislikes: Option<i64>,
  pub shares: Option<i64>,
}

#[derive(Debug)]
pub struct YoutubeAnalyticsError {
  pub status: Option<u16>,
  pub message: String,
}

impl std::fmt::Display for YoutubeAnalyticsError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(status) = self.status {
      write!(f, "YouTube Analytics error (status {status}): {}", self.message)
    } else {
      write!(f, "YouTube Analytics error: {}", self.message)
    }
  }
}

impl std::error::Error for YoutubeAnalyticsError {}

pub fn build_daily_channel_report_url(base_url: &str, start_dt: NaiveDate, end_dt: NaiveDate) -> String {
  let base = base_url.trim_end_matches('/');
  format!(
    "{base}/v2/reports?ids=channel==MINE&startDate={}&endDate={}&metrics={DAILY_CHANNEL_METRICS}&dimensions=day&sort=day",
    start_dt, end_dt
  )
}

fn metric_f64(arr: &[Value], idx: Option<usize>) -> Option<f64> {
  let v = arr.get(idx?)?;
  v.as_f64()
    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    .filter(|n: &f64| n.is_finite())
}

fn metric_i64(arr: &[Value], idx: Option<usize>) -> Option<i64> {
  let v = arr.get(idx?)?;
  v.as_i64().or_else(|| metric_f64(arr, idx).map(|n| n.round() as i64))
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndexes {
  day: usize,
  minutes: Option<usize>,
  views: Option<usize>,
  likes: Option<usize>,
  subscribers: Option<usize>,
  avg_duration: Option<usize>,
  avg_percentage: Option<usize>,
  dislikes: Option<usize>,
  shares: Option<usize>,
}

impl ColumnIndexes {
  // Request order: day first, then DAILY_CHANNEL_METRICS.
  fn positional() -> Self {
    Self {
      day: 0,
      minutes: Some(1),
      views: Some(2),
      likes: Some(3),
      subscribers: Some(4),
      avg_duration: Some(5),
      avg_percentage: Some(6),
      dislikes: Some(7),
      shares: Some(8),
    }
  }

  fn from_headers(headers: &[Value]) -> Option<Self> {
    let mut idx = Self {
      day: usize::MAX,
      minutes: None,
      views: None,
      likes: None,
      subscribers: None,
      avg_duration: None,
      avg_percentage: None,
      dislikes: None,
      shares: None,
    };

    for (i, h) in headers.iter().enumerate() {
      let name = h.get("name").and_then(|v| v.as_str()).unwrap_or("");
      match name {
        "day" => idx.day = i,
        "estimatedMinutesWatched" => idx.minutes = Some(i),
        "views" => idx.views = Some(i),
        "likes" => idx.likes = Some(i),
        "subscribersGained" => idx.subscribers = Some(i),
        "averageViewDuration" => idx.avg_duration = Some(i),
        "averageViewPercentage" => idx.avg_percentage = Some(i),
        "dislikes" => idx.dislikes = Some(i),
        "shares" => idx.shares = Some(i),
        _ => {}
      }
    }

    if idx.day == usize::MAX {
      return None;
    }
    Some(idx)
  }
}

pub fn parse_daily_metric_rows(json: &Value) -> Vec<ChannelDailyMetricRow> {
  let headers = json
    .get("columnHeaders")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default();

  let idx = if headers.is_empty() {
    ColumnIndexes::positional()
  } else {
    match ColumnIndexes::from_headers(&headers) {
      Some(v) => v,
      None => return vec![],
    }
  };

  let rows = json
    .get("rows")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default();

  let mut out = Vec::with_capacity(rows.len());

  for row in rows {
    let arr = match row.as_array() {
      Some(a) => a,
      None => continue,
    };

    let day_str = arr.get(idx.day).and_then(|v| v.as_str()).unwrap_or("");
    let date = match NaiveDate::parse_from_str(day_str, "%Y-%m-%d") {
      Ok(d) => d,
      Err(_) => continue,
    };

    out.push(ChannelDailyMetricRow {
      date,
      estimated_minutes_watched: metric_i64(arr, idx.minutes),
      views: metric_i64(arr, idx.views),
      likes: metric_i64(arr, idx.likes),
      subscribers_gained: metric_i64(arr, idx.subscribers),
      average_view_duration: metric_i64(arr, idx.avg_duration),
      average_view_percentage: metric_f64(arr, idx.avg_percentage),
      dislikes: metric_i64(arr, idx.dislikes),
      shares: metric_i64(arr, idx.shares),
    });
  }

  out
}

async fn fetch_report_json_by_url(access_token: &str, url: &str) -> Result<Value, YoutubeAnalyticsError> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| YoutubeAnalyticsError {
      status: None,
      message: e.to_string(),
    })?
    .https_or_http()
    .enable_http1()
    .build();

  let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let req = Request::builder()
    .method(Method::GET)
    .uri(url)
    .header(AUTHORIZATION, format!("Bearer {}", access_token))
    .header(ACCEPT, "application/json")
    .body(Empty::<Bytes>::new())
    .map_err(|e| YoutubeAnalyticsError {
      status: None,
      message: e.to_string(),
    })?;

  let resp = client
    .request(req)
    .await
    .map_err(|e| YoutubeAnalyticsError {
      status: None,
      message: e.to_string(),
    })?;

  let status = resp.status();
  let body_bytes = resp
    .into_body()
    .collect()
    .await
    .map_err(|e| YoutubeAnalyticsError {
      status: Some(status.as_u16()),
      message: e.to_string(),
    })?
    .to_bytes();

  if status != StatusCode::OK {
    let msg = String::from_utf8_lossy(&body_bytes);
    let msg = msg.chars().take(800).collect::<String>();
    return Err(YoutubeAnalyticsError {
      status: Some(status.as_u16()),
      message: format!("{msg} (url: {url})"),
    });
  }

  serde_json::from_slice::<Value>(&body_bytes).map_err(|e| YoutubeAnalyticsError {
    status: Some(status.as_u16()),
    message: format!("invalid json response: {e}"),
  })
}

/// Single report request; the day-level metric set fits in one response.
pub async fn fetch_daily_channel_metrics_with_base_url(
  access_token: &str,
  base_url: &str,
  start_dt: NaiveDate,
  end_dt: NaiveDate,
) -> Result<Value, YoutubeAnalyticsError> {
  let url = build_daily_channel_report_url(base_url, start_dt, end_dt);
  fetch_report_json_by_url(access_token, &url).await
}

pub fn youtube_analytics_error_to_vercel_error(err: YoutubeAnalyticsError) -> Error {
  Box::new(err) as Error
}
