use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use yt_analytics_store::config::AppConfig;
use yt_analytics_store::db::open_read_only;
use yt_analytics_store::logging::init_tracing;
use yt_analytics_store::query_tool::run_query;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

#[derive(Deserialize)]
struct QueryRequest {
  sql_query: String,
  #[serde(default)]
  start_date: Option<String>,
  #[serde(default)]
  end_date: Option<String>,
}

async fn handle_query(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  let parsed: QueryRequest = match serde_json::from_slice(&body) {
    Ok(v) => v,
    Err(e) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
      );
    }
  };

  let config = AppConfig::from_env()?;
  let pool = match open_read_only(&config.db_path).await {
    Ok(pool) => pool,
    Err(err) => {
      warn!(path = %config.db_path.display(), error = %err, "analytics store unavailable");
      return json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        serde_json::json!({"ok": false, "error": "store_unavailable", "message": err.to_string()}),
      );
    }
  };

  let outcome = run_query(
    &pool,
    &parsed.sql_query,
    parsed.start_date.as_deref(),
    parsed.end_date.as_deref(),
  )
  .await;
  pool.close().await;

  match outcome {
    Ok(output) => {
      info!(rows = output.results.len(), "analytics query served");
      json_response(StatusCode::OK, serde_json::to_value(output)?)
    }
    Err(err) => json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "invalid_query", "message": err.to_string()}),
    ),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_query(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}
