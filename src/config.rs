use std::path::PathBuf;

use vercel_runtime::Error;

pub const DEFAULT_DB_PATH: &str = "yt_analytics.db";
pub const DEFAULT_TOKEN_FILE: &str = "token.json";
pub const DEFAULT_CLIENT_SECRET_FILE: &str = "client_secret.json";
pub const DEFAULT_CALLBACK_PORT: u16 = 8090;
pub const DEFAULT_ANALYTICS_BASE_URL: &str = "https://youtubeanalytics.googleapis.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
  pub db_path: PathBuf,
  pub token_file: PathBuf,
  pub client_secret_file: PathBuf,
  pub callback_port: u16,
  pub analytics_base_url: String,
}

fn env_or(key: &str, default: &str) -> String {
  std::env::var(key)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
    .unwrap_or_else(|| default.to_string())
}

fn parse_port(raw: &str) -> Result<u16, Error> {
  raw.trim().parse::<u16>().map_err(|_| {
    Box::new(std::io::Error::other(format!(
      "Invalid YOUTUBE_OAUTH_CALLBACK_PORT: {raw:?}"
    ))) as Error
  })
}

impl AppConfig {
  pub fn from_env() -> Result<Self, Error> {
    let callback_port = match std::env::var("YOUTUBE_OAUTH_CALLBACK_PORT") {
      Ok(raw) if !raw.trim().is_empty() => parse_port(&raw)?,
      _ => DEFAULT_CALLBACK_PORT,
    };

    Ok(Self {
      db_path: PathBuf::from(env_or("YT_ANALYTICS_DB_PATH", DEFAULT_DB_PATH)),
      token_file: PathBuf::from(env_or("YOUTUBE_TOKEN_FILE", DEFAULT_TOKEN_FILE)),
      client_secret_file: PathBuf::from(env_or(
        "YOUTUBE_CLIENT_SECRET_FILE",
        DEFAULT_CLIENT_SECRET_FILE,
      )),
      callback_port,
      analytics_base_url: env_or("YOUTUBE_ANALYTICS_BASE_URL", DEFAULT_ANALYTICS_BASE_URL),
    })
  }
}
