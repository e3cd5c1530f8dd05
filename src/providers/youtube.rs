use std::path::Path;

use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
  AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
  PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use vercel_runtime::Error;

/// Covers Analytics `reports.query` and the Data API `channels.list?mine=true` lookup.
pub const YOUTUBE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub type YoutubeOAuthClient =
  BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

#[derive(Debug, Clone, Serialize)]
pub struct YoutubeOAuthTokens {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: String,
  pub scope: Option<String>,
  pub expires_in_seconds: Option<u64>,
}

/// OAuth client identity as downloaded from the Google Cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientSecret {
  pub client_id: String,
  pub client_secret: String,
  #[serde(default)]
  pub auth_uri: Option<String>,
  #[serde(default)]
  pub token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
  installed: Option<OAuthClientSecret>,
  web: Option<OAuthClientSecret>,
}

pub fn parse_client_secret(json: &str) -> Result<OAuthClientSecret, Error> {
  let parsed: ClientSecretFile = serde_json::from_str(json).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid client secret json: {e}")))
  })?;

  parsed.installed.or(parsed.web).ok_or_else(|| {
    Box::new(std::io::Error::other(
      "client secret json has neither an \"installed\" nor a \"web\" section",
    )) as Error
  })
}

pub fn load_client_secret(path: &Path) -> Result<OAuthClientSecret, Error> {
  let raw = std::fs::read_to_string(path).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!(
      "failed to read client secret file {}: {e}",
      path.display()
    )))
  })?;
  parse_client_secret(&raw)
}

pub fn youtube_oauth_client_from_config(
  secret: &OAuthClientSecret,
  redirect_uri: &str,
) -> Result<YoutubeOAuthClient, Error> {
  if secret.client_id.trim().is_empty() {
    return Err(Box::new(std::io::Error::other("Missing OAuth client_id")) as Error);
  }
  if secret.client_secret.trim().is_empty() {
    return Err(Box::new(std::io::Error::other("Missing OAuth client_secret")) as Error);
  }

  let auth_uri = secret
    .auth_uri
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .unwrap_or(GOOGLE_AUTH_URI);
  let token_uri = secret
    .token_uri
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .unwrap_or(GOOGLE_TOKEN_URI);

  let auth_url = AuthUrl::new(auth_uri.to_string())
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;
  let token_url = TokenUrl::new(token_uri.to_string())
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;
  let redirect_url = RedirectUrl::new(redirect_uri.to_string())
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;

  Ok(
    BasicClient::new(ClientId::new(secret.client_id.clone()))
      .set_client_secret(ClientSecret::new(secret.client_secret.clone()))
      .set_auth_uri(auth_url)
      .set_token_uri(token_url)
      .set_redirect_uri(redirect_url),
  )
}

/// Returns `(authorize_url, csrf_state)`.
pub fn build_authorize_url(
  client: &YoutubeOAuthClient,
  pkce_challenge: PkceCodeChallenge,
  state: Option<String>,
) -> (String, String) {
  let (url, csrf) = client
    .authorize_url(|| state.clone().map(CsrfToken::new).unwrap_or_else(CsrfToken::new_random))
    .add_scope(Scope::new(YOUTUBE_READONLY_SCOPE.to_string()))
    .set_pkce_challenge(pkce_challenge)
    .add_extra_param("access_type", "offline")
    .add_extra_param("prompt", "consent")
    .url();

  (url.to_string(), csrf.secret().to_string())
}

fn oauth_http_client() -> Result<oauth2::reqwest::Client, Error> {
  oauth2::reqwest::ClientBuilder::new()
    .redirect(oauth2::reqwest::redirect::Policy::none())
    .build()
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)
}

fn tokens_from_response(token: &BasicTokenResponse) -> YoutubeOAuthTokens {
  YoutubeOAuthTokens {
    access_token: token.access_token().secret().to_string(),
    refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
    token_type: token.token_type().as_ref().to_string(),
    scope: token
      .scopes()
      .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")),
    expires_in_seconds: token.expires_in().map(|d| d.as_secs()),
  }
}

pub async fn exchange_code_for_tokens(
  client: &YoutubeOAuthClient,
  code: &str,
  pkce_verifier: PkceCodeVerifier,
) -> Result<YoutubeOAuthTokens, Error> {
  let http_client = oauth_http_client()?;

  let token = client
    .exchange_code(AuthorizationCode::new(code.to_string()))
    .set_pkce_verifier(pkce_verifier)
    .request_async(&http_client)
    .await
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;

  Ok(tokens_from_response(&token))
}

pub async fn refresh_tokens(
  client: &YoutubeOAuthClient,
  refresh_token: &str,
) -> Result<YoutubeOAuthTokens, Error> {
  let http_client = oauth_http_client()?;

  let token = client
    .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;

  Ok(tokens_from_response(&token))
}
