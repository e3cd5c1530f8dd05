//! OAuth credential provider for the analytics ingestion path.
//!
//! A cached token is loaded through a [`TokenStore`]. Expired tokens with a
//! refresh token are refreshed; anything else goes through the interactive
//! consent flow, which listens on a loopback port for Google's redirect.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use oauth2::PkceCodeChallenge;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use vercel_runtime::Error;

use crate::providers::youtube::{
  build_authorize_url, exchange_code_for_tokens, refresh_tokens, youtube_oauth_client_from_config,
  OAuthClientSecret, YoutubeOAuthTokens,
};

/// Tokens expiring within this window are treated as already expired.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: String,
  pub scope: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
  /// Token endpoints may omit the refresh token on refresh; keep the previous one then.
  pub fn from_oauth(tokens: YoutubeOAuthTokens, previous_refresh_token: Option<String>, now: DateTime<Utc>) -> Self {
    Self {
      access_token: tokens.access_token,
      refresh_token: tokens.refresh_token.or(previous_refresh_token),
      token_type: tokens.token_type,
      scope: tokens.scope,
      expires_at: tokens
        .expires_in_seconds
        .map(|secs| now + Duration::seconds(secs as i64)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
  Missing,
  Valid,
  ExpiredRefreshable,
  ExpiredUnrefreshable,
}

impl TokenState {
  pub fn classify(token: Option<&StoredToken>, now: DateTime<Utc>) -> Self {
    let token = match token {
      Some(t) if !t.access_token.trim().is_empty() => t,
      Some(t) if has_refresh_token(t) => return TokenState::ExpiredRefreshable,
      Some(_) => return TokenState::ExpiredUnrefreshable,
      None => return TokenState::Missing,
    };

    let expired = token
      .expires_at
      .map(|at| at <= now + Duration::seconds(EXPIRY_SKEW_SECONDS))
      .unwrap_or(false);

    match (expired, has_refresh_token(token)) {
      (false, _) => TokenState::Valid,
      (true, true) => TokenState::ExpiredRefreshable,
      (true, false) => TokenState::ExpiredUnrefreshable,
    }
  }
}

fn has_refresh_token(token: &StoredToken) -> bool {
  token
    .refresh_token
    .as_deref()
    .map(|v| !v.trim().is_empty())
    .unwrap_or(false)
}

pub trait TokenStore {
  fn load(&self) -> Result<Option<StoredToken>, Error>;
  fn save(&self, token: &StoredToken) -> Result<(), Error>;
}

/// JSON token cache on local disk.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
  path: PathBuf,
}

impl FileTokenStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

impl TokenStore for FileTokenStore {
  fn load(&self) -> Result<Option<StoredToken>, Error> {
    if !self.path.exists() {
      return Ok(None);
    }

    let raw = match std::fs::read(&self.path) {
      Ok(raw) => raw,
      Err(err) => {
        warn!(path = %self.path.display(), error = %err, "ignoring unreadable token cache");
        return Ok(None);
      }
    };
    match serde_json::from_slice::<StoredToken>(&raw) {
      Ok(token) => {
        info!(path = %self.path.display(), "loaded cached credentials");
        Ok(Some(token))
      }
      Err(err) => {
        warn!(path = %self.path.display(), error = %err, "ignoring unreadable token cache");
        Ok(None)
      }
    }
  }

  fn save(&self, token: &StoredToken) -> Result<(), Error> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|e| -> Error { Box::new(e) })?;
    }
    let json = serde_json::to_vec_pretty(token).map_err(|e| -> Error { Box::new(e) })?;
    std::fs::write(&self.path, json).map_err(|e| -> Error { Box::new(e) })?;
    info!(path = %self.path.display(), "saved credentials for future use");
    Ok(())
  }
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
  token: Mutex<Option<StoredToken>>,
}

impl MemoryTokenStore {
  pub fn new(token: Option<StoredToken>) -> Self {
    Self {
      token: Mutex::new(token),
    }
  }

  pub fn snapshot(&self) -> Option<StoredToken> {
    self.token.lock().map(|t| t.clone()).unwrap_or(None)
  }
}

impl TokenStore for MemoryTokenStore {
  fn load(&self) -> Result<Option<StoredToken>, Error> {
    let guard = self
      .token
      .lock()
      .map_err(|_| Box::new(std::io::Error::other("token store lock poisoned")) as Error)?;
    Ok(guard.clone())
  }

  fn save(&self, token: &StoredToken) -> Result<(), Error> {
    let mut guard = self
      .token
      .lock()
      .map_err(|_| Box::new(std::io::Error::other("token store lock poisoned")) as Error)?;
    *guard = Some(token.clone());
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CallbackOutcome {
  Code { code: String, state: String },
  Denied(String),
}

fn parse_callback_query(query: Option<&str>) -> Option<CallbackOutcome> {
  let q = query?;
  let mut code = None;
  let mut state = None;
  let mut error = None;
  for (k, v) in oauth2::url::form_urlencoded::parse(q.as_bytes()) {
    match &*k {
      "code" => code = Some(v.into_owned()),
      "state" => state = Some(v.into_owned()),
      "error" => error = Some(v.into_owned()),
      _ => {}
    }
  }

  if let Some(error) = error {
    return Some(CallbackOutcome::Denied(error));
  }
  code.map(|code| CallbackOutcome::Code {
    code,
    state: state.unwrap_or_default(),
  })
}

/// Loopback listener that receives the OAuth redirect.
pub struct ConsentListener {
  listener: TcpListener,
  addr: SocketAddr,
}

impl ConsentListener {
  pub async fn bind(port: u16) -> Result<Self, Error> {
    let listener = TcpListener::bind(("127.0.0.1", port))
      .await
      .map_err(|e| -> Error {
        Box::new(std::io::Error::other(format!(
          "failed to bind OAuth callback listener on 127.0.0.1:{port}: {e}"
        )))
      })?;
    let addr = listener.local_addr().map_err(|e| -> Error { Box::new(e) })?;
    Ok(Self { listener, addr })
  }

  pub fn redirect_uri(&self) -> String {
    format!("http://127.0.0.1:{}/", self.addr.port())
  }

  /// Serves requests until one carries `code` or `error`, then returns the code.
  /// Each connection runs on its own task so an idle preconnect socket cannot
  /// hold up the redirect.
  pub async fn wait_for_code(self, expected_state: &str) -> Result<String, Error> {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallbackOutcome>();

    let outcome = loop {
      tokio::select! {
        accepted = self.listener.accept() => {
          let (stream, _) = accepted.map_err(|e| -> Error { Box::new(e) })?;
          tokio::spawn(serve_callback_connection(stream, tx.clone()));
        }
        Some(outcome) = rx.recv() => break outcome,
      }
    };

    match outcome {
      CallbackOutcome::Code { code, state } => {
        if state != expected_state {
          return Err(Box::new(std::io::Error::other("OAuth state mismatch in consent callback")) as Error);
        }
        Ok(code)
      }
      CallbackOutcome::Denied(error) => {
        Err(Box::new(std::io::Error::other(format!("OAuth consent denied: {error}"))) as Error)
      }
    }
  }
}

async fn serve_callback_connection(stream: TcpStream, tx: mpsc::UnboundedSender<CallbackOutcome>) {
  let io = TokioIo::new(stream);
  let served = http1::Builder::new()
    .keep_alive(false)
    .serve_connection(
      io,
      service_fn(move |req: Request<Incoming>| {
        let tx = tx.clone();
        async move {
          let response = match parse_callback_query(req.uri().query()) {
            Some(outcome) => {
              let _ = tx.send(outcome);
              Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; charset=utf-8")
                .body(Full::new(Bytes::from_static(
                  b"Authorization received. You may close this window.",
                )))
            }
            None => Response::builder()
              .status(StatusCode::NOT_FOUND)
              .body(Full::new(Bytes::from_static(b"not found"))),
          };
          response
        }
      }),
    )
    .await;

  if let Err(err) = served {
    warn!(error = %err, "OAuth callback connection failed");
  }
}

type AuthorizePrompt = Box<dyn Fn(&str) + Send + Sync>;

pub struct CredentialProvider<S: TokenStore> {
  secret: OAuthClientSecret,
  store: S,
  callback_port: u16,
  prompt: AuthorizePrompt,
}

impl<S: TokenStore> CredentialProvider<S> {
  pub fn new(secret: OAuthClientSecret, store: S, callback_port: u16) -> Self {
    Self {
      secret,
      store,
      callback_port,
      prompt: Box::new(|url| {
        println!("Open this URL in a browser to authorize read-only analytics access:\n{url}");
      }),
    }
  }

  /// Replaces how the consent URL is shown to the operator.
  pub fn with_prompt(mut self, prompt: impl Fn(&str) + Send + Sync + 'static) -> Self {
    self.prompt = Box::new(prompt);
    self
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub async fn obtain(&self) -> Result<StoredToken, Error> {
    let cached = self.store.load()?;
    let state = TokenState::classify(cached.as_ref(), Utc::now());

    let token = match (state, cached) {
      (TokenState::Valid, Some(token)) => return Ok(token),
      (TokenState::ExpiredRefreshable, Some(token)) => {
        info!("refreshing access token");
        self.refresh(token).await?
      }
      (state, _) => {
        info!(?state, "fetching new tokens via consent flow");
        self.consent().await?
      }
    };

    self.store.save(&token)?;
    Ok(token)
  }

  async fn refresh(&self, token: StoredToken) -> Result<StoredToken, Error> {
    let refresh = token
      .refresh_token
      .clone()
      .ok_or_else(|| Box::new(std::io::Error::other("missing refresh token")) as Error)?;
    let redirect_uri = format!("http://127.0.0.1:{}/", self.callback_port);
    let client = youtube_oauth_client_from_config(&self.secret, &redirect_uri)?;
    let refreshed = refresh_tokens(&client, refresh.trim()).await?;
    Ok(StoredToken::from_oauth(refreshed, Some(refresh), Utc::now()))
  }

  async fn consent(&self) -> Result<StoredToken, Error> {
    let listener = ConsentListener::bind(self.callback_port).await?;
    let client = youtube_oauth_client_from_config(&self.secret, &listener.redirect_uri())?;
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let (authorize_url, state) = build_authorize_url(&client, challenge, None);

    (self.prompt)(&authorize_url);
    let code = listener.wait_for_code(&state).await?;

    let tokens = exchange_code_for_tokens(&client, &code, verifier).await?;
    Ok(StoredToken::from_oauth(tokens, None, Utc::now()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http_body_util::{BodyExt, Empty};
  use tokio::sync::mpsc::unbounded_channel;

  fn token(access: &str, refresh: Option<&str>, expires_at: Option<DateTime<Utc>>) -> StoredToken {
    StoredToken {
      access_token: access.to_string(),
      refresh_token: refresh.map(str::to_string),
      token_type: "bearer".to_string(),
      scope: None,
      expires_at,
    }
  }

  fn secret_for(token_uri: String) -> OAuthClientSecret {
    OAuthClientSecret {
      client_id: "id".to_string(),
      client_secret: "secret".to_string(),
      auth_uri: None,
      token_uri: Some(token_uri),
    }
  }

  #[test]
  fn classifies_token_states() {
    let now = Utc::now();
    let later = Some(now + Duration::hours(1));
    let earlier = Some(now - Duration::minutes(5));

    assert_eq!(TokenState::classify(None, now), TokenState::Missing);
    assert_eq!(TokenState::classify(Some(&token("a", None, later)), now), TokenState::Valid);
    assert_eq!(TokenState::classify(Some(&token("a", None, None)), now), TokenState::Valid);
    assert_eq!(
      TokenState::classify(Some(&token("a", Some("r"), earlier)), now),
      TokenState::ExpiredRefreshable
    );
    assert_eq!(
      TokenState::classify(Some(&token("a", None, earlier)), now),
      TokenState::ExpiredUnrefreshable
    );
    assert_eq!(
      TokenState::classify(Some(&token("a", Some("  "), earlier)), now),
      TokenState::ExpiredUnrefreshable
    );
  }

  #[test]
  fn near_expiry_counts_as_expired() {
    let now = Utc::now();
    let soon = Some(now + Duration::seconds(10));
    assert_eq!(
      TokenState::classify(Some(&token("a", Some("r"), soon)), now),
      TokenState::ExpiredRefreshable
    );
  }

  #[test]
  fn from_oauth_keeps_previous_refresh_token() {
    let now = Utc::now();
    let tokens = YoutubeOAuthTokens {
      access_token: "new".to_string(),
      refresh_token: None,
      token_type: "bearer".to_string(),
      scope: None,
      expires_in_seconds: Some(3600),
    };
    let stored = StoredToken::from_oauth(tokens, Some("old-refresh".to_string()), now);
    assert_eq!(stored.refresh_token.as_deref(), Some("old-refresh"));
    assert_eq!(stored.expires_at, Some(now + Duration::seconds(3600)));
  }

  #[test]
  fn parses_callback_queries() {
    assert_eq!(parse_callback_query(None), None);
    assert_eq!(parse_callback_query(Some("foo=bar")), None);
    assert_eq!(
      parse_callback_query(Some("state=s1&code=4%2F0Abc&scope=x")),
      Some(CallbackOutcome::Code {
        code: "4/0Abc".to_string(),
        state: "s1".to_string()
      })
    );
    assert_eq!(
      parse_callback_query(Some("error=access_denied&state=s1")),
      Some(CallbackOutcome::Denied("access_denied".to_string()))
    );
  }

  #[test]
  fn file_token_store_round_trips_and_tolerates_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("token.json");
    let store = FileTokenStore::new(&path);

    assert_eq!(store.load().unwrap(), None);

    let t = token("access", Some("refresh"), Some(Utc::now()));
    store.save(&t).unwrap();
    assert_eq!(store.load().unwrap(), Some(t));

    std::fs::write(&path, b"{not json").unwrap();
    assert_eq!(store.load().unwrap(), None);

    std::fs::write(&path, b"\x80\x04\x95pickle\xff").unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, None);
    assert_eq!(TokenState::classify(loaded.as_ref(), Utc::now()), TokenState::Missing);
  }

  #[tokio::test]
  async fn valid_token_is_returned_without_network() {
    let cached = token("still-good", Some("r"), Some(Utc::now() + Duration::hours(1)));
    let store = MemoryTokenStore::new(Some(cached.clone()));
    // An unreachable token endpoint proves nothing is called.
    let provider = CredentialProvider::new(secret_for("http://127.0.0.1:1/token".to_string()), store, 0);

    let got = provider.obtain().await.unwrap();
    assert_eq!(got, cached);
    assert_eq!(provider.store().snapshot(), Some(cached));
  }

  async fn serve_token_endpoint(listener: TcpListener, expected_grant: &'static str, reply: &'static str) {
    let (stream, _) = listener.accept().await.unwrap();
    let io = TokioIo::new(stream);
    http1::Builder::new()
      .serve_connection(
        io,
        service_fn(move |req: Request<Incoming>| async move {
          let body = req.into_body().collect().await?.to_bytes();
          let form = String::from_utf8_lossy(&body).to_string();
          let status = if form.contains(expected_grant) {
            StatusCode::OK
          } else {
            StatusCode::BAD_REQUEST
          };
          Ok::<_, hyper::Error>(
            Response::builder()
              .status(status)
              .header("content-type", "application/json")
              .body(Full::new(Bytes::from(reply)))
              .unwrap(),
          )
        }),
      )
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn expired_token_is_refreshed_and_saved() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(serve_token_endpoint(
      listener,
      "grant_type=refresh_token",
      r#"{"access_token":"refreshed","token_type":"Bearer","expires_in":3600}"#,
    ));

    let stale = token("stale", Some("keep-me"), Some(Utc::now() - Duration::hours(1)));
    let store = MemoryTokenStore::new(Some(stale));
    let provider = CredentialProvider::new(secret_for(format!("http://{}/token", addr)), store, 0);

    let got = provider.obtain().await.unwrap();
    assert_eq!(got.access_token, "refreshed");
    assert_eq!(got.refresh_token.as_deref(), Some("keep-me"));
    assert!(got.expires_at.unwrap() > Utc::now());
    assert_eq!(provider.store().snapshot(), Some(got));

    task.await.unwrap();
  }

  #[tokio::test]
  async fn rejected_refresh_propagates_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(serve_token_endpoint(
      listener,
      "grant_type=never_matches",
      r#"{"error":"invalid_grant"}"#,
    ));

    let stale = token("stale", Some("revoked"), Some(Utc::now() - Duration::hours(1)));
    let store = MemoryTokenStore::new(Some(stale.clone()));
    let provider = CredentialProvider::new(secret_for(format!("http://{}/token", addr)), store, 0);

    assert!(provider.obtain().await.is_err());
    assert_eq!(provider.store().snapshot(), Some(stale));

    task.await.unwrap();
  }

  async fn get(url: &str) -> StatusCode {
    let connector = hyper_util::client::legacy::connect::HttpConnector::new();
    let client =
      hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);
    let req = Request::builder()
      .uri(url)
      .body(Empty::<Bytes>::new())
      .unwrap();
    client.request(req).await.unwrap().status()
  }

  fn query_value(url: &str, key: &str) -> String {
    let parsed = oauth2::url::Url::parse(url).unwrap();
    parsed
      .query_pairs()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.into_owned())
      .unwrap()
  }

  #[tokio::test]
  async fn missing_token_runs_consent_flow() {
    let token_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let token_addr = token_listener.local_addr().unwrap();
    let token_task = tokio::spawn(serve_token_endpoint(
      token_listener,
      "grant_type=authorization_code",
      r#"{"access_token":"minted","refresh_token":"r-1","token_type":"Bearer","expires_in":3600}"#,
    ));

    let (url_tx, mut url_rx) = unbounded_channel::<String>();
    let provider = CredentialProvider::new(
      secret_for(format!("http://{}/token", token_addr)),
      MemoryTokenStore::default(),
      0,
    )
    .with_prompt(move |url| {
      let _ = url_tx.send(url.to_string());
    });

    let browser = tokio::spawn(async move {
      let url = url_rx.recv().await.unwrap();
      let redirect = query_value(&url, "redirect_uri");
      let state = query_value(&url, "state");
      assert_eq!(get(&format!("{redirect}favicon.ico")).await, StatusCode::NOT_FOUND);
      assert_eq!(get(&format!("{redirect}?code=abc&state={state}")).await, StatusCode::OK);
    });

    let got = provider.obtain().await.unwrap();
    assert_eq!(got.access_token, "minted");
    assert_eq!(got.refresh_token.as_deref(), Some("r-1"));
    assert_eq!(provider.store().snapshot(), Some(got));

    browser.await.unwrap();
    token_task.await.unwrap();
  }

  #[tokio::test]
  async fn consent_callback_with_wrong_state_fails() {
    let listener = ConsentListener::bind(0).await.unwrap();
    let redirect = listener.redirect_uri();

    let browser = tokio::spawn(async move {
      get(&format!("{redirect}?code=abc&state=forged")).await
    });

    let err = listener.wait_for_code("expected").await.unwrap_err();
    assert!(err.to_string().contains("state mismatch"));
    assert_eq!(browser.await.unwrap(), StatusCode::OK);
  }

  #[tokio::test]
  async fn consent_callback_with_error_fails() {
    let listener = ConsentListener::bind(0).await.unwrap();
    let redirect = listener.redirect_uri();

    let browser = tokio::spawn(async move {
      get(&format!("{redirect}?error=access_denied&state=s")).await
    });

    let err = listener.wait_for_code("s").await.unwrap_err();
    assert!(err.to_string().contains("access_denied"));
    browser.await.unwrap();
  }

  #[tokio::test]
  async fn idle_connection_does_not_block_redirect() {
    let listener = ConsentListener::bind(0).await.unwrap();
    let redirect = listener.redirect_uri();
    let addr = listener.addr;

    let browser = tokio::spawn(async move {
      // Preconnected socket that never sends a request.
      let _idle = TcpStream::connect(addr).await.unwrap();
      get(&format!("{redirect}?code=late&state=s")).await
    });

    let code = tokio::time::timeout(std::time::Duration::from_secs(5), listener.wait_for_code("s"))
      .await
      .expect("redirect should not wait on the idle socket")
      .unwrap();
    assert_eq!(code, "late");
    assert_eq!(browser.await.unwrap(), StatusCode::OK);
  }
}
