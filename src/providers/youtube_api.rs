use vercel_runtime::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelIdentity {
  pub channel_id: String,
  pub title: Option<String>,
}

/// Resolves which channel `ids=channel==MINE` will report on for this token.
pub async fn fetch_my_channel_with_base_url(access_token: &str, base_url: &str) -> Result<ChannelIdentity, Error> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?
    .https_or_http()
    .enable_http1()
    .build();

  let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let mut hub = google_youtube3::YouTube::new(client, access_token.to_string());
  hub.base_url(base_url.to_string());
  hub.root_url(base_url.to_string());

  let (_, response) = hub
    .channels()
    .list(&vec!["id".into(), "snippet".into()])
    .mine(true)
    .doit()
    .await
    .map_err(|e| Box::new(std::io::Error::other(e.to_string())) as Error)?;

  response
    .items
    .unwrap_or_default()
    .into_iter()
    .find_map(|c| {
      let title = c.snippet.as_ref().and_then(|s| s.title.clone());
      c.id.map(|channel_id| ChannelIdentity { channel_id, title })
    })
    .ok_or_else(|| Box::new(std::io::Error::other("No channel found for this token")) as Error)
}

pub async fn fetch_my_channel(access_token: &str) -> Result<ChannelIdentity, Error> {
  fetch_my_channel_with_base_url(access_token, "https://youtube.googleapis.com/").await
}
