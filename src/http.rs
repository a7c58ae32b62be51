use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use swrc::CursorPage;
use url::Url;

/// JSON-over-HTTP client used as the fetch function for cached keys.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.network.timeout_ms))
      .user_agent(concat!("swrc/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      token: Config::get_api_token(),
    })
  }

  /// Underlying client, shared with the network probe.
  pub fn http(&self) -> &reqwest::Client {
    &self.http
  }

  /// GET `url` and decode the body as JSON.
  pub async fn get_json(&self, url: &str) -> Result<Value> {
    let mut request = self.http.get(url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("GET {} returned {}", url, status));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Fetch one page of a `{next, previous, results}` endpoint.
  pub async fn get_page(&self, base: &str, cursor: Option<&str>) -> Result<CursorPage<Value>> {
    let url = page_url(base, cursor)?;
    let body = self.get_json(url.as_str()).await?;
    serde_json::from_value(body).map_err(|e| eyre!("Unexpected page shape from {}: {}", url, e))
  }
}

/// `base` with its `cursor` query parameter set to `cursor`.
pub fn page_url(base: &str, cursor: Option<&str>) -> Result<Url> {
  let mut url = Url::parse(base).map_err(|e| eyre!("Invalid URL {}: {}", base, e))?;
  if let Some(cursor) = cursor {
    let retained: Vec<(String, String)> = url
      .query_pairs()
      .filter(|(name, _)| name != "cursor")
      .map(|(name, value)| (name.into_owned(), value.into_owned()))
      .collect();
    url
      .query_pairs_mut()
      .clear()
      .extend_pairs(retained)
      .append_pair("cursor", cursor);
  }
  Ok(url)
}
