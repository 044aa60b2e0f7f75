use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use url::Url;

use super::types::{Method, Request, Response};

/// Network capability used by the strategy handlers and sync processors.
///
/// An `Err` means the request never produced a response (offline, DNS, reset).
/// Any HTTP status, including 4xx/5xx, is an `Ok` response.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Resolve a possibly relative request URL against the application origin.
pub fn resolve_url(origin: &Url, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => origin
      .join(raw)
      .map_err(|e| eyre!("Invalid request URL {}: {}", raw, e)),
    Err(e) => Err(eyre!("Invalid request URL {}: {}", raw, e)),
  }
}

/// reqwest-backed fetcher talking to the real network.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shelfcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = resolve_url(&self.origin, &request.url)?;

    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_relative_url() {
    let origin = Url::parse("http://localhost:4200").unwrap();
    let url = resolve_url(&origin, "/index.html").unwrap();
    assert_eq!(url.as_str(), "http://localhost:4200/index.html");
  }

  #[test]
  fn test_resolve_absolute_url_keeps_host() {
    let origin = Url::parse("http://localhost:4200").unwrap();
    let url = resolve_url(&origin, "https://covers.openlibrary.org/b/id/1-M.jpg").unwrap();
    assert_eq!(url.host_str(), Some("covers.openlibrary.org"));
  }
}
