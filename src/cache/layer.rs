//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::classifier::{PartitionKind, PartitionNames};
use super::storage::{CacheStorage, CachedEntry, Partition};
use super::traits::CacheResult;
use crate::config::CacheConfig;
use crate::http::{Fetcher, Request, Response};
use crate::metrics::PerformanceMetrics;

const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="128" height="192" viewBox="0 0 128 192"><rect width="128" height="192" fill="#e0e0e0"/><text x="64" y="100" font-family="sans-serif" font-size="12" text-anchor="middle" fill="#757575">No cover</text></svg>"##;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline - Book Search</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available without a network connection. Pages and books you have viewed before are still available.</p>
<button onclick="location.reload()">Try again</button>
</body>
</html>
"#;

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between intercepted requests and the network, choosing
/// a partition-specific strategy and falling back to cached or generated
/// responses when the network fails.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  metrics: Arc<PerformanceMetrics>,
  names: PartitionNames,
  /// How long before a cached API response is considered stale
  api_max_age: Duration,
  image_placeholder: Response,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  /// Create a new cache layer over the given storage backend and network.
  pub fn new(
    config: &CacheConfig,
    storage: Arc<S>,
    fetcher: Arc<F>,
    metrics: Arc<PerformanceMetrics>,
  ) -> Result<Self> {
    let image_placeholder = match &config.image_placeholder {
      Some(path) => load_placeholder(path)?,
      None => Response::new(200, "image/svg+xml", PLACEHOLDER_SVG),
    };

    Ok(Self {
      storage,
      fetcher,
      metrics,
      names: PartitionNames::new(config),
      api_max_age: Duration::from_std(config.api_max_age())
        .map_err(|e| eyre!("Invalid API max age: {}", e))?,
      image_placeholder,
    })
  }

  pub fn names(&self) -> &PartitionNames {
    &self.names
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn partition(&self, kind: PartitionKind) -> Partition<S> {
    Partition::new(self.names.name(kind), Arc::clone(&self.storage))
  }

  /// Check if a cached API response is stale based on its cached_at timestamp.
  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.api_max_age
  }

  /// Serve an intercepted GET request with the strategy owning `kind`.
  ///
  /// `request.url` must already be absolute.
  pub async fn handle(&self, kind: PartitionKind, request: &Request) -> Result<CacheResult<Response>> {
    match kind {
      PartitionKind::Static | PartitionKind::Image => self.cache_first(kind, request).await,
      PartitionKind::Api => self.stale_while_revalidate(request).await,
      PartitionKind::Dynamic => self.network_first(request).await,
    }
  }

  /// Cache-first: serve any cached copy, otherwise fetch and store.
  ///
  /// On network failure the partition is checked once more, then images get a
  /// placeholder and HTML documents an offline page. Anything else propagates.
  pub async fn cache_first(
    &self,
    kind: PartitionKind,
    request: &Request,
  ) -> Result<CacheResult<Response>> {
    let partition = self.partition(kind);

    if let Some(entry) = lookup(&partition, &request.url) {
      self.metrics.record_hit();
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }
    self.metrics.record_miss();

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          store(&partition, &request.url, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        // Another handler may have filled the entry while we were waiting
        if let Some(entry) = lookup(&partition, &request.url) {
          return Ok(CacheResult::offline(entry.response, entry.cached_at));
        }

        match kind {
          PartitionKind::Image => {
            debug!(url = %request.url, "Serving image placeholder");
            Ok(CacheResult::fallback(self.image_placeholder.clone()))
          }
          PartitionKind::Static if wants_document(request) => {
            debug!(url = %request.url, "Serving offline page");
            Ok(CacheResult::fallback(Response::html(503, OFFLINE_PAGE)))
          }
          _ => Err(err),
        }
      }
    }
  }

  /// Stale-while-revalidate for API responses.
  ///
  /// 1. Fresh cache: return immediately, refresh in the background
  /// 2. Stale or missing: fetch from network and store
  /// 3. On network failure, return stale cache (offline mode) or a 503 JSON body
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<CacheResult<Response>> {
    let partition = self.partition(PartitionKind::Api);
    let cached = lookup(&partition, &request.url);

    if let Some(entry) = &cached {
      if !self.is_stale(entry.cached_at) {
        self.metrics.record_hit();
        self.revalidate(partition, request.clone());
        return Ok(CacheResult::from_cache(
          entry.response.clone(),
          entry.cached_at,
        ));
      }
    }
    self.metrics.record_miss();

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          store(&partition, &request.url, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match cached {
        Some(entry) => {
          debug!(url = %request.url, error = %err, "Network failed, serving stale API response");
          Ok(CacheResult::offline(entry.response, entry.cached_at))
        }
        None => {
          debug!(url = %request.url, error = %err, "Network failed, no cached API response");
          Ok(CacheResult::fallback(offline_api_response()))
        }
      },
    }
  }

  /// Network-first: always try the network, fall back to the dynamic partition.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    let partition = self.partition(PartitionKind::Dynamic);

    match self.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          store(&partition, &request.url, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match lookup(&partition, &request.url) {
        Some(entry) => {
          self.metrics.record_hit();
          Ok(CacheResult::offline(entry.response, entry.cached_at))
        }
        None => {
          self.metrics.record_miss();
          Err(err)
        }
      },
    }
  }

  /// Network fetch, counted in the metrics.
  pub(super) async fn fetch(&self, request: &Request) -> Result<Response> {
    self.metrics.record_network_request();
    self.fetcher.fetch(request).await
  }

  /// Fire-and-forget refresh of an API entry. Failures are only logged.
  fn revalidate(&self, partition: Partition<S>, request: Request) {
    let fetcher = Arc::clone(&self.fetcher);
    let metrics = Arc::clone(&self.metrics);

    tokio::spawn(async move {
      metrics.record_network_request();
      match fetcher.fetch(&request).await {
        Ok(response) if response.is_ok() => store(&partition, &request.url, &response),
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "Background refresh not cached")
        }
        Err(err) => debug!(url = %request.url, error = %err, "Background refresh failed"),
      }
    });
  }
}

/// Best-effort lookup: storage errors are logged and treated as a miss.
fn lookup<S: CacheStorage>(partition: &Partition<S>, url: &str) -> Option<CachedEntry> {
  match partition.match_url(url) {
    Ok(entry) => entry,
    Err(err) => {
      warn!(partition = partition.name(), url, error = %err, "Cache lookup failed");
      None
    }
  }
}

/// Best-effort write: storage errors are logged and the response is still served.
fn store<S: CacheStorage>(partition: &Partition<S>, url: &str, response: &Response) {
  if let Err(err) = partition.put(url, response) {
    warn!(partition = partition.name(), url, error = %err, "Cache write failed");
  }
}

fn wants_document(request: &Request) -> bool {
  if request.accepts_html() {
    return true;
  }
  let path = url::Url::parse(&request.url)
    .map(|u| u.path().to_string())
    .unwrap_or_else(|_| request.url.clone());
  path.ends_with('/') || path.ends_with(".html")
}

fn offline_api_response() -> Response {
  Response::json(
    503,
    &serde_json::json!({
      "error": "Offline",
      "message": "You are offline and this data has not been cached yet.",
    }),
  )
}

fn load_placeholder(path: &Path) -> Result<Response> {
  let body = std::fs::read(path)
    .map_err(|e| eyre!("Failed to read image placeholder {}: {}", path.display(), e))?;
  let content_type = match path.extension().and_then(|e| e.to_str()) {
    Some("png") => "image/png",
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    _ => "image/svg+xml",
  };
  Ok(Response::new(200, content_type, body))
}
