use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use url::Url;

use super::queue::{SyncItem, SyncKind};
use crate::config::SyncConfig;
use crate::http::{resolve_url, Fetcher, Request};

/// Applies one queued mutation against the backend.
#[async_trait]
pub trait ActionProcessor: Send + Sync {
  async fn apply(&self, item: &SyncItem) -> Result<()>;
}

/// Posts each item's payload to the endpoint configured for its kind.
pub struct HttpActionProcessor<F: Fetcher> {
  fetcher: Arc<F>,
  origin: Url,
  endpoints: SyncConfig,
}

impl<F: Fetcher> HttpActionProcessor<F> {
  pub fn new(fetcher: Arc<F>, origin: Url, endpoints: SyncConfig) -> Self {
    Self {
      fetcher,
      origin,
      endpoints,
    }
  }

  fn endpoint(&self, kind: SyncKind) -> &str {
    match kind {
      SyncKind::Book => &self.endpoints.books_endpoint,
      SyncKind::Favorite => &self.endpoints.favorites_endpoint,
      SyncKind::Preference => &self.endpoints.preferences_endpoint,
    }
  }
}

#[async_trait]
impl<F: Fetcher> ActionProcessor for HttpActionProcessor<F> {
  async fn apply(&self, item: &SyncItem) -> Result<()> {
    let url = resolve_url(&self.origin, self.endpoint(item.kind))?;
    let request = Request::post_json(url.as_str(), &item.payload).with_header("x-sync-id", &item.id);

    let response = self.fetcher.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Sync of {} item {} rejected with status {}",
        item.kind,
        item.id,
        response.status
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::FakeFetcher;
  use chrono::Utc;
  use serde_json::json;

  fn item(kind: SyncKind) -> SyncItem {
    SyncItem {
      id: "item-1".to_string(),
      kind,
      payload: json!({"bookId": "OL1W"}),
      enqueued_at: Utc::now(),
      attempts: 0,
    }
  }

  fn processor(fetcher: &Arc<FakeFetcher>) -> HttpActionProcessor<FakeFetcher> {
    HttpActionProcessor::new(
      Arc::clone(fetcher),
      Url::parse("http://localhost:4200").unwrap(),
      SyncConfig::default(),
    )
  }

  #[tokio::test]
  async fn test_posts_to_kind_endpoint() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.route(
      "POST",
      "http://localhost:4200/api/sync/favorites",
      Response::json(201, &json!({"ok": true})),
    );

    processor(&fetcher).apply(&item(SyncKind::Favorite)).await.unwrap();
    assert_eq!(
      fetcher.calls(),
      vec!["POST http://localhost:4200/api/sync/favorites".to_string()]
    );
  }

  #[tokio::test]
  async fn test_error_status_is_failure() {
    let fetcher = Arc::new(FakeFetcher::new());
    // unrouted endpoints answer 404
    assert!(processor(&fetcher).apply(&item(SyncKind::Book)).await.is_err());
  }

  #[tokio::test]
  async fn test_offline_is_failure() {
    let fetcher = Arc::new(FakeFetcher::new());
    fetcher.set_offline(true);
    assert!(processor(&fetcher).apply(&item(SyncKind::Preference)).await.is_err());
  }
}
