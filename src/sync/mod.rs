//! Background sync: replays queued mutations when connectivity returns.

mod processor;
mod queue;

pub use processor::{ActionProcessor, HttpActionProcessor};
pub use queue::{SyncItem, SyncKind, SyncQueue};

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clients::{ClientHub, ClientMessage};
use crate::metrics::PerformanceMetrics;

/// Outcome of replaying one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Items applied and removed from the queue
  pub processed: usize,
  /// Items left queued for the next sync event
  pub failed: usize,
}

impl SyncReport {
  fn message(self, kind: SyncKind) -> ClientMessage {
    match kind {
      SyncKind::Book => ClientMessage::BooksSynced(self),
      SyncKind::Favorite => ClientMessage::FavoritesSynced(self),
      SyncKind::Preference => ClientMessage::PreferencesSynced(self),
    }
  }
}

pub struct BackgroundSync {
  queue: SyncQueue,
  processor: Arc<dyn ActionProcessor>,
  metrics: Arc<PerformanceMetrics>,
  clients: Arc<ClientHub>,
  /// One replay per kind at a time, indexed by `SyncKind as usize`
  replaying: [Mutex<()>; 3],
}

impl BackgroundSync {
  pub fn new(
    queue: SyncQueue,
    processor: Arc<dyn ActionProcessor>,
    metrics: Arc<PerformanceMetrics>,
    clients: Arc<ClientHub>,
  ) -> Self {
    Self {
      queue,
      processor,
      metrics,
      clients,
      replaying: SyncKind::ALL.map(|_| Mutex::new(())),
    }
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Handle a sync event. Unknown tags are ignored.
  pub async fn handle(&self, tag: &str) -> Result<Option<SyncReport>> {
    match SyncKind::from_tag(tag) {
      Some(kind) => self.replay(kind).await.map(Some),
      None => {
        warn!(tag, "Ignoring unknown sync tag");
        Ok(None)
      }
    }
  }

  /// Apply every queued item of `kind`, then tell the pages how it went.
  ///
  /// A failing item does not stop the batch; it stays queued for the next trigger.
  /// Overlapping replays of the same kind run one after the other, so the later
  /// one only sees what the earlier one left behind.
  pub async fn replay(&self, kind: SyncKind) -> Result<SyncReport> {
    let _guard = self.replaying[kind as usize].lock().await;
    let items = self.queue.pending(kind)?;
    let mut report = SyncReport::default();

    for item in &items {
      match self.processor.apply(item).await {
        Ok(()) => {
          if let Err(err) = self.queue.remove(&item.id) {
            warn!(id = %item.id, error = %err, "Applied sync item could not be dequeued");
          }
          self.metrics.record_background_sync();
          report.processed += 1;
        }
        Err(err) => {
          warn!(id = %item.id, %kind, error = %err, "Sync item failed, keeping it queued");
          if let Err(err) = self.queue.record_failure(&item.id) {
            warn!(id = %item.id, error = %err, "Failed to record sync failure");
          }
          report.failed += 1;
        }
      }
    }

    info!(%kind, processed = report.processed, failed = report.failed, "Background sync finished");
    self.clients.post_all(report.message(kind));
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  /// Fails items whose payload has `"fail": true`.
  struct ScriptedProcessor;

  #[async_trait]
  impl ActionProcessor for ScriptedProcessor {
    async fn apply(&self, item: &SyncItem) -> Result<()> {
      if item.payload["fail"] == json!(true) {
        Err(eyre!("backend rejected {}", item.id))
      } else {
        Ok(())
      }
    }
  }

  /// Takes a while per item and counts how often it ran.
  #[derive(Default)]
  struct SlowProcessor {
    applied: AtomicUsize,
  }

  #[async_trait]
  impl ActionProcessor for SlowProcessor {
    async fn apply(&self, _item: &SyncItem) -> Result<()> {
      tokio::time::sleep(Duration::from_millis(50)).await;
      self.applied.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn background_sync() -> (BackgroundSync, Arc<ClientHub>, Arc<PerformanceMetrics>) {
    let clients = Arc::new(ClientHub::new(8));
    let metrics = Arc::new(PerformanceMetrics::new());
    let sync = BackgroundSync::new(
      SyncQueue::new(Database::open_in_memory().unwrap()),
      Arc::new(ScriptedProcessor),
      Arc::clone(&metrics),
      Arc::clone(&clients),
    );
    (sync, clients, metrics)
  }

  #[tokio::test]
  async fn test_failures_stay_queued_and_batch_continues() {
    let (sync, clients, metrics) = background_sync();
    let mut rx = clients.subscribe();

    sync.queue().enqueue(SyncKind::Book, json!({"fail": true})).unwrap();
    sync.queue().enqueue(SyncKind::Book, json!({"bookId": 1})).unwrap();
    sync.queue().enqueue(SyncKind::Book, json!({"bookId": 2})).unwrap();

    let report = sync.handle("background-sync-books").await.unwrap().unwrap();
    assert_eq!(report, SyncReport { processed: 2, failed: 1 });
    assert_eq!(metrics.snapshot().background_syncs, 2);

    let remaining = sync.queue().pending(SyncKind::Book).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].attempts, 1);

    assert_eq!(
      rx.recv().await.unwrap(),
      ClientMessage::BooksSynced(SyncReport { processed: 2, failed: 1 })
    );
  }

  #[tokio::test]
  async fn test_empty_batch_still_notifies() {
    let (sync, clients, _) = background_sync();
    let mut rx = clients.subscribe();

    let report = sync.handle("background-sync-favorites").await.unwrap().unwrap();
    assert_eq!(report, SyncReport::default());
    assert_eq!(
      rx.recv().await.unwrap(),
      ClientMessage::FavoritesSynced(SyncReport::default())
    );
  }

  #[tokio::test]
  async fn test_only_matching_kind_is_replayed() {
    let (sync, _, _) = background_sync();
    sync.queue().enqueue(SyncKind::Preference, json!({"theme": "dark"})).unwrap();
    sync.queue().enqueue(SyncKind::Book, json!({"bookId": 1})).unwrap();

    sync.handle("background-sync-preferences").await.unwrap();
    assert_eq!(sync.queue().len(SyncKind::Preference).unwrap(), 0);
    assert_eq!(sync.queue().len(SyncKind::Book).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let (sync, _, _) = background_sync();
    assert_eq!(sync.handle("periodic-refresh").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_overlapping_sync_events_apply_once() {
    let processor = Arc::new(SlowProcessor::default());
    let metrics = Arc::new(PerformanceMetrics::new());
    let sync = BackgroundSync::new(
      SyncQueue::new(Database::open_in_memory().unwrap()),
      Arc::clone(&processor) as Arc<dyn ActionProcessor>,
      Arc::clone(&metrics),
      Arc::new(ClientHub::new(8)),
    );
    sync.queue().enqueue(SyncKind::Favorite, json!({"bookId": 7, "action": "add"})).unwrap();

    let (first, second) = tokio::join!(
      sync.handle("background-sync-favorites"),
      sync.handle("background-sync-favorites")
    );
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(processor.applied.load(Ordering::SeqCst), 1);
    assert_eq!(first.processed + second.processed, 1);
    assert_eq!(metrics.snapshot().background_syncs, 1);
    assert_eq!(sync.queue().len(SyncKind::Favorite).unwrap(), 0);
  }
}
