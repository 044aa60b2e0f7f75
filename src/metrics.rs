//! Performance counters scoped to one worker instance.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the strategy handlers and the sync replayer.
///
/// Values only reset when a new collector is created, i.e. on worker restart.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  network_requests: AtomicU64,
  background_syncs: AtomicU64,
  notifications_closed: AtomicU64,
}

/// Point-in-time copy of the counters, in the shape pages expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub network_requests: u64,
  pub background_syncs: u64,
  /// Notifications dismissed without interaction
  pub notifications_closed: u64,
}

impl PerformanceMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self) {
    self.cache_hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.cache_misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_network_request(&self) {
    self.network_requests.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_background_sync(&self) {
    self.background_syncs.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_notification_closed(&self) {
    self.notifications_closed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      network_requests: self.network_requests.load(Ordering::Relaxed),
      background_syncs: self.background_syncs.load(Ordering::Relaxed),
      notifications_closed: self.notifications_closed.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snapshot_serializes_camel_case() {
    let metrics = PerformanceMetrics::new();
    metrics.record_hit();
    metrics.record_hit();
    metrics.record_network_request();

    let json = serde_json::to_value(metrics.snapshot()).unwrap();
    assert_eq!(json["cacheHits"], 2);
    assert_eq!(json["cacheMisses"], 0);
    assert_eq!(json["networkRequests"], 1);
    assert_eq!(json["backgroundSyncs"], 0);
    assert_eq!(json["notificationsClosed"], 0);
  }
}
