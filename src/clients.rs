//! Connected pages: message broadcast, control and window focus.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::metrics::MetricsSnapshot;
use crate::sync::SyncReport;

/// Messages posted from the worker to every connected page.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  CacheMetrics(MetricsSnapshot),
  BooksSynced(SyncReport),
  FavoritesSynced(SyncReport),
  PreferencesSynced(SyncReport),
  NotificationClicked {
    id: u64,
    tag: String,
    action: Option<String>,
  },
  NotificationClosed {
    id: u64,
    tag: String,
  },
}

/// A page window known to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientWindow {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Whether this worker governs the page's requests
  pub controlled: bool,
}

pub struct ClientHub {
  tx: broadcast::Sender<ClientMessage>,
  windows: Mutex<Vec<ClientWindow>>,
  next_id: AtomicU64,
}

impl ClientHub {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self {
      tx,
      windows: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
    self.tx.subscribe()
  }

  /// Post a message to every listening page. Returns how many received it.
  pub fn post_all(&self, message: ClientMessage) -> usize {
    match self.tx.send(message) {
      Ok(count) => count,
      Err(err) => {
        debug!(message = ?err.0, "No connected pages");
        0
      }
    }
  }

  /// Register an already-open page. New pages start uncontrolled.
  pub fn connect(&self, url: &str) -> Result<u64> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.lock()?.push(ClientWindow {
      id,
      url: url.to_string(),
      focused: false,
      controlled: false,
    });
    Ok(id)
  }

  /// Take control of every open page. Returns the number of newly claimed pages.
  pub fn claim(&self) -> Result<usize> {
    let mut windows = self.lock()?;
    let mut claimed = 0;
    for window in windows.iter_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    Ok(claimed)
  }

  /// Focus a window already showing `url`, or open a new one.
  pub fn open_or_focus(&self, url: &str) -> Result<ClientWindow> {
    let mut windows = self.lock()?;
    for window in windows.iter_mut() {
      window.focused = false;
    }

    if let Some(window) = windows.iter_mut().find(|w| w.url == url) {
      window.focused = true;
      debug!(url, id = window.id, "Focused existing window");
      return Ok(window.clone());
    }

    let window = ClientWindow {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      url: url.to_string(),
      focused: true,
      controlled: true,
    };
    debug!(url, id = window.id, "Opened window");
    windows.push(window.clone());
    Ok(window)
  }

  #[cfg(test)]
  pub fn windows(&self) -> Result<Vec<ClientWindow>> {
    Ok(self.lock()?.clone())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ClientWindow>>> {
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
