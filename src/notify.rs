//! Push notifications: payload decoding, rendering with tag dedup, click and close handling.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clients::{ClientHub, ClientMessage, ClientWindow};
use crate::config::NotificationConfig;
use crate::metrics::PerformanceMetrics;

const DEFAULT_TITLE: &str = "Book Search";
const DEFAULT_BODY: &str = "You have a new update";
const DEFAULT_VIBRATE: [u32; 3] = [100, 50, 100];

/// JSON body of a push message. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub image: Option<String>,
  pub data: Option<serde_json::Value>,
  pub require_interaction: Option<bool>,
  pub actions: Option<Vec<NotificationAction>>,
  pub tag: Option<String>,
  pub renotify: Option<bool>,
  pub vibrate: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

impl NotificationAction {
  fn new(action: &str, title: &str) -> Self {
    Self {
      action: action.to_string(),
      title: title.to_string(),
      icon: None,
    }
  }
}

/// A rendered notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id: u64,
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub image: Option<String>,
  pub tag: String,
  pub renotify: bool,
  pub require_interaction: bool,
  pub vibrate: Vec<u32>,
  pub actions: Vec<NotificationAction>,
  pub data: serde_json::Value,
}

impl Notification {
  /// Where a click should take the user.
  fn target_url(&self) -> &str {
    self
      .data
      .get("url")
      .and_then(|u| u.as_str())
      .unwrap_or("/")
  }
}

pub struct NotificationRelay {
  config: NotificationConfig,
  clients: Arc<ClientHub>,
  metrics: Arc<PerformanceMetrics>,
  shown: Mutex<Vec<Notification>>,
  next_id: AtomicU64,
}

impl NotificationRelay {
  pub fn new(
    config: NotificationConfig,
    clients: Arc<ClientHub>,
    metrics: Arc<PerformanceMetrics>,
  ) -> Self {
    Self {
      config,
      clients,
      metrics,
      shown: Mutex::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }

  /// Whether the application already holds a push subscription.
  pub fn has_subscription(&self) -> bool {
    self
      .config
      .push_endpoint
      .as_deref()
      .map(|e| !e.is_empty())
      .unwrap_or(false)
  }

  /// Render the notification carried by a push message.
  ///
  /// A push without data, or with data that is not JSON, shows nothing.
  pub fn on_push(&self, data: Option<&str>) -> Result<Option<Notification>> {
    let Some(data) = data else {
      debug!("Push event without payload");
      return Ok(None);
    };

    let payload: PushPayload = match serde_json::from_str(data) {
      Ok(payload) => payload,
      Err(err) => {
        warn!(error = %err, "Ignoring push payload that is not JSON");
        return Ok(None);
      }
    };

    let notification = self.render(payload);
    let mut shown = self.lock()?;
    if !notification.renotify {
      shown.retain(|n| n.tag != notification.tag);
    }
    shown.push(notification.clone());

    info!(id = notification.id, tag = %notification.tag, title = %notification.title, "Showing notification");
    Ok(Some(notification))
  }

  fn render(&self, payload: PushPayload) -> Notification {
    Notification {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      title: payload.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: payload.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      image: payload.image,
      tag: payload.tag.unwrap_or_else(|| self.config.tag.clone()),
      renotify: payload.renotify.unwrap_or(false),
      require_interaction: payload.require_interaction.unwrap_or(false),
      vibrate: payload.vibrate.unwrap_or_else(|| DEFAULT_VIBRATE.to_vec()),
      actions: payload.actions.unwrap_or_else(|| {
        vec![
          NotificationAction::new("view", "View"),
          NotificationAction::new("dismiss", "Dismiss"),
        ]
      }),
      data: payload.data.unwrap_or(serde_json::Value::Null),
    }
  }

  /// Handle a click. The notification closes; "view" or a plain tap opens the target page.
  pub fn on_click(&self, id: u64, action: Option<&str>) -> Result<Option<ClientWindow>> {
    let Some(notification) = self.take(id)? else {
      debug!(id, "Click on unknown notification");
      return Ok(None);
    };

    self.clients.post_all(ClientMessage::NotificationClicked {
      id,
      tag: notification.tag.clone(),
      action: action.map(String::from),
    });

    match action {
      None | Some("view") => {
        let window = self.clients.open_or_focus(notification.target_url())?;
        Ok(Some(window))
      }
      Some("dismiss") => Ok(None),
      Some(other) => {
        debug!(id, action = other, "Unhandled notification action");
        Ok(None)
      }
    }
  }

  /// Handle a notification closed without interaction. Only recorded.
  pub fn on_close(&self, id: u64) -> Result<()> {
    let Some(notification) = self.take(id)? else {
      debug!(id, "Close of unknown notification");
      return Ok(());
    };

    self.metrics.record_notification_closed();
    info!(id, tag = %notification.tag, "Notification closed");
    self.clients.post_all(ClientMessage::NotificationClosed {
      id,
      tag: notification.tag,
    });
    Ok(())
  }

  #[cfg(test)]
  pub fn shown(&self) -> Result<Vec<Notification>> {
    Ok(self.lock()?.clone())
  }

  fn take(&self, id: u64) -> Result<Option<Notification>> {
    let mut shown = self.lock()?;
    Ok(
      shown
        .iter()
        .position(|n| n.id == id)
        .map(|index| shown.remove(index)),
    )
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<Notification>>> {
    self
      .shown
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}
