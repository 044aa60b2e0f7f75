use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::http::Request;
use crate::sync::SyncKind;

/// Events delivered to the worker by its host.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  Install,
  Activate,
  /// A page was opened before this worker took control
  Connect { url: String },
  Fetch {
    #[serde(flatten)]
    request: Request,
  },
  Sync { tag: String },
  /// Raw push message data; absent when the push carried no payload
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  NotificationClick {
    id: u64,
    #[serde(default)]
    action: Option<String>,
  },
  NotificationClose { id: u64 },
  Message { message: PageMessage },
}

/// Messages posted by a page to the worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
  QueueAction {
    kind: SyncKind,
    payload: serde_json::Value,
  },
  GetMetrics,
  SkipWaiting,
}

/// Worker loop events
#[derive(Debug)]
pub enum Event {
  /// An event from the host
  Host(HostEvent),
  /// Periodic tick for metrics reporting
  Tick,
}

/// Event handler that produces events from newline-delimited JSON input and a tick timer.
///
/// The stream ends when the input reaches EOF.
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler reading `input` with the given tick rate
  pub fn new<R>(input: R, tick_rate: Duration) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = input.lines();
      let mut ticker = tokio::time::interval(tick_rate);
      // the first tick completes immediately
      ticker.tick().await;

      loop {
        tokio::select! {
          line = lines.next_line() => {
            let line = match line {
              Ok(Some(line)) => line,
              Ok(None) => break,
              Err(err) => {
                warn!(error = %err, "Failed to read host input");
                break;
              }
            };
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<HostEvent>(&line) {
              Ok(event) => {
                if tx.send(Event::Host(event)).is_err() {
                  break;
                }
              }
              Err(err) => warn!(error = %err, line = %line, "Ignoring malformed host event"),
            }
          }
          _ = ticker.tick() => {
            if tx.send(Event::Tick).is_err() {
              break;
            }
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
