//! The offline worker: lifecycle state machine and event dispatch.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, CacheResult, CacheSource, CacheStorage, Classifier, PartitionKind,
};
use crate::clients::{ClientHub, ClientMessage, ClientWindow};
use crate::config::Config;
use crate::event::{Event, EventHandler, HostEvent, PageMessage};
use crate::http::{resolve_url, BodyEncoding, Fetcher, Method, Request, Response};
use crate::metrics::{MetricsSnapshot, PerformanceMetrics};
use crate::notify::{Notification, NotificationRelay};
use crate::sync::{BackgroundSync, HttpActionProcessor, SyncItem, SyncKind, SyncQueue, SyncReport};

/// Lifecycle states of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
  pub precached: usize,
  /// Queued mutations found while registering background sync
  pub pending_sync: usize,
  pub push_subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
  /// Superseded partitions that were removed
  pub deleted: Vec<String>,
  /// Pages newly brought under control
  pub claimed: usize,
}

/// Reply to a single host event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostReply {
  Installed(InstallReport),
  Activated(ActivateReport),
  Connected {
    id: u64,
  },
  Response {
    partition: PartitionKind,
    source: CacheSource,
    status: u16,
    headers: BTreeMap<String, String>,
    encoding: BodyEncoding,
    body: String,
    /// Write time of the cached copy that was served
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_at: Option<DateTime<Utc>>,
  },
  /// Not intercepted; the host performs the request itself
  Passthrough,
  Synced {
    report: Option<SyncReport>,
  },
  Notification {
    notification: Option<Notification>,
  },
  Window {
    window: Option<ClientWindow>,
  },
  Queued(SyncItem),
  Metrics(MetricsSnapshot),
  Ack,
}

impl HostReply {
  fn response(partition: PartitionKind, result: CacheResult<Response>) -> Self {
    let (encoding, body) = result.data.encoded_body();
    HostReply::Response {
      partition,
      source: result.source,
      status: result.data.status,
      headers: result.data.headers,
      encoding,
      body,
      cached_at: result.cached_at,
    }
  }
}

/// One JSON line written by the event loop.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Output {
  Reply(HostReply),
  Error(String),
  Message(ClientMessage),
}

struct WorkerInner<S: CacheStorage, F: Fetcher> {
  origin: Url,
  static_assets: Vec<String>,
  cache: CacheLayer<S, F>,
  classifier: Classifier,
  sync: BackgroundSync,
  notifications: NotificationRelay,
  clients: Arc<ClientHub>,
  metrics: Arc<PerformanceMetrics>,
  state: RwLock<WorkerState>,
  /// Serializes install and activate
  lifecycle: Mutex<()>,
}

/// Offline worker handle. Cheap to clone; clones share all state.
pub struct Worker<S: CacheStorage, F: Fetcher> {
  inner: Arc<WorkerInner<S, F>>,
}

impl<S: CacheStorage, F: Fetcher> Clone for Worker<S, F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Worker<S, F> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>, queue: SyncQueue) -> Result<Self> {
    let origin = config.origin_url()?;
    let metrics = Arc::new(PerformanceMetrics::new());
    let clients = Arc::new(ClientHub::new(64));

    let processor = HttpActionProcessor::new(
      Arc::clone(&fetcher),
      origin.clone(),
      config.sync.clone(),
    );
    let sync = BackgroundSync::new(
      queue,
      Arc::new(processor),
      Arc::clone(&metrics),
      Arc::clone(&clients),
    );
    let notifications = NotificationRelay::new(
      config.notifications.clone(),
      Arc::clone(&clients),
      Arc::clone(&metrics),
    );
    let classifier = Classifier::new(&config.cache, origin.clone())?;
    let cache = CacheLayer::new(&config.cache, storage, fetcher, Arc::clone(&metrics))?;

    Ok(Self {
      inner: Arc::new(WorkerInner {
        origin,
        static_assets: config.cache.static_assets.clone(),
        cache,
        classifier,
        sync,
        notifications,
        clients,
        metrics,
        state: RwLock::new(WorkerState::Parsed),
        lifecycle: Mutex::new(()),
      }),
    })
  }

  pub fn state(&self) -> Result<WorkerState> {
    self
      .inner
      .state
      .read()
      .map(|s| *s)
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    let mut current = self
      .inner
      .state
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    debug!(from = ?*current, to = ?state, "Worker state change");
    *current = state;
    Ok(())
  }

  #[cfg(test)]
  pub fn clients(&self) -> &Arc<ClientHub> {
    &self.inner.clients
  }

  pub fn cache(&self) -> &CacheLayer<S, F> {
    &self.inner.cache
  }

  pub fn sync_queue(&self) -> &SyncQueue {
    self.inner.sync.queue()
  }

  /// Install: create partitions, pre-cache static assets, then best-effort
  /// background-sync registration and push subscription check.
  pub async fn install(&self) -> Result<InstallReport> {
    let _guard = self.inner.lifecycle.lock().await;
    self.set_state(WorkerState::Installing)?;

    let precached = match self.populate_partitions().await {
      Ok(count) => count,
      Err(err) => {
        self.set_state(WorkerState::Parsed)?;
        return Err(err);
      }
    };

    let pending_sync = self.register_background_sync();
    let push_subscribed = self.inner.notifications.has_subscription();
    if !push_subscribed {
      info!("No push subscription registered");
    }

    self.set_state(WorkerState::Installed)?;
    info!(precached, pending_sync, "Worker installed");
    Ok(InstallReport {
      precached,
      pending_sync,
      push_subscribed,
    })
  }

  async fn populate_partitions(&self) -> Result<usize> {
    self.inner.cache.create_partitions()?;
    let urls = self
      .inner
      .static_assets
      .iter()
      .map(|asset| resolve_url(&self.inner.origin, asset).map(|u| u.to_string()))
      .collect::<Result<Vec<_>>>()?;
    self.inner.cache.precache(&urls).await
  }

  /// Check the sync queue is reachable and report how much is waiting. Never fails install.
  fn register_background_sync(&self) -> usize {
    let mut pending = 0;
    for kind in SyncKind::ALL {
      match self.sync_queue().len(kind) {
        Ok(count) => pending += count,
        Err(err) => {
          warn!(%kind, error = %err, "Background sync registration failed");
          return pending;
        }
      }
    }
    pending
  }

  /// Activate: drop superseded partitions and take control of open pages.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let _guard = self.inner.lifecycle.lock().await;
    match self.state()? {
      WorkerState::Installed | WorkerState::Activated => {}
      state => return Err(eyre!("Cannot activate worker in state {:?}", state)),
    }
    self.set_state(WorkerState::Activating)?;

    let deleted = self.inner.cache.delete_superseded()?;
    let claimed = self.inner.clients.claim()?;

    self.set_state(WorkerState::Activated)?;
    info!(deleted = deleted.len(), claimed, "Worker activated");
    Ok(ActivateReport { deleted, claimed })
  }

  /// Pick up an earlier install after a restart. The current static partition marks it.
  pub fn resume(&self) -> Result<bool> {
    let static_name = self.inner.cache.names().name(PartitionKind::Static);
    let installed = self
      .inner
      .cache
      .storage()
      .partition_names()?
      .contains(&static_name);

    if installed && self.state()? == WorkerState::Parsed {
      self.set_state(WorkerState::Installed)?;
    }
    Ok(installed)
  }

  /// Bring the worker to the activated state, skipping the wait between install and activate.
  pub async fn start(&self) -> Result<()> {
    if self.state()? == WorkerState::Activated {
      return Ok(());
    }
    if !self.resume()? {
      self.install().await?;
    }
    self.activate().await?;
    Ok(())
  }

  /// Handle an intercepted request. `None` means the request is not intercepted.
  pub async fn handle_fetch(
    &self,
    request: &Request,
  ) -> Result<Option<(PartitionKind, CacheResult<Response>)>> {
    if request.method != Method::Get {
      return Ok(None);
    }
    if self.state()? != WorkerState::Activated {
      debug!(url = %request.url, "Worker not active, not intercepting");
      return Ok(None);
    }

    let url = resolve_url(&self.inner.origin, &request.url)?;
    let kind = self.inner.classifier.classify(&url);
    let request = Request {
      method: request.method,
      url: url.to_string(),
      headers: request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect(),
      body: None,
    };

    debug!(url = %request.url, partition = %kind, "Intercepted request");
    let result = self.inner.cache.handle(kind, &request).await?;
    Ok(Some((kind, result)))
  }

  pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>> {
    self.inner.sync.handle(tag).await
  }

  pub fn handle_message(&self, message: PageMessage) -> Result<HostReply> {
    match message {
      PageMessage::QueueAction { kind, payload } => {
        let item = self.sync_queue().enqueue(kind, payload)?;
        info!(%kind, id = %item.id, "Queued action for background sync");
        Ok(HostReply::Queued(item))
      }
      PageMessage::GetMetrics => Ok(HostReply::Metrics(self.report_metrics())),
      PageMessage::SkipWaiting => Ok(HostReply::Ack),
    }
  }

  /// Post the current counters to every page.
  pub fn report_metrics(&self) -> MetricsSnapshot {
    let snapshot = self.inner.metrics.snapshot();
    self
      .inner
      .clients
      .post_all(ClientMessage::CacheMetrics(snapshot));
    snapshot
  }

  /// Handle one host event and produce its reply.
  pub async fn dispatch(&self, event: HostEvent) -> Result<HostReply> {
    match event {
      HostEvent::Install => self.install().await.map(HostReply::Installed),
      HostEvent::Activate => self.activate().await.map(HostReply::Activated),
      HostEvent::Connect { url } => {
        let id = self.inner.clients.connect(&url)?;
        Ok(HostReply::Connected { id })
      }
      HostEvent::Fetch { request } => Ok(match self.handle_fetch(&request).await? {
        Some((kind, result)) => HostReply::response(kind, result),
        None => HostReply::Passthrough,
      }),
      HostEvent::Sync { tag } => {
        let report = self.handle_sync(&tag).await?;
        Ok(HostReply::Synced { report })
      }
      HostEvent::Push { data } => {
        let notification = self.inner.notifications.on_push(data.as_deref())?;
        Ok(HostReply::Notification { notification })
      }
      HostEvent::NotificationClick { id, action } => {
        let window = self
          .inner
          .notifications
          .on_click(id, action.as_deref())?;
        Ok(HostReply::Window { window })
      }
      HostEvent::NotificationClose { id } => {
        self.inner.notifications.on_close(id)?;
        Ok(HostReply::Ack)
      }
      HostEvent::Message {
        message: PageMessage::SkipWaiting,
      } => {
        if self.state()? == WorkerState::Installed {
          self.activate().await?;
        }
        Ok(HostReply::Ack)
      }
      HostEvent::Message { message } => self.handle_message(message),
    }
  }

  /// Run the event loop until the host input ends.
  ///
  /// Lifecycle events are handled in order; everything else is dispatched
  /// concurrently. Replies and page messages are written as JSON lines.
  pub async fn run<W>(&self, mut events: EventHandler, mut out: W) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Output>();
    let mut messages = self.inner.clients.subscribe();

    loop {
      tokio::select! {
        event = events.next() => match event {
          Some(Event::Tick) => {
            self.report_metrics();
          }
          Some(Event::Host(event @ (HostEvent::Install | HostEvent::Activate))) => {
            let _ = reply_tx.send(to_output(self.dispatch(event).await));
          }
          Some(Event::Host(event)) => {
            let worker = self.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
              let _ = reply_tx.send(to_output(worker.dispatch(event).await));
            });
          }
          None => break,
        },
        Some(output) = reply_rx.recv() => write_line(&mut out, &output).await?,
        Ok(message) = messages.recv() => write_line(&mut out, &Output::Message(message)).await?,
      }
    }

    // Let in-flight handlers finish
    drop(reply_tx);
    while let Some(output) = reply_rx.recv().await {
      write_line(&mut out, &output).await?;
    }
    for message in drain_messages(&mut messages) {
      write_line(&mut out, &Output::Message(message)).await?;
    }
    out.flush().await?;
    Ok(())
  }
}

/// Everything still buffered for a subscriber. Messages lost to lag are skipped over.
fn drain_messages(rx: &mut broadcast::Receiver<ClientMessage>) -> Vec<ClientMessage> {
  let mut drained = Vec::new();
  loop {
    match rx.try_recv() {
      Ok(message) => drained.push(message),
      Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Page messages dropped"),
      Err(TryRecvError::Empty | TryRecvError::Closed) => break,
    }
  }
  drained
}

fn to_output(result: Result<HostReply>) -> Output {
  match result {
    Ok(reply) => Output::Reply(reply),
    Err(err) => {
      warn!(error = %err, "Host event failed");
      Output::Error(format!("{:#}", err))
    }
  }
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, output: &Output) -> Result<()> {
  let mut line = serde_json::to_vec(output)?;
  line.push(b'\n');
  out.write_all(&line).await?;
  out.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::FakeFetcher;
  use base64::engine::general_purpose::STANDARD as BASE64;
  use base64::Engine;
  use std::time::Duration;

  const ORIGIN: &str = "http://localhost:4200";

  struct Harness {
    worker: Worker<SqliteStorage, FakeFetcher>,
    fetcher: Arc<FakeFetcher>,
    storage: Arc<SqliteStorage>,
  }

  fn harness_with(config: Config) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let fetcher = Arc::new(FakeFetcher::new());
    let worker = Worker::new(
      &config,
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      SyncQueue::new(db),
    )
    .unwrap();
    Harness {
      worker,
      fetcher,
      storage,
    }
  }

  fn harness() -> Harness {
    let mut config = Config::default();
    config.cache.static_assets = vec!["/".to_string(), "/index.html".to_string()];
    let h = harness_with(config);
    h.fetcher.get(&format!("{}/", ORIGIN), Response::html(200, "root"));
    h.fetcher
      .get(&format!("{}/index.html", ORIGIN), Response::html(200, "index"));
    h
  }

  #[tokio::test]
  async fn test_install_precaches_and_offline_request_is_served() {
    let h = harness();
    let report = h.worker.install().await.unwrap();
    assert_eq!(report.precached, 2);
    assert!(!report.push_subscribed);
    for url in [format!("{}/", ORIGIN), format!("{}/index.html", ORIGIN)] {
      assert!(h
        .storage
        .match_entry("book-search-static-v1", &url)
        .unwrap()
        .is_some());
    }

    h.worker.activate().await.unwrap();
    h.fetcher.set_offline(true);

    let (kind, result) = h
      .worker
      .handle_fetch(&Request::get("/index.html"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(kind, PartitionKind::Static);
    assert_eq!(result.data.text(), "index");
  }

  #[tokio::test]
  async fn test_install_creates_all_partitions() {
    let h = harness();
    h.worker.install().await.unwrap();
    let names = h.storage.partition_names().unwrap();
    for kind in PartitionKind::ALL {
      assert!(names.contains(&format!("book-search-{}-v1", kind)));
    }
  }

  #[tokio::test]
  async fn test_failed_precache_fails_install() {
    let h = harness();
    h.fetcher.set_offline(true);
    assert!(h.worker.install().await.is_err());
    assert_eq!(h.worker.state().unwrap(), WorkerState::Parsed);
    assert!(h.worker.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_activate_deletes_superseded_and_claims() {
    let h = harness();
    h.storage.create_partition("book-search-static-v0").unwrap();
    h.storage.create_partition("book-search-images-old").unwrap();
    h.worker.clients().connect("/").unwrap();

    h.worker.install().await.unwrap();
    let report = h.worker.activate().await.unwrap();

    assert_eq!(report.deleted.len(), 2);
    assert_eq!(report.claimed, 1);
    assert_eq!(h.worker.state().unwrap(), WorkerState::Activated);
    assert_eq!(h.storage.partition_names().unwrap().len(), 4);
  }

  #[tokio::test]
  async fn test_dynamic_request_cached_for_offline() {
    let h = harness();
    h.worker.start().await.unwrap();
    h.fetcher
      .get(&format!("{}/app/unknown", ORIGIN), Response::html(200, "<p>app</p>"));

    let (kind, online) = h
      .worker
      .handle_fetch(&Request::get("/app/unknown"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(kind, PartitionKind::Dynamic);
    assert_eq!(online.source, CacheSource::Network);

    h.fetcher.set_offline(true);
    let (_, offline) = h
      .worker
      .handle_fetch(&Request::get("/app/unknown"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.text(), "<p>app</p>");
  }

  #[tokio::test]
  async fn test_non_get_is_not_intercepted() {
    let h = harness();
    h.worker.start().await.unwrap();
    let calls_before = h.fetcher.call_count();
    let metrics_before = h.worker.report_metrics();

    let request = Request {
      method: Method::Post,
      ..Request::get("/api/books")
    };
    assert!(h.worker.handle_fetch(&request).await.unwrap().is_none());
    assert_eq!(h.fetcher.call_count(), calls_before);
    assert_eq!(h.worker.report_metrics(), metrics_before);
  }

  #[tokio::test]
  async fn test_inactive_worker_passes_through() {
    let h = harness();
    assert!(h
      .worker
      .handle_fetch(&Request::get("/index.html"))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_restart_with_existing_partitions_skips_install() {
    let h = harness();
    h.storage.create_partition("book-search-static-v1").unwrap();
    h.fetcher.set_offline(true);

    h.worker.start().await.unwrap();
    assert_eq!(h.worker.state().unwrap(), WorkerState::Activated);
    assert_eq!(h.fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_push_renders_default_notification() {
    let h = harness();
    let reply = h
      .worker
      .dispatch(HostEvent::Push {
        data: Some(r#"{"title":"New Book","body":"Check it out"}"#.to_string()),
      })
      .await
      .unwrap();

    let n = match reply {
      HostReply::Notification {
        notification: Some(n),
      } => n,
      other => panic!("expected a notification, got {:?}", other),
    };
    assert_eq!(n.title, "New Book");
    assert_eq!(n.actions[0].action, "view");
    assert_eq!(n.actions[1].action, "dismiss");
    assert_eq!(n.tag, "book-search-notification");
  }

  #[tokio::test]
  async fn test_queue_action_then_sync() {
    let h = harness();
    h.fetcher.route(
      "POST",
      &format!("{}/api/sync/books", ORIGIN),
      Response::json(200, &serde_json::json!({"ok": true})),
    );

    let reply = h
      .worker
      .handle_message(PageMessage::QueueAction {
        kind: SyncKind::Book,
        payload: serde_json::json!({"bookId": "OL1W", "action": "save"}),
      })
      .unwrap();
    assert!(matches!(reply, HostReply::Queued(_)));

    let report = h
      .worker
      .handle_sync("background-sync-books")
      .await
      .unwrap()
      .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(h.worker.report_metrics().background_syncs, 1);
  }

  #[tokio::test]
  async fn test_run_loop_writes_replies_and_messages() {
    let h = harness();
    let input: &'static [u8] = b"{\"event\": \"install\"}\n{\"event\": \"activate\"}\n{\"event\": \"fetch\", \"url\": \"/index.html\"}\n{\"event\": \"message\", \"message\": {\"type\": \"GET_METRICS\"}}\n";
    let events = EventHandler::new(tokio::io::BufReader::new(input), Duration::from_secs(3600));

    let mut out = Vec::new();
    h.worker.run(events, &mut out).await.unwrap();

    let lines: Vec<serde_json::Value> = String::from_utf8(out)
      .unwrap()
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect();

    assert!(lines.iter().any(|l| l["reply"]["kind"] == "installed"));
    assert!(lines.iter().any(|l| l["reply"]["kind"] == "activated"));
    assert!(lines
      .iter()
      .any(|l| l["reply"]["kind"] == "response" && l["reply"]["body"] == "index"));
    assert!(lines
      .iter()
      .any(|l| l["message"]["type"] == "CACHE_METRICS"));
  }

  #[tokio::test]
  async fn test_binary_response_survives_reply() {
    let h = harness();
    h.worker.start().await.unwrap();
    let cover = vec![137u8, 80, 78, 71, 13, 10, 26, 10, 255, 254, 0];
    h.fetcher.get(
      "https://covers.openlibrary.org/b/id/42-M.png",
      Response::new(200, "image/png", cover.clone()),
    );

    let fetch = HostEvent::Fetch {
      request: Request::get("https://covers.openlibrary.org/b/id/42-M.png"),
    };
    let reply = serde_json::to_value(h.worker.dispatch(fetch.clone()).await.unwrap()).unwrap();
    assert_eq!(reply["partition"], "image");
    assert_eq!(reply["encoding"], "base64");
    let body = BASE64.decode(reply["body"].as_str().unwrap()).unwrap();
    assert_eq!(body, cover);
    assert!(reply.get("cached_at").is_none());

    // second read comes from the image partition with its write time
    let reply = serde_json::to_value(h.worker.dispatch(fetch).await.unwrap()).unwrap();
    assert_eq!(reply["source"], "cache_fresh");
    assert!(reply["cached_at"].is_string());
    let body = BASE64.decode(reply["body"].as_str().unwrap()).unwrap();
    assert_eq!(body, cover);
  }

  #[test]
  fn test_drain_skips_lagged_messages() {
    let hub = ClientHub::new(2);
    let mut rx = hub.subscribe();
    for _ in 0..5 {
      hub.post_all(ClientMessage::CacheMetrics(MetricsSnapshot::default()));
    }

    // the two newest survive the lag
    assert_eq!(drain_messages(&mut rx).len(), 2);
    assert!(drain_messages(&mut rx).is_empty());
  }
}
