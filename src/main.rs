mod cache;
mod clients;
mod config;
mod db;
mod event;
mod http;
mod metrics;
mod notify;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::cache::{CacheStorage, PartitionKind, SqliteStorage};
use crate::config::{Config, LoggingConfig};
use crate::db::Database;
use crate::event::{EventHandler, HostEvent};
use crate::http::{Fetcher, HttpFetcher, Method, Request};
use crate::sync::{SyncKind, SyncQueue};
use crate::worker::{HostReply, Worker};

#[derive(Parser, Debug)]
#[command(name = "shelfcache")]
#[command(about = "Offline caching and background sync worker for the book search app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelfcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Debug logging
  #[arg(short, long, global = true, conflicts_with = "quiet")]
  verbose: bool,

  /// Only log errors
  #[arg(short, long, global = true)]
  quiet: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create partitions and pre-cache static assets
  Install,
  /// Remove partitions from previous versions
  Activate,
  /// Dispatch a fetch event, starting the worker first if needed
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Extra request header, `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Queue a mutation for background sync
  Enqueue {
    /// book, favorite or preference
    kind: SyncKind,
    /// JSON payload
    payload: String,
  },
  /// Dispatch a sync event (e.g. background-sync-books)
  Sync { tag: String },
  /// Dispatch a push event with an optional JSON payload
  Push { payload: Option<String> },
  /// List partitions and their entry counts
  Partitions,
  /// Read host events as JSON lines from stdin, write replies to stdout
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = init_logging(&config.logging, args.verbose, args.quiet)?;

  let db = Database::open(config.database.as_deref())?;
  let storage = Arc::new(SqliteStorage::new(db.clone()));
  let fetcher = Arc::new(HttpFetcher::new(config.origin_url()?)?);
  let worker = Worker::new(&config, storage, Arc::clone(&fetcher), SyncQueue::new(db))?;

  match args.command {
    Command::Install => {
      let reply = worker.dispatch(HostEvent::Install).await?;
      print_json(&reply)?;
    }
    Command::Activate => {
      if !worker.resume()? {
        return Err(eyre!("Worker is not installed; run `shelfcache install` first"));
      }
      let reply = worker.dispatch(HostEvent::Activate).await?;
      print_json(&reply)?;
    }
    Command::Fetch {
      url,
      method,
      headers,
    } => {
      let mut request = Request {
        method,
        ..Request::get(url)
      };
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      worker.start().await?;
      let reply = worker.dispatch(HostEvent::Fetch { request: request.clone() }).await?;
      match reply {
        // Not intercepted: the host performs the request itself
        HostReply::Passthrough => {
          let response = fetcher.fetch(&request).await?;
          print_json(&response_summary(&response))?;
        }
        reply => print_json(&reply)?,
      }
    }
    Command::Enqueue { kind, payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let item = worker.sync_queue().enqueue(kind, payload)?;
      print_json(&HostReply::Queued(item))?;
    }
    Command::Sync { tag } => {
      let reply = worker.dispatch(HostEvent::Sync { tag }).await?;
      print_json(&reply)?;
    }
    Command::Push { payload } => {
      let reply = worker.dispatch(HostEvent::Push { data: payload }).await?;
      print_json(&reply)?;
    }
    Command::Partitions => {
      let storage = worker.cache().storage();
      let current = worker.cache().names().current();
      for name in storage.partition_names()? {
        let marker = if current.contains(&name) { "*" } else { " " };
        println!("{} {:<40} {}", marker, name, storage.entry_count(&name)?);
      }
      for kind in PartitionKind::ALL {
        let name = worker.cache().names().name(kind);
        if !storage.partition_names()?.contains(&name) {
          println!("  {:<40} (not created)", name);
        }
      }
    }
    Command::Run => {
      worker.resume()?;
      let events = EventHandler::new(
        tokio::io::BufReader::new(tokio::io::stdin()),
        config.metrics_interval(),
      );
      worker.run(events, tokio::io::stdout()).await?;
    }
  }

  Ok(())
}

fn init_logging(config: &LoggingConfig, verbose: bool, quiet: bool) -> Result<Option<WorkerGuard>> {
  let filter = if quiet {
    EnvFilter::new("error")
  } else if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
  };

  // stdout carries host output, so console logs go to stderr
  let stderr_layer = fmt::layer()
    .with_target(false)
    .with_writer(std::io::stderr);

  let (file_layer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shelfcache.log");

      let appender = tracing_appender::rolling::daily(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .init();

  Ok(guard)
}

fn response_summary(response: &http::Response) -> serde_json::Value {
  let (encoding, body) = response.encoded_body();
  serde_json::json!({
    "kind": "network",
    "status": response.status,
    "headers": response.headers,
    "encoding": encoding,
    "body": body,
  })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
