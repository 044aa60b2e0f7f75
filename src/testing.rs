//! Test doubles shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::http::{Fetcher, Request, Response};

/// Scripted network: routes keyed by `"METHOD url"`, an online switch and a call log.
///
/// Unknown routes answer 404 while online.
#[derive(Default)]
pub struct FakeFetcher {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(&self, method: &str, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(format!("{} {}", method, url), response);
  }

  pub fn get(&self, url: &str, response: Response) {
    self.route("GET", url, response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = format!("{} {}", request.method, request.url);
    self.calls.lock().unwrap().push(key.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unavailable: {}", key));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "text/plain", "not found")),
    )
  }
}
