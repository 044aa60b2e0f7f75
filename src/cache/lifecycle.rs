//! Partition lifecycle: creation and pre-caching on install, cleanup on activate.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{info, warn};

use super::classifier::PartitionKind;
use super::layer::CacheLayer;
use super::storage::CacheStorage;
use crate::http::{Fetcher, Request};

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  /// Create all four current partitions.
  pub fn create_partitions(&self) -> Result<()> {
    for name in self.names().current() {
      self.storage().create_partition(&name)?;
    }
    Ok(())
  }

  /// Fetch every asset and store them in the static partition.
  ///
  /// All-or-nothing: if any asset fails to load, nothing is written.
  pub async fn precache(&self, urls: &[String]) -> Result<usize> {
    let fetches = urls.iter().map(|url| async move {
      let request = Request::get(url.as_str());
      let response = self.fetch(&request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((url, response))
    });

    let responses = join_all(fetches)
      .await
      .into_iter()
      .collect::<Result<Vec<_>>>()?;

    let partition = self.partition(PartitionKind::Static);
    for (url, response) in &responses {
      partition.put(url, response)?;
    }

    info!(count = responses.len(), partition = partition.name(), "Pre-cached static assets");
    Ok(responses.len())
  }

  /// Delete partitions left behind by previous versions. The current four are never touched.
  pub fn delete_superseded(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage().partition_names()? {
      if !self.names().is_superseded(&name) {
        continue;
      }
      match self.storage().delete_partition(&name) {
        Ok(_) => {
          info!(partition = %name, "Deleted superseded partition");
          deleted.push(name);
        }
        Err(err) => warn!(partition = %name, error = %err, "Failed to delete partition"),
      }
    }

    Ok(deleted)
  }
}
