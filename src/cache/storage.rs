//! Cache storage trait, partition handle and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::Database;
use crate::http::Response;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The cached response
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every entry lives in exactly one named partition. Individual puts and matches
/// are atomic; overlapping writers to the same entry are last-write-wins.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create a partition if it does not exist yet.
  fn create_partition(&self, name: &str) -> Result<()>;

  /// Delete a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  /// Names of all existing partitions.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Look up the entry for a GET of `url`.
  fn match_entry(&self, partition: &str, url: &str) -> Result<Option<CachedEntry>>;

  /// Store a response for `url`, creating the partition if needed.
  fn put_entry(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    cached_at: DateTime<Utc>,
  ) -> Result<()>;

  /// Number of entries in a partition.
  fn entry_count(&self, partition: &str) -> Result<usize>;
}

/// Stable fixed-length key for a GET request.
pub fn entry_key(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(b"GET ");
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

/// Handle to one named partition of a shared storage backend.
pub struct Partition<S: CacheStorage> {
  name: String,
  storage: Arc<S>,
}

impl<S: CacheStorage> Partition<S> {
  pub fn new(name: impl Into<String>, storage: Arc<S>) -> Self {
    Self {
      name: name.into(),
      storage,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn match_url(&self, url: &str) -> Result<Option<CachedEntry>> {
    self.storage.match_entry(&self.name, url)
  }

  /// Store a response stamped with the current time.
  pub fn put(&self, url: &str, response: &Response) -> Result<()> {
    self
      .storage
      .put_entry(&self.name, url, response, Utc::now())
  }
}

impl<S: CacheStorage> Clone for Partition<S> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      storage: Arc::clone(&self.storage),
    }
  }
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn create_partition(&self, name: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", name, e))?;
    Ok(())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.db.conn()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let deleted = conn
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition name: {}", e))?;

    Ok(names)
  }

  fn match_entry(&self, partition: &str, url: &str) -> Result<Option<CachedEntry>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE partition = ? AND entry_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![partition, entry_key(url)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to match {} in {}: {}", url, partition, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put_entry(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    cached_at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.db.conn()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
        params![partition, cached_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (partition, entry_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          partition,
          entry_key(url),
          url,
          response.status,
          headers,
          response.body,
          cached_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", url, partition, e))?;

    Ok(())
  }

  fn entry_count(&self, partition: &str) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE partition = ?",
        params![partition],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", partition, e))?;
    Ok(count as usize)
  }
}

/// Parse a stored RFC 3339 timestamp.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn storage() -> SqliteStorage {
    SqliteStorage::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_put_then_match() {
    let storage = storage();
    let response = Response::new(200, "text/html", "<h1>hi</h1>");
    let at = Utc::now() - Duration::minutes(3);
    storage
      .put_entry("book-search-static-v1", "http://localhost/", &response, at)
      .unwrap();

    let entry = storage
      .match_entry("book-search-static-v1", "http://localhost/")
      .unwrap()
      .unwrap();
    assert_eq!(entry.response, response);
    assert_eq!(entry.cached_at.timestamp(), at.timestamp());

    // partitions are isolated
    assert!(storage
      .match_entry("book-search-dynamic-v1", "http://localhost/")
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_put_creates_partition() {
    let storage = storage();
    storage
      .put_entry("p1", "http://localhost/a", &Response::new(200, "text/plain", "a"), Utc::now())
      .unwrap();
    assert_eq!(storage.partition_names().unwrap(), vec!["p1".to_string()]);
  }

  #[test]
  fn test_last_write_wins() {
    let storage = storage();
    let url = "http://localhost/api/books";
    storage
      .put_entry("api", url, &Response::new(200, "application/json", "[1]"), Utc::now())
      .unwrap();
    storage
      .put_entry("api", url, &Response::new(200, "application/json", "[2]"), Utc::now())
      .unwrap();

    assert_eq!(storage.entry_count("api").unwrap(), 1);
    let entry = storage.match_entry("api", url).unwrap().unwrap();
    assert_eq!(entry.response.text(), "[2]");
  }

  #[test]
  fn test_delete_partition_removes_entries() {
    let storage = storage();
    storage.create_partition("old").unwrap();
    storage
      .put_entry("old", "http://localhost/x", &Response::new(200, "text/plain", "x"), Utc::now())
      .unwrap();

    assert!(storage.delete_partition("old").unwrap());
    assert!(!storage.delete_partition("old").unwrap());
    assert!(storage.partition_names().unwrap().is_empty());
    assert_eq!(storage.entry_count("old").unwrap(), 0);
  }

  #[test]
  fn test_partition_handle_stamps_now() {
    let partition = Partition::new("dyn", Arc::new(storage()));
    partition
      .put("http://localhost/app", &Response::new(200, "text/html", "app"))
      .unwrap();
    let entry = partition.match_url("http://localhost/app").unwrap().unwrap();
    assert!(Utc::now() - entry.cached_at < Duration::seconds(5));
  }
}
