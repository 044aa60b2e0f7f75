//! Durable queue of deferred mutations, stored in SQLite.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::db::Database;

/// Category of a queued mutation. Each has its own sync tag and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
  Book,
  Favorite,
  Preference,
}

impl SyncKind {
  pub const ALL: [SyncKind; 3] = [SyncKind::Book, SyncKind::Favorite, SyncKind::Preference];

  pub fn as_str(&self) -> &'static str {
    match self {
      SyncKind::Book => "book",
      SyncKind::Favorite => "favorite",
      SyncKind::Preference => "preference",
    }
  }

  /// Sync event tag that replays this kind.
  pub fn tag(&self) -> &'static str {
    match self {
      SyncKind::Book => "background-sync-books",
      SyncKind::Favorite => "background-sync-favorites",
      SyncKind::Preference => "background-sync-preferences",
    }
  }

  pub fn from_tag(tag: &str) -> Option<Self> {
    SyncKind::ALL
      .into_iter()
      .find(|k| k.tag() == tag)
  }
}

impl fmt::Display for SyncKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncKind {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "book" | "books" => Ok(SyncKind::Book),
      "favorite" | "favorites" => Ok(SyncKind::Favorite),
      "preference" | "preferences" => Ok(SyncKind::Preference),
      other => Err(format!("unknown sync kind: {}", other)),
    }
  }
}

/// A deferred mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncItem {
  pub id: String,
  pub kind: SyncKind,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
}

#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
}

impl SyncQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Queue a mutation for the next sync of its kind.
  pub fn enqueue(&self, kind: SyncKind, payload: serde_json::Value) -> Result<SyncItem> {
    let item = SyncItem {
      id: Uuid::new_v4().to_string(),
      kind,
      payload,
      enqueued_at: Utc::now(),
      attempts: 0,
    };

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO sync_queue (id, kind, payload, enqueued_at, attempts) VALUES (?, ?, ?, ?, 0)",
        params![
          item.id,
          kind.as_str(),
          item.payload.to_string(),
          item.enqueued_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} action: {}", kind, e))?;

    Ok(item)
  }

  /// All queued items of a kind, oldest first.
  pub fn pending(&self, kind: SyncKind) -> Result<Vec<SyncItem>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, payload, enqueued_at, attempts FROM sync_queue
         WHERE kind = ? ORDER BY enqueued_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![kind.as_str()], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, u32>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, enqueued_at, attempts)| {
        Ok(SyncItem {
          payload: serde_json::from_str(&payload)
            .map_err(|e| eyre!("Corrupt payload for sync item {}: {}", id, e))?,
          enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| eyre!("Failed to parse datetime '{}': {}", enqueued_at, e))?,
          id,
          kind,
          attempts,
        })
      })
      .collect()
  }

  /// Remove an item after it has been applied. Returns whether it was queued.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync item {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Count a failed attempt; the item stays queued.
  pub fn record_failure(&self, id: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to update sync item {}: {}", id, e))?;
    Ok(())
  }

  pub fn len(&self, kind: SyncKind) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE kind = ?",
        params![kind.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count sync queue: {}", e))?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> SyncQueue {
    SyncQueue::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_tags_round_trip_to_kinds() {
    assert_eq!(SyncKind::from_tag("background-sync-books"), Some(SyncKind::Book));
    assert_eq!(
      SyncKind::from_tag("background-sync-preferences"),
      Some(SyncKind::Preference)
    );
    assert_eq!(SyncKind::from_tag("background-sync-other"), None);
  }

  #[test]
  fn test_enqueue_and_pending_in_order() {
    let queue = queue();
    let first = queue.enqueue(SyncKind::Favorite, json!({"bookId": 1, "action": "add"})).unwrap();
    let second = queue.enqueue(SyncKind::Favorite, json!({"bookId": 2, "action": "add"})).unwrap();
    queue.enqueue(SyncKind::Book, json!({"bookId": 3})).unwrap();

    let pending = queue.pending(SyncKind::Favorite).unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[1].id, second.id);
    assert_eq!(pending[0].payload["bookId"], 1);
  }

  #[test]
  fn test_remove_and_failure_tracking() {
    let queue = queue();
    let item = queue.enqueue(SyncKind::Preference, json!({"theme": "dark"})).unwrap();

    queue.record_failure(&item.id).unwrap();
    queue.record_failure(&item.id).unwrap();
    assert_eq!(queue.pending(SyncKind::Preference).unwrap()[0].attempts, 2);

    assert!(queue.remove(&item.id).unwrap());
    assert!(!queue.remove(&item.id).unwrap());
    assert_eq!(queue.len(SyncKind::Preference).unwrap(), 0);
  }

  #[test]
  fn test_kind_parse_accepts_plurals() {
    assert_eq!("books".parse::<SyncKind>().unwrap(), SyncKind::Book);
    assert_eq!("Favorite".parse::<SyncKind>().unwrap(), SyncKind::Favorite);
    assert!("authors".parse::<SyncKind>().is_err());
  }
}
