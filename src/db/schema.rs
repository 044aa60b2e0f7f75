/// Schema for the partition store and the background sync queue.
pub const SCHEMA: &str = r#"
-- Named cache partitions (one row per versioned partition name)
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Request -> response entries, keyed by a hash of the request
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_partition ON cache_entries(partition);

-- Deferred mutations waiting for connectivity
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_kind ON sync_queue(kind, enqueued_at);
"#;
