//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::net::{HttpResponse, RequestKey};

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Readable request key, e.g. `GET https://host/app.js`
  pub request_key: String,
  pub response: HttpResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Responses live in named caches (one per cache version). Writes to a cache
/// that does not exist yet create it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the named cache if it does not exist.
  fn open_cache(&self, cache: &str) -> Result<()>;

  /// Names of every existing cache.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and all its entries. Returns whether it existed.
  fn delete_cache(&self, cache: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the same key.
  fn put(&self, cache: &str, key: &RequestKey, response: &HttpResponse) -> Result<()>;

  /// Store several responses atomically: either all are written or none.
  fn put_all(&self, cache: &str, entries: &[(RequestKey, HttpResponse)]) -> Result<()>;

  /// Look up a response by request key.
  fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Remove a single entry. Returns whether it existed.
  fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool>;

  /// Readable request keys stored in a cache, oldest first.
  fn keys(&self, cache: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache tables in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(crate::db::open(path)?)
  }

  /// Cache that lives only as long as this value.
  pub fn in_memory() -> Result<Self> {
    Self::from_connection(crate::db::open_in_memory()?)
  }

  pub fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cache namespaces, one per cache version
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses keyed by sha256("METHOD URL")
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

fn insert_entry(
  conn: &Connection,
  cache: &str,
  key: &RequestKey,
  response: &HttpResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to create cache {}: {}", cache, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, request_hash, request_key, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        cache,
        key.cache_hash(),
        key.description(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, cache: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_names (name) VALUES (?)",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to create cache {}: {}", cache, e))?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![cache],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", cache, e))?;
    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![cache])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, cache: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
    let conn = self.conn()?;
    insert_entry(&conn, cache, key, response)
  }

  fn put_all(&self, cache: &str, entries: &[(RequestKey, HttpResponse)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      // Dropping `tx` on error rolls back everything written so far
      insert_entry(&tx, cache, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn get(&self, cache: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT request_key, status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND request_hash = ?",
        params![cache, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.description(), e))?;

    match row {
      Some((request_key, status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          request_key,
          response: HttpResponse {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn delete(&self, cache: &str, key: &RequestKey) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND request_hash = ?",
        params![cache, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key.description(), e))?;
    Ok(removed > 0)
  }

  fn keys(&self, cache: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT request_key FROM cache_entries WHERE cache_name = ?
         ORDER BY cached_at, request_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![cache], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", cache, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(&Url::parse("https://school.example/").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_last_write_wins() {
    let storage = SqliteStorage::in_memory().unwrap();
    let k = key("/app.js");

    storage.put("v1", &k, &HttpResponse::new(200, "first")).unwrap();
    storage.put("v1", &k, &HttpResponse::new(200, "second")).unwrap();

    let entry = storage.get("v1", &k).unwrap().unwrap();
    assert_eq!(entry.response.text(), "second");
    assert_eq!(entry.request_key, "GET https://school.example/app.js");
    assert_eq!(storage.keys("v1").unwrap().len(), 1);
  }

  #[test]
  fn test_caches_are_isolated() {
    let storage = SqliteStorage::in_memory().unwrap();
    let k = key("/app.js");
    storage.put("v1", &k, &HttpResponse::new(200, "old")).unwrap();

    assert!(storage.get("v2", &k).unwrap().is_none());
    assert_eq!(storage.cache_names().unwrap(), vec!["v1"]);
  }

  #[test]
  fn test_headers_round_trip() {
    let storage = SqliteStorage::in_memory().unwrap();
    let k = key("/style.css");
    let resp = HttpResponse::new(200, "body{}").with_header("content-type", "text/css");
    storage.put("v1", &k, &resp).unwrap();

    let entry = storage.get("v1", &k).unwrap().unwrap();
    assert_eq!(entry.response, resp);
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let storage = SqliteStorage::in_memory().unwrap();
    let k = key("/a");
    storage.put("v1", &k, &HttpResponse::new(200, "a")).unwrap();

    assert!(storage.delete_cache("v1").unwrap());
    assert!(!storage.delete_cache("v1").unwrap());
    assert!(storage.cache_names().unwrap().is_empty());

    // Recreating the cache must not resurrect old entries
    storage.open_cache("v1").unwrap();
    assert!(storage.get("v1", &k).unwrap().is_none());
  }

  #[test]
  fn test_delete_entry() {
    let storage = SqliteStorage::in_memory().unwrap();
    let k = key("/a");
    storage.put("v1", &k, &HttpResponse::new(200, "a")).unwrap();
    assert!(storage.delete("v1", &k).unwrap());
    assert!(!storage.delete("v1", &k).unwrap());
  }

  #[test]
  fn test_put_all_writes_every_entry() {
    let storage = SqliteStorage::in_memory().unwrap();
    let entries = vec![
      (key("/a"), HttpResponse::new(200, "a")),
      (key("/b"), HttpResponse::new(200, "b")),
    ];
    storage.put_all("v1", &entries).unwrap();
    assert_eq!(storage.keys("v1").unwrap().len(), 2);
  }

  #[test]
  fn test_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(crate::db::DATABASE_FILE);
    let k = key("/index.html");

    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("v1", &k, &HttpResponse::new(200, "<html>")).unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    let entry = storage.get("v1", &k).unwrap().unwrap();
    assert_eq!(entry.response.text(), "<html>");
  }
}
