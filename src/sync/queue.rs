//! Persistent queue of quiz results waiting to be uploaded.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A quiz result recorded on this device, in the shape the API accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuizResult {
  pub id: i64,
  pub user_id: i64,
  pub lesson_id: i64,
  pub score: f64,
  pub max_score: f64,
  pub timestamp: DateTime<Utc>,
}

/// A quiz result before it has been assigned a queue id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuizResult {
  pub user_id: i64,
  pub lesson_id: i64,
  pub score: f64,
  pub max_score: f64,
  pub timestamp: DateTime<Utc>,
}

/// Delivery state of a queued result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
  /// Will be sent on the next drain
  Pending,
  /// Gave up; kept for inspection until explicitly retried
  FailedPermanent,
}

impl ResultStatus {
  fn as_str(self) -> &'static str {
    match self {
      ResultStatus::Pending => "pending",
      ResultStatus::FailedPermanent => "failed_permanent",
    }
  }

  fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(ResultStatus::Pending),
      "failed_permanent" => Some(ResultStatus::FailedPermanent),
      _ => None,
    }
  }
}

/// A queue row with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedResult {
  pub result: PendingQuizResult,
  pub status: ResultStatus,
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// SQLite-backed result queue.
pub struct ResultQueue {
  conn: Mutex<Connection>,
}

/// Schema for the result queue.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quiz_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    lesson_id INTEGER NOT NULL,
    score REAL NOT NULL,
    max_score REAL NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_quiz_results_status ON quiz_results(status, id);
"#;

const SELECT_COLUMNS: &str =
  "SELECT id, user_id, lesson_id, score, max_score, timestamp, status, attempts, last_error FROM quiz_results";

impl ResultQueue {
  /// Open (or create) the queue in the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(crate::db::open(path)?)
  }

  pub fn in_memory() -> Result<Self> {
    Self::from_connection(crate::db::open_in_memory()?)
  }

  pub fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Add a result to the queue.
  pub fn enqueue(&self, new: &NewQuizResult) -> Result<PendingQuizResult> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT INTO quiz_results (user_id, lesson_id, score, max_score, timestamp)
         VALUES (?, ?, ?, ?, ?)",
        params![
          new.user_id,
          new.lesson_id,
          new.score,
          new.max_score,
          new.timestamp.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to queue quiz result: {}", e))?;

    Ok(PendingQuizResult {
      id: conn.last_insert_rowid(),
      user_id: new.user_id,
      lesson_id: new.lesson_id,
      score: new.score,
      max_score: new.max_score,
      timestamp: new.timestamp,
    })
  }

  /// Results still waiting for delivery, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingQuizResult>> {
    Ok(
      self
        .select("WHERE status = 'pending' ORDER BY id", [])?
        .into_iter()
        .map(|q| q.result)
        .collect(),
    )
  }

  /// Results that gave up, oldest first.
  pub fn failed(&self) -> Result<Vec<QueuedResult>> {
    self.select("WHERE status = 'failed_permanent' ORDER BY id", [])
  }

  /// Every queued result regardless of status.
  pub fn all(&self) -> Result<Vec<QueuedResult>> {
    self.select("ORDER BY id", [])
  }

  #[cfg(test)]
  pub fn get(&self, id: i64) -> Result<Option<QueuedResult>> {
    use rusqlite::OptionalExtension;

    let conn = self.conn()?;
    conn
      .query_row(&format!("{} WHERE id = ?", SELECT_COLUMNS), params![id], row_to_queued)
      .optional()
      .map_err(|e| eyre!("Failed to read quiz result {}: {}", id, e))
  }

  /// Delete a delivered result. Returns whether it was present.
  pub fn remove(&self, id: i64) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM quiz_results WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete quiz result {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// Count a failed delivery and decide whether the result stays pending.
  ///
  /// The result is parked as `FailedPermanent` when `permanent` is set or the
  /// attempt count reaches `max_attempts`.
  pub fn record_failure(
    &self,
    id: i64,
    error: &str,
    permanent: bool,
    max_attempts: u32,
  ) -> Result<ResultStatus> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let attempts: u32 = tx
      .query_row(
        "SELECT attempts FROM quiz_results WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read attempts for quiz result {}: {}", id, e))?;
    let attempts = attempts + 1;

    let status = if permanent || attempts >= max_attempts {
      ResultStatus::FailedPermanent
    } else {
      ResultStatus::Pending
    };

    tx.execute(
      "UPDATE quiz_results SET attempts = ?, status = ?, last_error = ? WHERE id = ?",
      params![attempts, status.as_str(), error, id],
    )
    .map_err(|e| eyre!("Failed to update quiz result {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(status)
  }

  /// Move every permanently failed result back to pending with a fresh attempt count.
  pub fn retry_failed(&self) -> Result<usize> {
    let updated = self
      .conn()?
      .execute(
        "UPDATE quiz_results SET status = 'pending', attempts = 0
         WHERE status = 'failed_permanent'",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue failed results: {}", e))?;
    Ok(updated)
  }

  fn select<P: rusqlite::Params>(&self, clause: &str, params: P) -> Result<Vec<QueuedResult>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!("{} {}", SELECT_COLUMNS, clause))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params, row_to_queued)
      .map_err(|e| eyre!("Failed to query quiz results: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read quiz result: {}", e))?;
    Ok(rows)
  }
}

fn row_to_queued(row: &Row<'_>) -> rusqlite::Result<QueuedResult> {
  let timestamp: String = row.get(5)?;
  let timestamp = DateTime::parse_from_rfc3339(&timestamp)
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?
    .with_timezone(&Utc);
  let status: String = row.get(6)?;
  let status = ResultStatus::parse(&status).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      6,
      Type::Text,
      format!("unknown result status '{}'", status).into(),
    )
  })?;

  Ok(QueuedResult {
    result: PendingQuizResult {
      id: row.get(0)?,
      user_id: row.get(1)?,
      lesson_id: row.get(2)?,
      score: row.get(3)?,
      max_score: row.get(4)?,
      timestamp,
    },
    status,
    attempts: row.get(7)?,
    last_error: row.get(8)?,
  })
}
