//! Background sync: deliver queued quiz results when asked.

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::net::client::{quiz_results_path, resolve_url};
use crate::net::{FetchRequest, Transport};

use super::queue::{NewQuizResult, PendingQuizResult, ResultQueue, ResultStatus};

/// Tally of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub delivered: usize,
  pub retained: usize,
  pub dead_lettered: usize,
}

/// What happened to a freshly submitted result.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// The server accepted it
  Delivered,
  /// The server could not take it now; it waits for the next sync
  Queued(PendingQuizResult),
  /// The server refused it and retrying will not help
  Rejected(String),
}

enum Delivery {
  Delivered,
  Retry(String),
  Permanent(String),
}

/// Drains the result queue on sync events carrying its tag.
pub struct SyncTrigger<T: Transport> {
  queue: Arc<ResultQueue>,
  transport: Arc<T>,
  base_url: Url,
  tag: String,
  max_attempts: u32,
  drain_lock: Mutex<()>,
}

impl<T: Transport> SyncTrigger<T> {
  pub fn new(queue: Arc<ResultQueue>, transport: Arc<T>, base_url: Url, config: &SyncConfig) -> Self {
    Self {
      queue,
      transport,
      base_url,
      tag: config.tag.clone(),
      max_attempts: config.max_attempts,
      drain_lock: Mutex::new(()),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Handle a sync event. Events for other tags are ignored.
  pub async fn on_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.tag {
      debug!(tag, "Ignoring sync event for another tag");
      return Ok(None);
    }
    self.drain().await.map(Some)
  }

  /// Upload a result straight away.
  ///
  /// The result is queued only when delivery fails in a way a later sync
  /// can fix. Only failing to queue is an error.
  pub async fn submit(&self, result: NewQuizResult) -> Result<SubmitOutcome> {
    match self.post_result(result.user_id, &result).await {
      Delivery::Delivered => {
        info!(user = result.user_id, lesson = result.lesson_id, "Quiz result delivered");
        Ok(SubmitOutcome::Delivered)
      }
      Delivery::Retry(error) => {
        let queued = self.queue.enqueue(&result)?;
        info!(id = queued.id, lesson = queued.lesson_id, error, "Quiz result queued for sync");
        Ok(SubmitOutcome::Queued(queued))
      }
      Delivery::Permanent(error) => {
        warn!(user = result.user_id, lesson = result.lesson_id, error, "Quiz result rejected");
        Ok(SubmitOutcome::Rejected(error))
      }
    }
  }

  /// Try to deliver every pending result, oldest first.
  ///
  /// Only failing to read the queue is an error. Per-record failures are
  /// logged and counted against the record's attempt budget.
  pub async fn drain(&self) -> Result<DrainReport> {
    // A second drain waits and then sees only what the first one left
    let _guard = self.drain_lock.lock().await;

    let pending = self.queue.pending()?;
    let mut report = DrainReport::default();
    if pending.is_empty() {
      return Ok(report);
    }
    info!(count = pending.len(), "Syncing queued quiz results");

    for record in &pending {
      match self.post_result(record.user_id, record).await {
        Delivery::Delivered => match self.queue.remove(record.id) {
          Ok(_) => report.delivered += 1,
          Err(e) => {
            warn!(id = record.id, error = %e, "Delivered result could not be removed");
            report.retained += 1;
          }
        },
        Delivery::Retry(error) => {
          self.record_failure(record, &error, false, &mut report);
        }
        Delivery::Permanent(error) => {
          self.record_failure(record, &error, true, &mut report);
        }
      }
    }

    info!(
      delivered = report.delivered,
      retained = report.retained,
      dead_lettered = report.dead_lettered,
      "Sync finished"
    );
    Ok(report)
  }

  async fn post_result<B: Serialize>(&self, user_id: i64, body: &B) -> Delivery {
    let path = quiz_results_path(user_id);
    let url = match resolve_url(&self.base_url, &path) {
      Ok(url) => url,
      Err(e) => return Delivery::Permanent(format!("invalid url {}: {}", path, e)),
    };
    let request = match FetchRequest::post_json(url, body) {
      Ok(request) => request,
      Err(e) => return Delivery::Permanent(format!("could not encode result: {}", e)),
    };

    match self.transport.send(&request).await {
      Ok(response) if response.is_success() => Delivery::Delivered,
      Ok(response) if is_rejection(response.status) => {
        Delivery::Permanent(format!("rejected with status {}", response.status))
      }
      Ok(response) => Delivery::Retry(format!("status {}", response.status)),
      Err(e) => Delivery::Retry(e.to_string()),
    }
  }

  fn record_failure(
    &self,
    record: &PendingQuizResult,
    error: &str,
    permanent: bool,
    report: &mut DrainReport,
  ) {
    match self
      .queue
      .record_failure(record.id, error, permanent, self.max_attempts)
    {
      Ok(ResultStatus::FailedPermanent) => {
        warn!(id = record.id, lesson = record.lesson_id, error, "Giving up on quiz result");
        report.dead_lettered += 1;
      }
      Ok(ResultStatus::Pending) => {
        warn!(id = record.id, lesson = record.lesson_id, error, "Quiz result sync failed, will retry");
        report.retained += 1;
      }
      Err(e) => {
        warn!(id = record.id, error = %e, "Failed to record sync failure");
        report.retained += 1;
      }
    }
  }
}

/// 4xx responses that will not change on retry. Auth, timeout and rate
/// limit statuses are retried.
fn is_rejection(status: u16) -> bool {
  (400..500).contains(&status) && !matches!(status, 401 | 403 | 408 | 429)
}
