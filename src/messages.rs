//! Message protocol between UI clients and the caching layer.
//!
//! Requests:
//! - `{"type": "CACHE_LESSON", "urls": [...], "lessonId": ...}`
//! - `{"type": "REMOVE_CACHED_LESSON", "urls": [...], "lessonId": ...}`
//! - `{"type": "CLEAR_OLD_CACHES"}`
//!
//! Replies (broadcast to every subscribed client):
//! - `{"type": "LESSON_CACHED", "lessonId": ..., "success": bool, "error"?: string}`
//! - `{"type": "LESSON_REMOVED", "lessonId": ..., "success": bool, "error"?: string}`

use serde::{Deserialize, Deserializer, Serialize};

/// Command sent to the caching layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheCommand {
  /// Download every URL of a lesson for offline use
  CacheLesson {
    urls: Vec<String>,
    #[serde(rename = "lessonId", deserialize_with = "string_or_number")]
    lesson_id: String,
  },
  /// Drop a lesson's downloaded URLs
  RemoveCachedLesson {
    urls: Vec<String>,
    #[serde(rename = "lessonId", deserialize_with = "string_or_number")]
    lesson_id: String,
  },
  /// Delete every cache except the current version
  ClearOldCaches,
}

impl CacheCommand {
  pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }
}

/// Outcome of a lesson operation, correlated by lesson id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonOutcome {
  pub lesson_id: String,
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl LessonOutcome {
  pub fn ok(lesson_id: &str) -> Self {
    Self {
      lesson_id: lesson_id.to_string(),
      success: true,
      error: None,
    }
  }

  pub fn failed(lesson_id: &str, error: impl Into<String>) -> Self {
    Self {
      lesson_id: lesson_id.to_string(),
      success: false,
      error: Some(error.into()),
    }
  }
}

/// Message delivered to UI clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  LessonCached(LessonOutcome),
  LessonRemoved(LessonOutcome),
}

impl ClientMessage {
  pub fn outcome(&self) -> &LessonOutcome {
    match self {
      ClientMessage::LessonCached(outcome) | ClientMessage::LessonRemoved(outcome) => outcome,
    }
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Lesson ids arrive as either JSON strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Id {
    Text(String),
    Number(i64),
  }

  Ok(match Id::deserialize(deserializer)? {
    Id::Text(s) => s,
    Id::Number(n) => n.to_string(),
  })
}
