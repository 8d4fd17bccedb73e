//! Lesson recommendations from progress and quiz history.
//!
//! Candidates are collected in five passes, each with a fixed priority:
//!
//! | pass | condition                                                      | priority |
//! |------|----------------------------------------------------------------|----------|
//! | 1    | started but not completed (most recently accessed first)       | 10       |
//! | 2    | catalog lesson never started                                   | 5        |
//! | 3    | quiz >= 80%: other unfinished lessons of the same subject      | 7        |
//! | 4    | quiz < 60%: unfinished lessons of the same subject, difficulty <= 3 | 8   |
//! | 5    | completed with > 20 min spent: same subject, difficulty <= +1  | 6        |
//!
//! A lesson reached by several passes keeps one entry, chosen by the
//! `DedupPolicy`. The result is ordered by priority, highest first.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub const PRIORITY_CONTINUE: u8 = 10;
pub const PRIORITY_REMEDIATION: u8 = 8;
pub const PRIORITY_QUIZ_PERFORMANCE: u8 = 7;
pub const PRIORITY_TIME_SPENT: u8 = 6;
pub const PRIORITY_NEW_CONTENT: u8 = 5;

/// Quiz percentage at or above which a subject counts as mastered.
const MASTERY_PERCENT: f64 = 80.0;
/// Quiz percentage below which the learner gets easier material.
const STRUGGLING_PERCENT: f64 = 60.0;
const REMEDIAL_MAX_DIFFICULTY: u8 = 3;
/// Seconds on a completed lesson that mark it as worth following up.
const DEEP_ENGAGEMENT_SECS: u64 = 1200;

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
  pub id: i64,
  pub subject_id: i64,
  pub grade: u8,
  /// Unrated lessons are left out of difficulty-bounded suggestions
  #[serde(default)]
  pub difficulty: Option<u8>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
}

/// A learner's record for one lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
  pub lesson_id: i64,
  #[serde(default, deserialize_with = "null_as_default")]
  pub completed: bool,
  /// Seconds
  #[serde(default, deserialize_with = "null_as_default")]
  pub time_spent: u64,
  #[serde(default)]
  pub last_accessed: Option<chrono::DateTime<chrono::Utc>>,
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A scored quiz attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizScore {
  pub lesson_id: i64,
  pub score: f64,
  pub max_score: f64,
}

impl QuizScore {
  /// Score as a percentage, or `None` when there is no positive maximum.
  pub fn percentage(&self) -> Option<f64> {
    (self.max_score > 0.0).then(|| self.score / self.max_score * 100.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
  #[serde(rename = "continue")]
  Continue,
  #[serde(rename = "new content")]
  NewContent,
  #[serde(rename = "based on quiz performance")]
  QuizPerformance,
  #[serde(rename = "to help understanding")]
  Remediation,
  #[serde(rename = "based on time spent")]
  TimeSpent,
}

impl Reason {
  pub fn label(self) -> &'static str {
    match self {
      Reason::Continue => "continue",
      Reason::NewContent => "new content",
      Reason::QuizPerformance => "based on quiz performance",
      Reason::Remediation => "to help understanding",
      Reason::TimeSpent => "based on time spent",
    }
  }
}

impl fmt::Display for Reason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
  pub lesson_id: i64,
  pub priority: u8,
  pub reason: Reason,
}

impl Recommendation {
  fn new(lesson_id: i64, priority: u8, reason: Reason) -> Self {
    Self {
      lesson_id,
      priority,
      reason,
    }
  }
}

/// Which entry survives when a lesson is recommended more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
  /// Keep the highest priority; ties keep the earlier entry
  #[default]
  #[serde(alias = "highest-priority")]
  HighestPriority,
  /// Keep whichever entry was produced last
  #[serde(alias = "last-inserted")]
  LastInserted,
}

impl FromStr for DedupPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.replace('-', "_").as_str() {
      "highest_priority" => Ok(DedupPolicy::HighestPriority),
      "last_inserted" => Ok(DedupPolicy::LastInserted),
      other => Err(format!(
        "unknown dedup policy '{}' (expected highest-priority or last-inserted)",
        other
      )),
    }
  }
}

/// Ranks lessons for one learner.
#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine {
  policy: DedupPolicy,
  limit: Option<usize>,
}

impl RecommendationEngine {
  pub fn new(policy: DedupPolicy) -> Self {
    Self {
      policy,
      limit: None,
    }
  }

  pub fn with_limit(mut self, limit: Option<usize>) -> Self {
    self.limit = limit;
    self
  }

  /// Produce ranked recommendations. Only catalog lessons are recommended;
  /// progress and quiz rows for unknown lessons are ignored.
  pub fn recommend(
    &self,
    catalog: &[Lesson],
    progress: &[LessonProgress],
    quiz_results: &[QuizScore],
  ) -> Vec<Recommendation> {
    let lessons: HashMap<i64, &Lesson> = catalog.iter().map(|l| (l.id, l)).collect();
    let started: HashSet<i64> = progress.iter().map(|p| p.lesson_id).collect();
    let completed: HashSet<i64> = progress
      .iter()
      .filter(|p| p.completed)
      .map(|p| p.lesson_id)
      .collect();

    let mut candidates = Vec::new();

    let mut in_progress: Vec<&LessonProgress> = progress
      .iter()
      .filter(|p| !p.completed && lessons.contains_key(&p.lesson_id))
      .collect();
    // Never-accessed records sort last
    in_progress.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
    candidates.extend(
      in_progress
        .iter()
        .map(|p| Recommendation::new(p.lesson_id, PRIORITY_CONTINUE, Reason::Continue)),
    );

    candidates.extend(
      catalog
        .iter()
        .filter(|l| !started.contains(&l.id))
        .map(|l| Recommendation::new(l.id, PRIORITY_NEW_CONTENT, Reason::NewContent)),
    );

    let scored: Vec<(&Lesson, f64)> = quiz_results
      .iter()
      .filter_map(|q| Some((*lessons.get(&q.lesson_id)?, q.percentage()?)))
      .collect();

    for (source, _) in scored.iter().filter(|(_, pct)| *pct >= MASTERY_PERCENT) {
      candidates.extend(
        unfinished_in(catalog, &completed, source.subject_id)
          .filter(|l| l.id != source.id)
          .map(|l| {
            Recommendation::new(l.id, PRIORITY_QUIZ_PERFORMANCE, Reason::QuizPerformance)
          }),
      );
    }

    for (source, _) in scored.iter().filter(|(_, pct)| *pct < STRUGGLING_PERCENT) {
      candidates.extend(
        unfinished_in(catalog, &completed, source.subject_id)
          .filter(|l| l.difficulty.is_some_and(|d| d <= REMEDIAL_MAX_DIFFICULTY))
          .map(|l| Recommendation::new(l.id, PRIORITY_REMEDIATION, Reason::Remediation)),
      );
    }

    for record in progress
      .iter()
      .filter(|p| p.completed && p.time_spent > DEEP_ENGAGEMENT_SECS)
    {
      let Some(source) = lessons.get(&record.lesson_id) else {
        continue;
      };
      let Some(ceiling) = source.difficulty.map(|d| d.saturating_add(1)) else {
        continue;
      };
      candidates.extend(
        unfinished_in(catalog, &completed, source.subject_id)
          .filter(|l| l.difficulty.is_some_and(|d| d <= ceiling))
          .map(|l| Recommendation::new(l.id, PRIORITY_TIME_SPENT, Reason::TimeSpent)),
      );
    }

    let mut ranked = rank(candidates, self.policy);
    if let Some(limit) = self.limit {
      ranked.truncate(limit);
    }
    ranked
  }
}

fn unfinished_in<'a>(
  catalog: &'a [Lesson],
  completed: &'a HashSet<i64>,
  subject_id: i64,
) -> impl Iterator<Item = &'a Lesson> + 'a {
  catalog
    .iter()
    .filter(move |l| l.subject_id == subject_id && !completed.contains(&l.id))
}

/// Deduplicate by lesson, then order by priority descending.
///
/// A surviving entry takes the position of the lesson's first candidate, so
/// equal priorities keep pass order.
pub(crate) fn rank(candidates: Vec<Recommendation>, policy: DedupPolicy) -> Vec<Recommendation> {
  let mut slots: HashMap<i64, usize> = HashMap::new();
  let mut ranked: Vec<Recommendation> = Vec::with_capacity(candidates.len());

  for candidate in candidates {
    match slots.get(&candidate.lesson_id) {
      Some(&slot) => {
        let replace = match policy {
          DedupPolicy::HighestPriority => candidate.priority > ranked[slot].priority,
          DedupPolicy::LastInserted => true,
        };
        if replace {
          ranked[slot] = candidate;
        }
      }
      None => {
        slots.insert(candidate.lesson_id, ranked.len());
        ranked.push(candidate);
      }
    }
  }

  ranked.sort_by(|a, b| b.priority.cmp(&a.priority));
  ranked
}

/// Catalog lessons for one grade.
pub fn for_grade(catalog: &[Lesson], grade: u8) -> Vec<Lesson> {
  catalog.iter().filter(|l| l.grade == grade).cloned().collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  fn lesson(id: i64, subject_id: i64, difficulty: u8) -> Lesson {
    Lesson {
      id,
      subject_id,
      grade: 5,
      difficulty: Some(difficulty),
      title: None,
    }
  }

  fn progress(lesson_id: i64, completed: bool, time_spent: u64) -> LessonProgress {
    LessonProgress {
      lesson_id,
      completed,
      time_spent,
      last_accessed: None,
    }
  }

  fn quiz(lesson_id: i64, score: f64, max_score: f64) -> QuizScore {
    QuizScore {
      lesson_id,
      score,
      max_score,
    }
  }

  fn summary(recs: &[Recommendation]) -> Vec<(i64, u8, &'static str)> {
    recs
      .iter()
      .map(|r| (r.lesson_id, r.priority, r.reason.label()))
      .collect()
  }

  #[test]
  fn test_mastered_subject_outranks_new_content() {
    let catalog = vec![lesson(1, 1, 1), lesson(2, 1, 4), lesson(3, 2, 2)];
    let recs = RecommendationEngine::default().recommend(
      &catalog,
      &[progress(1, true, 1500)],
      &[quiz(1, 9.0, 10.0)],
    );

    // Lesson 2 is too hard to follow up on time spent (4 > 1 + 1)
    assert_eq!(
      summary(&recs),
      vec![(2, 7, "based on quiz performance"), (3, 5, "new content")]
    );
  }

  #[test]
  fn test_orders_by_priority() {
    let candidates = vec![
      Recommendation::new(1, 10, Reason::Continue),
      Recommendation::new(2, 5, Reason::NewContent),
      Recommendation::new(3, 7, Reason::QuizPerformance),
      Recommendation::new(4, 8, Reason::Remediation),
      Recommendation::new(5, 6, Reason::TimeSpent),
    ];
    let ranked = rank(candidates, DedupPolicy::HighestPriority);
    let priorities: Vec<u8> = ranked.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![10, 8, 7, 6, 5]);
  }

  #[test]
  fn test_dedup_policies() {
    // Lesson 1 is in progress and also remedial after a poor quiz on lesson 2
    let catalog = vec![lesson(1, 1, 2), lesson(2, 1, 2)];
    let progress = vec![progress(1, false, 60), progress(2, true, 300)];
    let quizzes = vec![quiz(2, 3.0, 10.0)];

    let highest = RecommendationEngine::new(DedupPolicy::HighestPriority)
      .recommend(&catalog, &progress, &quizzes);
    assert_eq!(summary(&highest), vec![(1, 10, "continue")]);

    let last = RecommendationEngine::new(DedupPolicy::LastInserted)
      .recommend(&catalog, &progress, &quizzes);
    assert_eq!(summary(&last), vec![(1, 8, "to help understanding")]);
  }

  #[test]
  fn test_threshold_boundaries() {
    let catalog = vec![lesson(1, 1, 1), lesson(2, 1, 2), lesson(3, 1, 5)];
    let records = vec![progress(1, true, 0), progress(2, true, 0)];
    let engine = RecommendationEngine::default();

    // Exactly 80% counts as mastery
    let recs = engine.recommend(&catalog, &records, &[quiz(1, 8.0, 10.0)]);
    assert!(recs.contains(&Recommendation::new(3, 7, Reason::QuizPerformance)));

    // Exactly 60% is neither mastery nor struggling
    let recs = engine.recommend(&catalog, &records, &[quiz(1, 6.0, 10.0)]);
    assert_eq!(summary(&recs), vec![(3, 5, "new content")]);

    // Just under 60% only surfaces easy lessons
    let catalog = vec![lesson(1, 1, 1), lesson(2, 1, 3), lesson(3, 1, 5)];
    let records = vec![progress(1, true, 0), progress(2, false, 0), progress(3, false, 0)];
    let recs = engine.recommend(&catalog, &records, &[quiz(1, 5.9, 10.0)]);
    assert_eq!(summary(&recs), vec![(2, 10, "continue"), (3, 10, "continue")]);
  }

  #[test]
  fn test_remediation_for_unstarted_easy_lessons() {
    let catalog = vec![lesson(1, 1, 4), lesson(2, 1, 3), lesson(3, 1, 4), lesson(4, 2, 1)];
    let recs = RecommendationEngine::default().recommend(
      &catalog,
      &[progress(1, true, 0)],
      &[quiz(1, 2.0, 10.0)],
    );
    assert_eq!(
      summary(&recs),
      vec![
        (2, 8, "to help understanding"),
        (3, 5, "new content"),
        (4, 5, "new content"),
      ]
    );
  }

  #[test]
  fn test_time_spent_follow_up() {
    let catalog = vec![lesson(1, 1, 2), lesson(2, 1, 3), lesson(3, 1, 4)];
    let recs = RecommendationEngine::default().recommend(&catalog, &[progress(1, true, 1201)], &[]);
    assert_eq!(
      summary(&recs),
      vec![(2, 6, "based on time spent"), (3, 5, "new content")]
    );

    // 1200 seconds is not enough
    let recs = RecommendationEngine::default().recommend(&catalog, &[progress(1, true, 1200)], &[]);
    assert_eq!(
      summary(&recs),
      vec![(2, 5, "new content"), (3, 5, "new content")]
    );
  }

  #[test]
  fn test_continue_most_recent_first() {
    let catalog = vec![lesson(1, 1, 1), lesson(2, 1, 1), lesson(3, 1, 1)];
    let at = |h| Some(Utc.with_ymd_and_hms(2026, 5, 1, h, 0, 0).unwrap());
    let progress = vec![
      LessonProgress {
        last_accessed: None,
        ..progress(1, false, 10)
      },
      LessonProgress {
        last_accessed: at(8),
        ..progress(2, false, 10)
      },
      LessonProgress {
        last_accessed: at(12),
        ..progress(3, false, 10)
      },
    ];
    let recs = RecommendationEngine::default().recommend(&catalog, &progress, &[]);
    let order: Vec<i64> = recs.iter().map(|r| r.lesson_id).collect();
    assert_eq!(order, vec![3, 2, 1]);
  }

  #[test]
  fn test_empty_inputs() {
    let engine = RecommendationEngine::default();
    assert!(engine.recommend(&[], &[], &[]).is_empty());

    let catalog = vec![lesson(1, 1, 1), lesson(2, 2, 1)];
    let recs = engine.recommend(&catalog, &[], &[]);
    assert_eq!(summary(&recs), vec![(1, 5, "new content"), (2, 5, "new content")]);
  }

  #[test]
  fn test_ignores_unknown_lessons_and_zero_max_score() {
    let catalog = vec![lesson(1, 1, 1)];
    let recs = RecommendationEngine::default().recommend(
      &catalog,
      &[progress(99, false, 10)],
      &[quiz(1, 0.0, 0.0), quiz(98, 1.0, 10.0)],
    );
    assert_eq!(summary(&recs), vec![(1, 5, "new content")]);
  }

  #[test]
  fn test_limit() {
    let catalog = vec![lesson(1, 1, 1), lesson(2, 1, 1), lesson(3, 1, 1)];
    let recs = RecommendationEngine::default()
      .with_limit(Some(2))
      .recommend(&catalog, &[], &[]);
    assert_eq!(recs.len(), 2);
  }

  #[test]
  fn test_serialized_shape() {
    let rec = Recommendation::new(2, 7, Reason::QuizPerformance);
    assert_eq!(
      serde_json::to_value(&rec).unwrap(),
      serde_json::json!({"lessonId": 2, "priority": 7, "reason": "based on quiz performance"})
    );

    let progress: LessonProgress =
      serde_json::from_str(r#"{"lessonId": 4, "completed": false, "timeSpent": 90}"#).unwrap();
    assert_eq!(progress.last_accessed, None);
  }

  #[test]
  fn test_dedup_policy_from_str() {
    assert_eq!(
      "last-inserted".parse::<DedupPolicy>(),
      Ok(DedupPolicy::LastInserted)
    );
    assert_eq!(
      "highest_priority".parse::<DedupPolicy>(),
      Ok(DedupPolicy::HighestPriority)
    );
    assert!("newest".parse::<DedupPolicy>().is_err());
  }

  #[test]
  fn test_for_grade() {
    let mut other = lesson(2, 1, 1);
    other.grade = 6;
    let catalog = vec![lesson(1, 1, 1), other];
    let filtered = for_grade(&catalog, 5);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, 1);
  }

  #[test]
  fn test_null_fields_degrade() {
    let catalog: Vec<Lesson> = serde_json::from_str(
      r#"[
        {"id": 1, "subjectId": 1, "grade": 5, "difficulty": 1},
        {"id": 2, "subjectId": 1, "grade": 5, "difficulty": null},
        {"id": 3, "subjectId": 1, "grade": 5},
        {"id": 4, "subjectId": 1, "grade": 5, "difficulty": 2}
      ]"#,
    )
    .unwrap();
    assert_eq!(catalog[1].difficulty, None);

    let records: Vec<LessonProgress> = serde_json::from_str(
      r#"[
        {"lessonId": 1, "completed": true, "timeSpent": 1500},
        {"lessonId": 3, "completed": null, "timeSpent": null}
      ]"#,
    )
    .unwrap();
    assert_eq!(records[1], progress(3, false, 0));

    // Unrated lessons are skipped by the time-spent follow-up but still
    // surface as new content
    let recs = RecommendationEngine::default().recommend(&catalog, &records, &[]);
    assert_eq!(
      summary(&recs),
      vec![
        (3, 10, "continue"),
        (4, 6, "based on time spent"),
        (2, 5, "new content")
      ]
    );

    // A struggling learner is not pointed at unrated lessons
    let recs =
      RecommendationEngine::default().recommend(&catalog, &records[..1], &[quiz(1, 1.0, 10.0)]);
    assert!(recs.iter().all(|r| r.reason != Reason::Remediation || r.lesson_id == 4));
    assert!(recs.contains(&Recommendation::new(4, 8, Reason::Remediation)));
  }
}
