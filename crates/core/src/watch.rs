//! Watch registration models: a client's persisted interest in being woken
//! when matching data changes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::DataAction;

/// How long a poll may hang before returning `Timeout` (the hanging-GET
/// duration).
pub const HANGING_GET_TIMEOUT_MS: u64 = 60_000;

/// A registration without a callback URL can be reaped when it has not been
/// watched for this long.
pub const REMOVE_AFTER_WATCH_MINUTES: i64 = 60;

/// A callback registration can be reaped when the callback has failed at
/// least this many times...
pub const REMOVE_AFTER_FAILED_CALLBACK_COUNT: i32 = 5;
/// ...over at least this many hours.
pub const REMOVE_AFTER_FAILED_CALLBACK_HOURS: i64 = 24;

/// Result of a single blocking sync watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWatchResult {
    pub result_code: WatchResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<DataAction>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchResultCode {
    Ok,
    Timeout,
    NoData,
}

/// Interest in mutations of one project table, optionally scoped to one
/// subject (`subject: None` watches any subject and is admin-only).
/// Triggered subjects accumulate until a poll or a successful callback
/// delivers them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchTableRegistration {
    pub id: String,
    pub user: String,
    pub project: String,
    pub table: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Unix millis of the last registration or poll.
    pub last_watch_time: i64,
    #[serde(default)]
    pub triggered_subjects: Vec<String>,
    #[serde(default)]
    pub callback_fail_count: i32,
    /// Unix millis of the first failure in the current failure window.
    #[serde(default)]
    pub callback_fail_start: i64,
}

impl WatchTableRegistration {
    pub fn new(
        user: impl Into<String>,
        project: impl Into<String>,
        table: impl Into<String>,
        subject: Option<String>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            project: project.into(),
            table: table.into(),
            subject,
            callback_url,
            last_watch_time: Utc::now().timestamp_millis(),
            triggered_subjects: Vec::new(),
            callback_fail_count: 0,
            callback_fail_start: 0,
        }
    }

    /// The subjects among the actions this registration triggers on. A
    /// scoped registration only matches its own subject.
    pub fn matching_subjects(&self, actions: &[DataAction]) -> Vec<String> {
        let mut subjects: Vec<String> = actions
            .iter()
            .filter_map(|a| a.user.clone())
            .filter(|user| match &self.subject {
                Some(subject) => subject == user,
                None => true,
            })
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }
}

/// Interest in subject membership changes within a project: subjects
/// becoming visible to or disappearing from the registration's user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSubjectRegistration {
    pub id: String,
    pub user: String,
    pub project: String,
    pub last_watch_time: i64,
    #[serde(default)]
    pub events: Vec<SubjectEvent>,
}

impl WatchSubjectRegistration {
    pub fn new(user: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            project: project.into(),
            last_watch_time: Utc::now().timestamp_millis(),
            events: Vec::new(),
        }
    }
}

/// One accumulated subject-watch event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectEvent {
    #[serde(rename = "type")]
    pub event_type: SubjectEventType,
    pub subject: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectEventType {
    Added,
    Removed,
    ProfileUpdated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ActionKind;

    fn action(user: &str) -> DataAction {
        DataAction {
            id: String::new(),
            table: "heart_rate".to_string(),
            user: Some(user.to_string()),
            kind: ActionKind::Insert,
            record_id: "r1".to_string(),
            payload: None,
            sample_time: None,
            time: 0,
            seq: 1,
            source: user.to_string(),
        }
    }

    #[test]
    fn any_subject_registration_collects_distinct_subjects() {
        let reg = WatchTableRegistration::new("admin", "default", "heart_rate", None, None);
        let subjects = reg.matching_subjects(&[action("a"), action("b"), action("a")]);
        assert_eq!(subjects, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn scoped_registration_matches_only_its_subject() {
        let reg = WatchTableRegistration::new(
            "prof",
            "default",
            "heart_rate",
            Some("a".to_string()),
            None,
        );
        assert_eq!(reg.matching_subjects(&[action("b")]), Vec::<String>::new());
        assert_eq!(reg.matching_subjects(&[action("a")]), vec!["a".to_string()]);
    }
}
