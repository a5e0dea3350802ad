//! The logged mutation model.

use serde::{Deserialize, Serialize};

/// Origin recorded on actions that were written into a database as the
/// result of a synchronization from the remote side. Readers exclude this
/// origin by default so synchronized data is not echoed back.
pub const REMOTE_ORIGIN: &str = "remote";

/// The kind of a logged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Insert,
    Update,
    Delete,
}

/// One mutation in the append-only per-table action log.
///
/// `seq` is assigned by the store when the action is appended and is strictly
/// increasing per table; an appended action is immutable. For actions a
/// client submits, `seq` carries the client's own log sequence, which the
/// server records as write progress to deduplicate resubmitted batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAction {
    #[serde(default)]
    pub id: String,
    pub table: String,
    /// The subject whose data was affected, or `None` for resource tables.
    #[serde(default)]
    pub user: Option<String>,
    pub kind: ActionKind,
    pub record_id: String,
    /// Full record for an insert, changed columns for an update, `None` for
    /// a delete.
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Sample time of the affected record (unix millis), when the table has
    /// a time column. Range restrictions match against this.
    #[serde(default)]
    pub sample_time: Option<i64>,
    /// Time the action was applied (unix millis).
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub seq: i64,
    /// The writer: a user id, or [`REMOTE_ORIGIN`].
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    REMOTE_ORIGIN.to_string()
}

impl DataAction {
    /// The payload as an object map, if present and an object.
    pub fn payload_map(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.payload.as_ref().and_then(|v| v.as_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_uses_snake_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&ActionKind::Insert).unwrap(), "\"insert\"");
        assert_eq!(serde_json::to_string(&ActionKind::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn deserialize_fills_defaults() {
        let action: DataAction = serde_json::from_str(
            r#"{"table":"heart_rate","kind":"delete","recordId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(action.source, REMOTE_ORIGIN);
        assert_eq!(action.seq, 0);
        assert!(action.payload.is_none());
    }
}
