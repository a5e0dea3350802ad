//! Merging of logged actions per record.
//!
//! A read may return many actions for the same record (an insert followed by
//! updates, updates superseded by a delete). Merging collapses them to one
//! action per record: the newest action, with older insert/update payloads
//! folded in. The merged action keeps the time and sequence of the newest
//! action, so cursor advancement is unaffected.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::errors::{Error, Result};

use super::{ActionKind, DataAction};

/// Merges a list of actions (ascending sequence order). The result contains
/// one action per record, ordered by the merged (newest) action's sequence.
pub fn merge_actions(actions: Vec<DataAction>) -> Result<Vec<DataAction>> {
    // Group per record, newest action first; records ordered by their newest
    // action, newest record first.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<DataAction>> = HashMap::new();
    for action in actions.into_iter().rev() {
        let group = groups.entry(action.record_id.clone()).or_insert_with(|| {
            order.push(action.record_id.clone());
            Vec::new()
        });
        group.push(action);
    }
    let mut merged = Vec::with_capacity(order.len());
    for record_id in order.into_iter().rev() {
        let group = groups.remove(&record_id).expect("grouped above");
        merged.push(merge_record_actions(group)?);
    }
    Ok(merged)
}

/// Merges all actions of one record (newest first) into a single action.
fn merge_record_actions(actions: Vec<DataAction>) -> Result<DataAction> {
    let mut iter = actions.into_iter();
    let mut newest = iter.next().expect("a group is never empty");
    match newest.kind {
        // An insert already carries the full record; a delete supersedes
        // everything before it.
        ActionKind::Insert | ActionKind::Delete => Ok(newest),
        ActionKind::Update => {
            let mut data = payload_object(&newest)?;
            for previous in iter {
                match previous.kind {
                    ActionKind::Insert => {
                        fold_missing(&mut data, payload_object(&previous)?);
                        newest.kind = ActionKind::Insert;
                        break;
                    }
                    ActionKind::Update => {
                        fold_missing(&mut data, payload_object(&previous)?);
                    }
                    ActionKind::Delete => {
                        return Err(Error::database(format!(
                            "can't merge delete into update for record {}",
                            newest.record_id
                        )));
                    }
                }
            }
            newest.payload = Some(Value::Object(data));
            Ok(newest)
        }
    }
}

fn payload_object(action: &DataAction) -> Result<Map<String, Value>> {
    action
        .payload_map()
        .cloned()
        .ok_or_else(|| {
            Error::database(format!(
                "logged {:?} action for record {} has no payload object",
                action.kind, action.record_id
            ))
        })
}

/// Copies keys present in `older` but absent in `data`.
fn fold_missing(data: &mut Map<String, Value>, older: Map<String, Value>) {
    for (key, value) in older {
        data.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(seq: i64, record: &str, kind: ActionKind, payload: Option<Value>) -> DataAction {
        DataAction {
            id: format!("a{}", seq),
            table: "heart_rate".to_string(),
            user: Some("pat".to_string()),
            kind,
            record_id: record.to_string(),
            payload,
            sample_time: None,
            time: seq,
            seq,
            source: "pat".to_string(),
        }
    }

    #[test]
    fn insert_and_updates_merge_to_insert() {
        let merged = merge_actions(vec![
            action(1, "r1", ActionKind::Insert, Some(json!({"id": "r1", "bpm": 60}))),
            action(2, "r1", ActionKind::Update, Some(json!({"bpm": 70}))),
            action(3, "r1", ActionKind::Update, Some(json!({"note": "x"}))),
        ])
        .unwrap();
        assert_eq!(merged.len(), 1);
        let result = &merged[0];
        assert_eq!(result.kind, ActionKind::Insert);
        assert_eq!(result.seq, 3);
        assert_eq!(
            result.payload,
            Some(json!({"id": "r1", "bpm": 70, "note": "x"}))
        );
    }

    #[test]
    fn trailing_delete_wins() {
        let merged = merge_actions(vec![
            action(1, "r1", ActionKind::Insert, Some(json!({"id": "r1"}))),
            action(2, "r1", ActionKind::Delete, None),
        ])
        .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, ActionKind::Delete);
        assert!(merged[0].payload.is_none());
    }

    #[test]
    fn result_is_ordered_by_newest_action_per_record() {
        let merged = merge_actions(vec![
            action(1, "r1", ActionKind::Insert, Some(json!({"id": "r1"}))),
            action(2, "r2", ActionKind::Insert, Some(json!({"id": "r2"}))),
            action(3, "r1", ActionKind::Update, Some(json!({"bpm": 70}))),
        ])
        .unwrap();
        let ids: Vec<&str> = merged.iter().map(|a| a.record_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1"]);
        assert_eq!(merged[1].seq, 3);
    }

    #[test]
    fn delete_before_update_is_a_log_error() {
        let err = merge_actions(vec![
            action(1, "r1", ActionKind::Delete, None),
            action(2, "r1", ActionKind::Update, Some(json!({"bpm": 70}))),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
    }
}
