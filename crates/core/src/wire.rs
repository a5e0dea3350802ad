//! Versioned wire mapping.
//!
//! There is exactly one in-memory representation of every entity; protocol
//! differences are handled by pure mapping functions at the edge. The only
//! surviving difference between protocol generations is subject addressing:
//! old clients address and receive subjects by email, current clients by
//! user id.

use serde_json::Value;

use crate::sync::DataAction;
use crate::users::UserCache;

/// Supported protocol generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    /// Subjects addressed by email.
    V5,
    /// Subjects addressed by user id.
    #[default]
    V6,
}

impl ProtocolVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "5" | "5.0" => Some(Self::V5),
            "6" | "6.0" => Some(Self::V6),
            _ => None,
        }
    }
}

/// Maps an action to its wire form for the given protocol version.
pub fn action_to_wire(version: ProtocolVersion, action: &DataAction, users: &UserCache) -> Value {
    let mut value = serde_json::to_value(action).unwrap_or(Value::Null);
    if version == ProtocolVersion::V5 {
        if let Some(userid) = &action.user {
            if let Some(user) = users.find_by_userid(userid) {
                if let Some(object) = value.as_object_mut() {
                    object.insert("user".to_string(), Value::String(user.email));
                }
            }
        }
    }
    value
}

/// Maps a list of subject user ids to their wire form for the given protocol
/// version. Unknown users are passed through unchanged.
pub fn subjects_to_wire(
    version: ProtocolVersion,
    subjects: &[String],
    users: &UserCache,
) -> Vec<String> {
    if version == ProtocolVersion::V6 {
        return subjects.to_vec();
    }
    subjects
        .iter()
        .map(|userid| {
            users
                .find_by_userid(userid)
                .map(|u| u.email)
                .unwrap_or_else(|| userid.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ActionKind;
    use crate::users::{Role, User};

    fn cache() -> UserCache {
        UserCache::new(vec![User {
            userid: "u1".to_string(),
            email: "alice@example.com".to_string(),
            role: Role::Patient,
            active: true,
        }])
    }

    #[test]
    fn old_protocol_maps_userid_to_email() {
        let action = DataAction {
            id: "a1".to_string(),
            table: "heart_rate".to_string(),
            user: Some("u1".to_string()),
            kind: ActionKind::Delete,
            record_id: "r1".to_string(),
            payload: None,
            sample_time: None,
            time: 1,
            seq: 1,
            source: "u1".to_string(),
        };
        let users = cache();
        let old = action_to_wire(ProtocolVersion::V5, &action, &users);
        assert_eq!(old["user"], "alice@example.com");
        let current = action_to_wire(ProtocolVersion::V6, &action, &users);
        assert_eq!(current["user"], "u1");
    }

    #[test]
    fn subject_lists_map_per_version() {
        let users = cache();
        let subjects = vec!["u1".to_string(), "ghost".to_string()];
        assert_eq!(
            subjects_to_wire(ProtocolVersion::V5, &subjects, &users),
            vec!["alice@example.com".to_string(), "ghost".to_string()]
        );
        assert_eq!(subjects_to_wire(ProtocolVersion::V6, &subjects, &users), subjects);
    }
}
