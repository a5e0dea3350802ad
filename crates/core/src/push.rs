//! Push registration model: the binding of a device to push delivery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::TableFilter;

/// A device registered for "data changed" push messages, bound to a push
/// token and an optional table restriction. Upserted by
/// (user, project, database, device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRegistration {
    pub id: String,
    /// The subject whose data changes should be pushed.
    pub user: String,
    pub project: String,
    /// The project database this registration watches.
    pub database: String,
    pub device_id: String,
    pub fcm_token: String,
    /// Limits which tables trigger a push; empty = all tables.
    #[serde(default)]
    pub restrictions: TableFilter,
}

impl PushRegistration {
    pub fn new(
        user: impl Into<String>,
        project: impl Into<String>,
        database: impl Into<String>,
        device_id: impl Into<String>,
        fcm_token: impl Into<String>,
        restrictions: TableFilter,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            project: project.into(),
            database: database.into(),
            device_id: device_id.into(),
            fcm_token: fcm_token.into(),
            restrictions,
        }
    }
}

/// The data payload of a "data changed" push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessageData {
    pub project: String,
    /// The affected subject, or `None` for resource-table changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub table: String,
}
