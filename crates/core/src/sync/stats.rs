//! Summary statistics about pending synchronization work.

use serde::{Deserialize, Serialize};

use super::SyncProgress;

/// Statistics about new actions that a read with the same filters would
/// return. `count` is the number of unmerged actions (the actual read may
/// return fewer after merging); `latest_time` is the time of the newest
/// pending action, or `None` when nothing is pending. Counts and times come
/// from separate queries and may not correspond exactly under concurrent
/// writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActionStats {
    #[serde(default)]
    pub progress: Option<Vec<SyncProgress>>,
    pub count: i64,
    #[serde(default)]
    pub latest_time: Option<i64>,
}

impl SyncActionStats {
    pub fn new(progress: Option<Vec<SyncProgress>>, count: i64, latest_time: Option<i64>) -> Self {
        Self {
            progress,
            count,
            latest_time,
        }
    }
}
