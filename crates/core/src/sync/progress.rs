//! Per-(user, table) synchronization cursors.

use serde::{Deserialize, Serialize};

/// Marks how far a user's synchronization of one table has progressed: the
/// sequence number of the last action consumed. Monotonically non-decreasing
/// across successful reads.
///
/// The authoritative cursor for reads is always the one the client supplies;
/// rows the server stores track how far it has consumed each client's own
/// log (write dedup) and serve `getProgress` diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub table: String,
    #[serde(default)]
    pub user: Option<String>,
    pub seq: i64,
}

/// Finds the progress entry for a table. The `user` field of supplied
/// progress entries is ignored.
pub fn find_table_progress<'a>(
    progress: Option<&'a [SyncProgress]>,
    table: &str,
) -> Option<&'a SyncProgress> {
    progress?.iter().find(|p| p.table == table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_progress_by_table() {
        let progress = vec![
            SyncProgress {
                table: "a".to_string(),
                user: None,
                seq: 4,
            },
            SyncProgress {
                table: "b".to_string(),
                user: None,
                seq: 9,
            },
        ];
        assert_eq!(find_table_progress(Some(&progress), "b").map(|p| p.seq), Some(9));
        assert!(find_table_progress(Some(&progress), "c").is_none());
        assert!(find_table_progress(None, "a").is_none());
    }
}
