//! The synchronization read/write engine.
//!
//! A [`Synchronizer`] is a stateless value configured for one request: the
//! subject whose data is synchronized, the table filter and the time-range
//! restrictions in effect (client-supplied plus the ranges the access
//! resolver granted). Reads are a pure function of the supplied progress;
//! writes validate the whole batch up front and apply it in one storage
//! transaction.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::access::SubjectAccess;
use crate::errors::{Error, Result};
use crate::projects::{ProjectDef, TableDef};

use super::{
    find_table_progress, merge_actions, ActionKind, DataAction, SyncActionStats, SyncProgress,
    TableFilter, TimeRangeRestriction,
};

/// Selection criteria for scanning one table's action log.
#[derive(Debug, Clone, Default)]
pub struct ActionQuery {
    /// Only actions with a sequence strictly greater than this.
    pub after_seq: Option<i64>,
    /// Only actions applied at or before this time (unix millis).
    pub max_time: Option<i64>,
    /// Actions from these origins are skipped.
    pub exclude_sources: Vec<String>,
    /// Sample-time windows (start inclusive, end exclusive); all must hold.
    pub sample_ranges: Vec<(i64, i64)>,
    /// Maximum number of actions to return; `<= 0` means no limit.
    pub limit: i64,
}

/// One validated mutation, ready to be applied atomically with the rest of
/// its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWrite {
    pub table: String,
    pub user: Option<String>,
    pub kind: ActionKind,
    pub record_id: String,
    pub payload: Option<Map<String, Value>>,
    pub sample_time: Option<i64>,
}

/// Storage operations the synchronizer needs. Implementations provide
/// ordered per-table scans of the action log and an atomic batch apply; all
/// further concurrency control is delegated to the storage layer.
pub trait ActionStore: Send + Sync {
    fn list_actions(
        &self,
        table: &str,
        user: Option<&str>,
        query: &ActionQuery,
    ) -> Result<Vec<DataAction>>;

    /// Returns the number of matching actions and the newest action time.
    fn count_actions(
        &self,
        table: &str,
        user: Option<&str>,
        query: &ActionQuery,
    ) -> Result<(i64, Option<i64>)>;

    /// Server-persisted progress rows for the user, all tables.
    fn stored_progress(&self, user: &str) -> Result<Vec<SyncProgress>>;

    fn select_record(&self, table: &str, record_id: &str) -> Result<Option<Map<String, Value>>>;

    /// Applies the writes, appends them to the action log with `origin` as
    /// source, and advances the stored progress rows — all in one
    /// transaction. Returns the appended actions.
    fn apply_batch(
        &self,
        writes: &[PreparedWrite],
        progress: &[SyncProgress],
        origin: &str,
    ) -> Result<Vec<DataAction>>;
}

/// Read/write engine for one subject within one project.
pub struct Synchronizer<'a> {
    store: &'a dyn ActionStore,
    project: &'a ProjectDef,
    user: String,
    filter: TableFilter,
    restrictions: Vec<TimeRangeRestriction>,
    allow_write_resource_tables: bool,
    include_write_resource_tables: Vec<String>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(store: &'a dyn ActionStore, project: &'a ProjectDef, user: impl Into<String>) -> Self {
        Self {
            store,
            project,
            user: user.into(),
            filter: TableFilter::default(),
            restrictions: Vec::new(),
            allow_write_resource_tables: false,
            include_write_resource_tables: Vec::new(),
        }
    }

    pub fn with_table_filter(mut self, filter: TableFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Adds sample-time restrictions. All restrictions matching a table are
    /// applied together (intersection).
    pub fn with_restrictions(mut self, restrictions: Vec<TimeRangeRestriction>) -> Self {
        self.restrictions.extend(restrictions);
        self
    }

    /// Allows writes to resource tables (tables without a user column),
    /// optionally limited to the listed tables.
    pub fn with_resource_table_writes(mut self, tables: Vec<String>) -> Self {
        self.allow_write_resource_tables = true;
        self.include_write_resource_tables = tables;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// The project tables this synchronizer covers, in project order.
    pub fn sync_tables(&self) -> Vec<&TableDef> {
        self.project
            .tables
            .iter()
            .filter(|t| self.filter.includes(&t.name))
            .collect()
    }

    fn table_ranges(&self, table: &str) -> Vec<(i64, i64)> {
        self.restrictions
            .iter()
            .filter(|r| r.table == table)
            .map(|r| (r.start_time, r.end_time))
            .collect()
    }

    fn action_user(&self, table: &TableDef) -> Option<&str> {
        table.is_user_table().then_some(self.user.as_str())
    }

    /// Reads the next batch of actions the client has not seen, per the
    /// supplied progress. Stops once `max_count` actions were collected
    /// (`<= 0` = unbounded) or the per-table scan passed `max_time`.
    /// Consecutive actions per record are merged. No side effects; the
    /// remainder stays available for the next call.
    pub fn read_actions(
        &self,
        progress: Option<&[SyncProgress]>,
        max_count: i64,
        max_time: Option<i64>,
        exclude_origins: &[String],
    ) -> Result<Vec<DataAction>> {
        let mut actions: Vec<DataAction> = Vec::new();
        for table in self.sync_tables() {
            if max_count > 0 && actions.len() as i64 >= max_count {
                break;
            }
            let query = ActionQuery {
                after_seq: find_table_progress(progress, &table.name).map(|p| p.seq),
                max_time,
                exclude_sources: exclude_origins.to_vec(),
                sample_ranges: self.table_ranges(&table.name),
                limit: if max_count > 0 {
                    max_count - actions.len() as i64
                } else {
                    0
                },
            };
            let unmerged = self
                .store
                .list_actions(&table.name, self.action_user(table), &query)?;
            actions.extend(merge_actions(unmerged)?);
        }
        Ok(actions)
    }

    /// Counts pending actions and finds the newest pending action time,
    /// using the same filtering as [`read_actions`](Self::read_actions).
    pub fn action_stats(
        &self,
        progress: Option<&[SyncProgress]>,
        exclude_origins: &[String],
    ) -> Result<SyncActionStats> {
        let mut total = 0i64;
        let mut latest: Option<i64> = None;
        for table in self.sync_tables() {
            let query = ActionQuery {
                after_seq: find_table_progress(progress, &table.name).map(|p| p.seq),
                max_time: None,
                exclude_sources: exclude_origins.to_vec(),
                sample_ranges: self.table_ranges(&table.name),
                limit: 0,
            };
            let (count, max_time) = self
                .store
                .count_actions(&table.name, self.action_user(table), &query)?;
            if count == 0 {
                continue;
            }
            total += count;
            latest = match (latest, max_time) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (None, time) => time,
                (time, None) => time,
            };
        }
        Ok(SyncActionStats::new(
            progress.map(|p| p.to_vec()),
            total,
            latest,
        ))
    }

    /// Returns the server-persisted progress for the subject across included
    /// tables, ordered by table name.
    pub fn sync_progress(&self) -> Result<Vec<SyncProgress>> {
        let mut rows: Vec<SyncProgress> = self
            .store
            .stored_progress(&self.user)?
            .into_iter()
            .filter(|p| self.filter.includes(&p.table))
            .collect();
        rows.sort_by(|a, b| a.table.cmp(&b.table));
        for pair in rows.windows(2) {
            if pair[0].table == pair[1].table {
                return Err(Error::database(format!(
                    "duplicate sync progress for table \"{}\"",
                    pair[0].table
                )));
            }
        }
        Ok(rows)
    }

    /// Validates and applies a batch of client actions. The batch is
    /// all-or-nothing: the first `Forbidden` or `IllegalInput` aborts it
    /// before anything is applied. Returns the appended actions so the
    /// caller can wake listeners and notify push.
    pub fn write_actions(
        &self,
        actions: &[DataAction],
        origin: &str,
        access: &HashMap<String, SubjectAccess>,
    ) -> Result<Vec<DataAction>> {
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self.store.stored_progress(&self.user)?;
        let mut writes: Vec<PreparedWrite> = Vec::new();
        let mut progress: HashMap<String, i64> = HashMap::new();
        for action in actions {
            let table = self.validate_table(action)?;
            let table_access = access.get(&table.name).ok_or_else(|| {
                Error::forbidden(format!("writing to table \"{}\" not allowed", table.name))
            })?;
            if let Some(write) = self.validate_action(action, table, &stored, table_access)? {
                writes.push(write);
            }
            // Progress advances over skipped actions too; a resubmitted
            // batch must not reapply them.
            if action.seq > 0 {
                let entry = progress.entry(table.name.clone()).or_insert(action.seq);
                *entry = (*entry).max(action.seq);
            }
        }
        let progress: Vec<SyncProgress> = progress
            .into_iter()
            .map(|(table, seq)| SyncProgress {
                table,
                user: Some(self.user.clone()),
                seq,
            })
            .collect();
        log::debug!(
            "applying batch of {} actions ({} skipped) for user {}",
            writes.len(),
            actions.len() - writes.len(),
            self.user
        );
        self.store.apply_batch(&writes, &progress, origin)
    }

    fn validate_table(&self, action: &DataAction) -> Result<&TableDef> {
        if action.table.is_empty() {
            return Err(Error::illegal_input("table not set"));
        }
        if action.table.starts_with('_') {
            return Err(Error::forbidden(format!(
                "writing to reserved table \"{}\" not allowed",
                action.table
            )));
        }
        let table = self
            .project
            .find_table(&action.table)
            .ok_or_else(|| Error::illegal_input(format!("table \"{}\" not found", action.table)))?;
        if !self.filter.includes(&table.name) {
            return Err(Error::forbidden(format!(
                "writing to table \"{}\" not allowed",
                table.name
            )));
        }
        Ok(table)
    }

    fn is_write_resource_table_allowed(&self, table: &str) -> bool {
        self.allow_write_resource_tables
            && (self.include_write_resource_tables.is_empty()
                || self.include_write_resource_tables.iter().any(|t| t == table))
    }

    /// Validates one action. Returns `None` when the action must be skipped:
    /// it lies at or below the stored write progress, or it updates/deletes
    /// a record that no longer exists (superseded by a later delete that
    /// will be resubmitted as well).
    fn validate_action(
        &self,
        action: &DataAction,
        table: &TableDef,
        stored_progress: &[SyncProgress],
        access: &SubjectAccess,
    ) -> Result<Option<PreparedWrite>> {
        let is_user_table = table.is_user_table();
        if is_user_table {
            match &action.user {
                None => {
                    return Err(Error::forbidden(format!(
                        "user not specified in action for user data table \"{}\"",
                        table.name
                    )))
                }
                Some(user) if *user != self.user => {
                    return Err(Error::forbidden(format!(
                        "writing data for user \"{}\" not allowed",
                        user
                    )))
                }
                Some(_) => {}
            }
        } else if !self.is_write_resource_table_allowed(&table.name) {
            return Err(Error::forbidden(format!(
                "writing to resource table \"{}\" not allowed",
                table.name
            )));
        }
        if action.record_id.is_empty() {
            return Err(Error::illegal_input("record ID not set"));
        }

        if let Some(progress) = find_table_progress(Some(stored_progress), &table.name) {
            if action.seq > 0 && action.seq <= progress.seq {
                return Ok(None);
            }
        }

        let record = self.store.select_record(&table.name, &action.record_id)?;
        if is_user_table {
            if let Some(record) = &record {
                let record_user = record.get("user").and_then(|v| v.as_str());
                if record_user != action.user.as_deref() {
                    return Err(Error::forbidden(format!(
                        "record with ID \"{}\" does not match user \"{}\"",
                        action.record_id,
                        action.user.as_deref().unwrap_or_default()
                    )));
                }
            }
        }

        let mut kind = action.kind;
        match kind {
            ActionKind::Update | ActionKind::Delete => {
                if record.is_none() {
                    return Ok(None);
                }
            }
            ActionKind::Insert => {
                // Merging can turn insert+updates into one insert; if the
                // original insert already ran, the record exists and the
                // action degrades to an update.
                if record.is_some() {
                    kind = ActionKind::Update;
                }
            }
        }

        let mut payload = match kind {
            ActionKind::Delete => {
                if action.payload.is_some() {
                    return Err(Error::illegal_input(
                        "delete action must not carry a payload",
                    ));
                }
                None
            }
            _ => Some(self.validate_payload(action, table, kind)?),
        };
        if let Some(data) = payload.as_mut() {
            if kind == ActionKind::Update {
                data.remove("id");
            }
        }

        let sample_time = self.resolve_sample_time(table, payload.as_ref(), record.as_ref())?;
        if let Some(t) = sample_time {
            access.check_sample_time(t)?;
        }

        Ok(Some(PreparedWrite {
            table: table.name.clone(),
            user: action.user.clone(),
            kind,
            record_id: action.record_id.clone(),
            payload,
            sample_time,
        }))
    }

    fn validate_payload(
        &self,
        action: &DataAction,
        table: &TableDef,
        kind: ActionKind,
    ) -> Result<Map<String, Value>> {
        let data = action
            .payload_map()
            .ok_or_else(|| {
                Error::illegal_input(format!("data not found for {:?} action", action.kind))
            })?
            .clone();
        for key in data.keys() {
            if key != "id" && !table.columns.iter().any(|c| c == key) {
                return Err(Error::illegal_input(format!(
                    "unknown field \"{}\" in table \"{}\"",
                    key, table.name
                )));
            }
        }
        match kind {
            ActionKind::Insert => {
                let data_id = data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::illegal_input("field \"id\" not set in data to insert"))?;
                if data_id != action.record_id {
                    return Err(Error::illegal_input(format!(
                        "field \"id\" ({}) does not match record ID ({})",
                        data_id, action.record_id
                    )));
                }
                if table.is_user_table() {
                    let data_user = data.get("user").and_then(|v| v.as_str()).ok_or_else(|| {
                        Error::illegal_input(format!(
                            "field \"user\" not set in data to insert into user data table \"{}\"",
                            table.name
                        ))
                    })?;
                    if Some(data_user) != action.user.as_deref() {
                        return Err(Error::illegal_input(format!(
                            "field \"user\" ({}) does not match user of action on table \"{}\"",
                            data_user, table.name
                        )));
                    }
                }
            }
            ActionKind::Update => {
                if let Some(data_id) = data.get("id") {
                    if data_id.as_str() != Some(action.record_id.as_str()) {
                        return Err(Error::forbidden("changing record ID not allowed"));
                    }
                }
                if table.is_user_table() {
                    if let Some(data_user) = data.get("user") {
                        if data_user.as_str() != action.user.as_deref() {
                            return Err(Error::forbidden(format!(
                                "changing field \"user\" not allowed in user data table \"{}\"",
                                table.name
                            )));
                        }
                    }
                }
            }
            ActionKind::Delete => unreachable!("delete payload handled by caller"),
        }
        Ok(data)
    }

    /// The effective sample time of a write: the payload value when the time
    /// column is being set, else the existing record's value.
    fn resolve_sample_time(
        &self,
        table: &TableDef,
        payload: Option<&Map<String, Value>>,
        record: Option<&Map<String, Value>>,
    ) -> Result<Option<i64>> {
        let Some(column) = table.time_column.as_deref() else {
            return Ok(None);
        };
        if let Some(value) = payload.and_then(|p| p.get(column)) {
            let millis = value.as_i64().ok_or_else(|| {
                Error::illegal_input(format!(
                    "field \"{}\" in table \"{}\" must be a unix time in milliseconds",
                    column, table.name
                ))
            })?;
            return Ok(Some(millis));
        }
        if let Some(value) = record.and_then(|r| r.get(column)) {
            return Ok(value.as_i64());
        }
        if payload.is_some() && record.is_none() {
            return Err(Error::illegal_input(format!(
                "field \"{}\" not set in data for table \"{}\"",
                column, table.name
            )));
        }
        Ok(None)
    }
}
