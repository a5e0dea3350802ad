//! Repository implementing the core action store over SQLite.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::{Sqlite, SqliteConnection};
use serde_json::{Map, Value};
use uuid::Uuid;

use caresync_core::sync::{
    ActionKind, ActionQuery, ActionStore, DataAction, PreparedWrite, SyncProgress,
};

use crate::db::DbPool;
use crate::errors::StorageError;
use crate::schema::{data_actions, data_records, sync_progress};

use super::model::{enum_to_db, DataActionDB, DataRecordDB, SyncProgressDB};

/// Persistence for the append-only action log, the current record state and
/// the server-side sync progress. The action log is only ever written through
/// [`ActionStore::apply_batch`].
#[derive(Clone)]
pub struct ActionLogRepository {
    pool: DbPool,
}

impl ActionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn filtered(
        table: &str,
        user: Option<&str>,
        query: &ActionQuery,
    ) -> data_actions::BoxedQuery<'static, Sqlite> {
        let mut q = data_actions::table
            .filter(data_actions::table_name.eq(table.to_string()))
            .into_boxed();
        q = match user {
            Some(user) => q.filter(data_actions::user.eq(user.to_string())),
            None => q.filter(data_actions::user.is_null()),
        };
        if let Some(after) = query.after_seq {
            q = q.filter(data_actions::seq.gt(after));
        }
        if let Some(max_time) = query.max_time {
            q = q.filter(data_actions::time.le(max_time));
        }
        for source in &query.exclude_sources {
            q = q.filter(data_actions::source.ne(source.clone()));
        }
        for (start, end) in &query.sample_ranges {
            q = q
                .filter(data_actions::sample_time.ge(*start))
                .filter(data_actions::sample_time.lt(*end));
        }
        q
    }

    fn next_seq(conn: &mut SqliteConnection, table: &str) -> Result<i64, StorageError> {
        let max: Option<i64> = data_actions::table
            .filter(data_actions::table_name.eq(table))
            .select(diesel::dsl::max(data_actions::seq))
            .get_result(conn)?;
        Ok(max.unwrap_or(0) + 1)
    }

    fn apply_record(conn: &mut SqliteConnection, write: &PreparedWrite) -> Result<(), StorageError> {
        match write.kind {
            ActionKind::Insert => {
                let payload = write.payload.clone().unwrap_or_default();
                let row = DataRecordDB {
                    id: Uuid::new_v4().to_string(),
                    table_name: write.table.clone(),
                    record_id: write.record_id.clone(),
                    user: write.user.clone(),
                    sample_time: write.sample_time,
                    payload: serde_json::to_string(&payload)?,
                };
                diesel::insert_into(data_records::table)
                    .values(&row)
                    .on_conflict((data_records::table_name, data_records::record_id))
                    .do_update()
                    .set((
                        data_records::payload.eq(row.payload.clone()),
                        data_records::sample_time.eq(row.sample_time),
                    ))
                    .execute(conn)?;
            }
            ActionKind::Update => {
                let existing: Option<DataRecordDB> = data_records::table
                    .filter(data_records::table_name.eq(&write.table))
                    .filter(data_records::record_id.eq(&write.record_id))
                    .first(conn)
                    .optional()?;
                let Some(existing) = existing else {
                    // Validated against a record that a concurrent batch
                    // deleted; the update has nothing left to change.
                    return Ok(());
                };
                let mut merged: Map<String, Value> = serde_json::from_str(&existing.payload)?;
                if let Some(changes) = &write.payload {
                    for (key, value) in changes {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                diesel::update(data_records::table.filter(data_records::id.eq(&existing.id)))
                    .set((
                        data_records::payload.eq(serde_json::to_string(&merged)?),
                        data_records::sample_time.eq(write.sample_time),
                    ))
                    .execute(conn)?;
            }
            ActionKind::Delete => {
                diesel::delete(
                    data_records::table
                        .filter(data_records::table_name.eq(&write.table))
                        .filter(data_records::record_id.eq(&write.record_id)),
                )
                .execute(conn)?;
            }
        }
        Ok(())
    }

    fn upsert_progress(
        conn: &mut SqliteConnection,
        update: &SyncProgress,
    ) -> Result<(), StorageError> {
        let user = update.user.clone().unwrap_or_default();
        let existing: Option<SyncProgressDB> = sync_progress::table
            .filter(sync_progress::table_name.eq(&update.table))
            .filter(sync_progress::user.eq(&user))
            .first(conn)
            .optional()?;
        match existing {
            Some(row) if row.seq >= update.seq => {}
            Some(row) => {
                diesel::update(sync_progress::table.filter(sync_progress::id.eq(row.id)))
                    .set(sync_progress::seq.eq(update.seq))
                    .execute(conn)?;
            }
            None => {
                let row = SyncProgressDB {
                    id: Uuid::new_v4().to_string(),
                    table_name: update.table.clone(),
                    user,
                    seq: update.seq,
                };
                diesel::insert_into(sync_progress::table)
                    .values(&row)
                    .execute(conn)?;
            }
        }
        Ok(())
    }
}

impl ActionStore for ActionLogRepository {
    fn list_actions(
        &self,
        table: &str,
        user: Option<&str>,
        query: &ActionQuery,
    ) -> caresync_core::Result<Vec<DataAction>> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let mut q = Self::filtered(table, user, query).order(data_actions::seq.asc());
        if query.limit > 0 {
            q = q.limit(query.limit);
        }
        let rows: Vec<DataActionDB> = q.load(&mut conn).map_err(StorageError::from)?;
        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            actions.push(row.to_domain()?);
        }
        Ok(actions)
    }

    fn count_actions(
        &self,
        table: &str,
        user: Option<&str>,
        query: &ActionQuery,
    ) -> caresync_core::Result<(i64, Option<i64>)> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let count: i64 = Self::filtered(table, user, query)
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?;
        if count == 0 {
            return Ok((0, None));
        }
        let newest: Option<DataActionDB> = Self::filtered(table, user, query)
            .order(data_actions::time.desc())
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok((count, newest.map(|a| a.time)))
    }

    fn stored_progress(&self, user: &str) -> caresync_core::Result<Vec<SyncProgress>> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let rows: Vec<SyncProgressDB> = sync_progress::table
            .filter(sync_progress::user.eq(user))
            .order(sync_progress::table_name.asc())
            .load(&mut conn)
            .map_err(StorageError::from)?;
        Ok(rows.iter().map(SyncProgressDB::to_domain).collect())
    }

    fn select_record(
        &self,
        table: &str,
        record_id: &str,
    ) -> caresync_core::Result<Option<Map<String, Value>>> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let row: Option<DataRecordDB> = data_records::table
            .filter(data_records::table_name.eq(table))
            .filter(data_records::record_id.eq(record_id))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let payload = serde_json::from_str(&row.payload).map_err(StorageError::from)?;
                Ok(Some(payload))
            }
        }
    }

    fn apply_batch(
        &self,
        writes: &[PreparedWrite],
        progress: &[SyncProgress],
        origin: &str,
    ) -> caresync_core::Result<Vec<DataAction>> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let applied = conn
            .transaction::<_, StorageError, _>(|conn| {
                let now = Utc::now().timestamp_millis();
                let mut applied = Vec::with_capacity(writes.len());
                for write in writes {
                    Self::apply_record(conn, write)?;
                    let row = DataActionDB {
                        id: Uuid::new_v4().to_string(),
                        table_name: write.table.clone(),
                        user: write.user.clone(),
                        kind: enum_to_db(&write.kind)?,
                        record_id: write.record_id.clone(),
                        payload: write
                            .payload
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        sample_time: write.sample_time,
                        time: now,
                        seq: Self::next_seq(conn, &write.table)?,
                        source: origin.to_string(),
                    };
                    diesel::insert_into(data_actions::table)
                        .values(&row)
                        .execute(conn)?;
                    applied.push(row.to_domain()?);
                }
                for update in progress {
                    Self::upsert_progress(conn, update)?;
                }
                Ok(applied)
            })
            .map_err(caresync_core::Error::from)?;
        if !applied.is_empty() {
            log::debug!(
                "applied batch of {} actions from origin {}",
                applied.len(),
                origin
            );
        }
        Ok(applied)
    }
}
