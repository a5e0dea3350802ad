//! Database models for the action log tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use caresync_core::sync::{ActionKind, DataAction, SyncProgress};

use crate::errors::Result;

pub(crate) fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::data_actions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DataActionDB {
    pub id: String,
    pub table_name: String,
    pub user: Option<String>,
    pub kind: String,
    pub record_id: String,
    pub payload: Option<String>,
    pub sample_time: Option<i64>,
    pub time: i64,
    pub seq: i64,
    pub source: String,
}

impl DataActionDB {
    pub fn to_domain(&self) -> Result<DataAction> {
        Ok(DataAction {
            id: self.id.clone(),
            table: self.table_name.clone(),
            user: self.user.clone(),
            kind: enum_from_db::<ActionKind>(&self.kind)?,
            record_id: self.record_id.clone(),
            payload: self
                .payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            sample_time: self.sample_time,
            time: self.time,
            seq: self.seq,
            source: self.source.clone(),
        })
    }
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::data_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DataRecordDB {
    pub id: String,
    pub table_name: String,
    pub record_id: String,
    pub user: Option<String>,
    pub sample_time: Option<i64>,
    pub payload: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_progress)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncProgressDB {
    pub id: String,
    pub table_name: String,
    pub user: String,
    pub seq: i64,
}

impl SyncProgressDB {
    pub fn to_domain(&self) -> SyncProgress {
        SyncProgress {
            table: self.table_name.clone(),
            user: Some(self.user.clone()),
            seq: self.seq,
        }
    }
}
