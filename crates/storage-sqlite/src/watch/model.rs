//! Database models for watch registrations.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use caresync_core::watch::{WatchSubjectRegistration, WatchTableRegistration};

use crate::errors::Result;

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
#[diesel(table_name = crate::schema::watch_table_registrations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WatchTableRegistrationDB {
    pub id: String,
    pub user: String,
    pub project: String,
    pub table_name: String,
    pub subject: Option<String>,
    pub callback_url: Option<String>,
    pub last_watch_time: i64,
    pub triggered_subjects: String,
    pub callback_fail_count: i32,
    pub callback_fail_start: i64,
}

impl WatchTableRegistrationDB {
    pub fn to_domain(&self) -> Result<WatchTableRegistration> {
        Ok(WatchTableRegistration {
            id: self.id.clone(),
            user: self.user.clone(),
            project: self.project.clone(),
            table: self.table_name.clone(),
            subject: self.subject.clone(),
            callback_url: self.callback_url.clone(),
            last_watch_time: self.last_watch_time,
            triggered_subjects: serde_json::from_str(&self.triggered_subjects)?,
            callback_fail_count: self.callback_fail_count,
            callback_fail_start: self.callback_fail_start,
        })
    }

    pub fn from_domain(reg: &WatchTableRegistration) -> Result<Self> {
        Ok(Self {
            id: reg.id.clone(),
            user: reg.user.clone(),
            project: reg.project.clone(),
            table_name: reg.table.clone(),
            subject: reg.subject.clone(),
            callback_url: reg.callback_url.clone(),
            last_watch_time: reg.last_watch_time,
            triggered_subjects: serde_json::to_string(&reg.triggered_subjects)?,
            callback_fail_count: reg.callback_fail_count,
            callback_fail_start: reg.callback_fail_start,
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
#[diesel(table_name = crate::schema::watch_subject_registrations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WatchSubjectRegistrationDB {
    pub id: String,
    pub user: String,
    pub project: String,
    pub last_watch_time: i64,
    pub events: String,
}

impl WatchSubjectRegistrationDB {
    pub fn to_domain(&self) -> Result<WatchSubjectRegistration> {
        Ok(WatchSubjectRegistration {
            id: self.id.clone(),
            user: self.user.clone(),
            project: self.project.clone(),
            last_watch_time: self.last_watch_time,
            events: serde_json::from_str(&self.events)?,
        })
    }

    pub fn from_domain(reg: &WatchSubjectRegistration) -> Result<Self> {
        Ok(Self {
            id: reg.id.clone(),
            user: reg.user.clone(),
            project: reg.project.clone(),
            last_watch_time: reg.last_watch_time,
            events: serde_json::to_string(&reg.events)?,
        })
    }
}
