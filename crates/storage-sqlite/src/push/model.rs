//! Database model for push registrations.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use caresync_core::push::PushRegistration;

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
#[diesel(table_name = crate::schema::push_registrations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PushRegistrationDB {
    pub id: String,
    pub user: String,
    pub project: String,
    pub database: String,
    pub device_id: String,
    pub fcm_token: String,
    pub restrictions: String,
}

impl PushRegistrationDB {
    pub fn to_domain(&self) -> Result<PushRegistration> {
        Ok(PushRegistration {
            id: self.id.clone(),
            user: self.user.clone(),
            project: self.project.clone(),
            database: self.database.clone(),
            device_id: self.device_id.clone(),
            fcm_token: self.fcm_token.clone(),
            restrictions: serde_json::from_str(&self.restrictions)?,
        })
    }

    pub fn from_domain(reg: &PushRegistration) -> Result<Self> {
        Ok(Self {
            id: reg.id.clone(),
            user: reg.user.clone(),
            project: reg.project.clone(),
            database: reg.database.clone(),
            device_id: reg.device_id.clone(),
            fcm_token: reg.fcm_token.clone(),
            restrictions: serde_json::to_string(&reg.restrictions)?,
        })
    }
}
