//! Database models for directory tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use caresync_core::users::{Role, User};

use crate::actions::{enum_from_db, enum_to_db};
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
#[diesel(primary_key(userid))]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct UserDB {
    pub userid: String,
    pub email: String,
    pub role: String,
    pub active: i32,
    pub auth_token: Option<String>,
}

impl UserDB {
    pub fn to_domain(&self) -> Result<User> {
        Ok(User {
            userid: self.userid.clone(),
            email: self.email.clone(),
            role: enum_from_db::<Role>(&self.role)?,
            active: self.active != 0,
        })
    }

    pub fn from_domain(user: &User, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            userid: user.userid.clone(),
            email: user.email.clone(),
            role: enum_to_db(&user.role)?,
            active: i32::from(user.active),
            auth_token,
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
#[diesel(table_name = crate::schema::access_group_members)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AccessGroupMemberDB {
    pub id: String,
    pub group_name: String,
    pub userid: String,
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
#[diesel(table_name = crate::schema::project_users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProjectUserDB {
    pub id: String,
    pub project: String,
    pub userid: String,
    pub role: String,
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
#[diesel(table_name = crate::schema::project_user_access)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ProjectUserAccessDB {
    pub id: String,
    pub project: String,
    pub grantee: String,
    pub subject: String,
    pub access_rule: String,
}
