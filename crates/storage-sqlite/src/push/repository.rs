//! Repository for push registrations.

use diesel::prelude::*;

use caresync_core::push::PushRegistration;

use crate::db::DbPool;
use crate::errors::Result;
use crate::schema::push_registrations;

use super::model::PushRegistrationDB;

#[derive(Clone)]
pub struct PushRegistrationRepository {
    pool: DbPool,
}

impl PushRegistrationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn load_all(&self) -> Result<Vec<PushRegistration>> {
        let mut conn = self.pool.get()?;
        let rows: Vec<PushRegistrationDB> = push_registrations::table.load(&mut conn)?;
        rows.iter().map(PushRegistrationDB::to_domain).collect()
    }

    /// Creates or refreshes the registration for its
    /// (user, project, database, device) key. Re-registration replaces the
    /// token and restrictions but keeps the row identity. Returns the stored
    /// registration.
    pub fn upsert(&self, reg: &PushRegistration) -> Result<PushRegistration> {
        let mut conn = self.pool.get()?;
        let existing: Option<PushRegistrationDB> = push_registrations::table
            .filter(push_registrations::user.eq(&reg.user))
            .filter(push_registrations::project.eq(&reg.project))
            .filter(push_registrations::database.eq(&reg.database))
            .filter(push_registrations::device_id.eq(&reg.device_id))
            .first(&mut conn)
            .optional()?;
        let row = match existing {
            Some(found) => {
                diesel::update(push_registrations::table.find(&found.id))
                    .set((
                        push_registrations::fcm_token.eq(&reg.fcm_token),
                        push_registrations::restrictions
                            .eq(serde_json::to_string(&reg.restrictions)?),
                    ))
                    .execute(&mut conn)?;
                PushRegistrationDB {
                    fcm_token: reg.fcm_token.clone(),
                    restrictions: serde_json::to_string(&reg.restrictions)?,
                    ..found
                }
            }
            None => {
                let row = PushRegistrationDB::from_domain(reg)?;
                diesel::insert_into(push_registrations::table)
                    .values(&row)
                    .execute(&mut conn)?;
                row
            }
        };
        row.to_domain()
    }

    /// Removes the registration of one device. Returns the removed ids.
    pub fn delete_by_device(
        &self,
        database: &str,
        user: &str,
        device_id: &str,
    ) -> Result<Vec<String>> {
        let mut conn = self.pool.get()?;
        let filter = push_registrations::database
            .eq(database.to_string())
            .and(push_registrations::user.eq(user.to_string()))
            .and(push_registrations::device_id.eq(device_id.to_string()));
        let ids: Vec<String> = push_registrations::table
            .filter(filter.clone())
            .select(push_registrations::id)
            .load(&mut conn)?;
        if !ids.is_empty() {
            diesel::delete(push_registrations::table.filter(filter)).execute(&mut conn)?;
        }
        Ok(ids)
    }

    /// Removes all registrations a user holds within a project.
    pub fn delete_user_project(&self, user: &str, project: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get()?;
        let filter = push_registrations::user
            .eq(user.to_string())
            .and(push_registrations::project.eq(project.to_string()));
        let ids: Vec<String> = push_registrations::table
            .filter(filter.clone())
            .select(push_registrations::id)
            .load(&mut conn)?;
        if !ids.is_empty() {
            diesel::delete(push_registrations::table.filter(filter)).execute(&mut conn)?;
        }
        Ok(ids)
    }

    pub fn delete_by_id(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(push_registrations::table.find(id)).execute(&mut conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use caresync_core::sync::TableFilter;

    fn registration(device: &str, token: &str) -> PushRegistration {
        PushRegistration::new(
            "pat",
            "default",
            "default_data",
            device,
            token,
            TableFilter::default(),
        )
    }

    #[test]
    fn reregistration_replaces_token_but_keeps_identity() {
        let repo = PushRegistrationRepository::new(test_pool());
        let first = repo.upsert(&registration("dev-1", "token-a")).unwrap();
        let second = repo.upsert(&registration("dev-1", "token-b")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.fcm_token, "token-b");
        assert_eq!(repo.load_all().unwrap().len(), 1);
    }

    #[test]
    fn unregister_removes_only_the_device() {
        let repo = PushRegistrationRepository::new(test_pool());
        repo.upsert(&registration("dev-1", "token-a")).unwrap();
        repo.upsert(&registration("dev-2", "token-b")).unwrap();
        let removed = repo.delete_by_device("default_data", "pat", "dev-1").unwrap();
        assert_eq!(removed.len(), 1);
        let remaining = repo.load_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "dev-2");
    }
}
