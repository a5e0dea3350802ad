//! Repositories for watch registrations, including the reap criteria for
//! abandoned registrations.

use diesel::prelude::*;

use caresync_core::watch::{
    WatchSubjectRegistration, WatchTableRegistration, REMOVE_AFTER_FAILED_CALLBACK_COUNT,
    REMOVE_AFTER_FAILED_CALLBACK_HOURS, REMOVE_AFTER_WATCH_MINUTES,
};

use crate::db::DbPool;
use crate::errors::Result;
use crate::schema::{watch_subject_registrations, watch_table_registrations};

use super::model::{WatchSubjectRegistrationDB, WatchTableRegistrationDB};

#[derive(Clone)]
pub struct WatchTableRepository {
    pool: DbPool,
}

impl WatchTableRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn load_all(&self) -> Result<Vec<WatchTableRegistration>> {
        let mut conn = self.pool.get()?;
        let rows: Vec<WatchTableRegistrationDB> =
            watch_table_registrations::table.load(&mut conn)?;
        rows.iter().map(WatchTableRegistrationDB::to_domain).collect()
    }

    pub fn insert(&self, reg: &WatchTableRegistration) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::insert_into(watch_table_registrations::table)
            .values(&WatchTableRegistrationDB::from_domain(reg)?)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn update(&self, reg: &WatchTableRegistration) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = WatchTableRegistrationDB::from_domain(reg)?;
        diesel::update(watch_table_registrations::table.find(&reg.id))
            .set(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(watch_table_registrations::table.find(id)).execute(&mut conn)?;
        Ok(())
    }

    /// Deletes registrations that are no longer worth keeping: plain watch
    /// registrations idle for too long, and callback registrations whose
    /// callback has kept failing for the whole failure window. Returns the
    /// removed ids so in-memory listeners can be dropped.
    pub fn reap(&self, now_ms: i64) -> Result<Vec<String>> {
        let min_watch_time = now_ms - REMOVE_AFTER_WATCH_MINUTES * 60 * 1000;
        let min_fail_time = now_ms - REMOVE_AFTER_FAILED_CALLBACK_HOURS * 60 * 60 * 1000;
        let mut conn = self.pool.get()?;
        let idle = watch_table_registrations::callback_url
            .is_null()
            .and(watch_table_registrations::last_watch_time.lt(min_watch_time));
        let failing = watch_table_registrations::callback_url
            .is_not_null()
            .and(
                watch_table_registrations::callback_fail_count
                    .ge(REMOVE_AFTER_FAILED_CALLBACK_COUNT),
            )
            .and(watch_table_registrations::callback_fail_start.gt(0))
            .and(watch_table_registrations::callback_fail_start.lt(min_fail_time));
        let expired: Vec<String> = watch_table_registrations::table
            .filter(idle.clone().or(failing.clone()))
            .select(watch_table_registrations::id)
            .load(&mut conn)?;
        if !expired.is_empty() {
            diesel::delete(watch_table_registrations::table.filter(idle.or(failing)))
                .execute(&mut conn)?;
        }
        Ok(expired)
    }
}

#[derive(Clone)]
pub struct WatchSubjectRepository {
    pool: DbPool,
}

impl WatchSubjectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn load_all(&self) -> Result<Vec<WatchSubjectRegistration>> {
        let mut conn = self.pool.get()?;
        let rows: Vec<WatchSubjectRegistrationDB> =
            watch_subject_registrations::table.load(&mut conn)?;
        rows.iter()
            .map(WatchSubjectRegistrationDB::to_domain)
            .collect()
    }

    pub fn insert(&self, reg: &WatchSubjectRegistration) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::insert_into(watch_subject_registrations::table)
            .values(&WatchSubjectRegistrationDB::from_domain(reg)?)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn update(&self, reg: &WatchSubjectRegistration) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = WatchSubjectRegistrationDB::from_domain(reg)?;
        diesel::update(watch_subject_registrations::table.find(&reg.id))
            .set(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(watch_subject_registrations::table.find(id)).execute(&mut conn)?;
        Ok(())
    }

    pub fn reap(&self, now_ms: i64) -> Result<Vec<String>> {
        let min_watch_time = now_ms - REMOVE_AFTER_WATCH_MINUTES * 60 * 1000;
        let mut conn = self.pool.get()?;
        let expired: Vec<String> = watch_subject_registrations::table
            .filter(watch_subject_registrations::last_watch_time.lt(min_watch_time))
            .select(watch_subject_registrations::id)
            .load(&mut conn)?;
        if !expired.is_empty() {
            diesel::delete(
                watch_subject_registrations::table
                    .filter(watch_subject_registrations::last_watch_time.lt(min_watch_time)),
            )
            .execute(&mut conn)?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn idle_watch_registrations_are_reaped() {
        let repo = WatchTableRepository::new(test_pool());
        let now = 10_000_000_000;
        let mut fresh = WatchTableRegistration::new("u1", "default", "heart_rate", None, None);
        fresh.last_watch_time = now - 1_000;
        let mut stale = WatchTableRegistration::new("u1", "default", "heart_rate", None, None);
        stale.last_watch_time = now - (REMOVE_AFTER_WATCH_MINUTES + 1) * 60 * 1000;
        repo.insert(&fresh).unwrap();
        repo.insert(&stale).unwrap();

        let removed = repo.reap(now).unwrap();
        assert_eq!(removed, vec![stale.id.clone()]);
        let remaining = repo.load_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh.id);
    }

    #[test]
    fn failing_callback_registrations_are_reaped_after_window() {
        let repo = WatchTableRepository::new(test_pool());
        let now = 10_000_000_000;
        let mut failing = WatchTableRegistration::new(
            "u1",
            "default",
            "heart_rate",
            None,
            Some("https://example.com/cb".to_string()),
        );
        // Idle for long, but callbacks keep it alive until the failure
        // window closes.
        failing.last_watch_time = 0;
        failing.callback_fail_count = REMOVE_AFTER_FAILED_CALLBACK_COUNT;
        failing.callback_fail_start = now - 1_000;
        repo.insert(&failing).unwrap();
        assert!(repo.reap(now).unwrap().is_empty());

        failing.callback_fail_start =
            now - (REMOVE_AFTER_FAILED_CALLBACK_HOURS + 1) * 60 * 60 * 1000;
        repo.update(&failing).unwrap();
        assert_eq!(repo.reap(now).unwrap(), vec![failing.id]);
    }

    #[test]
    fn triggered_subjects_roundtrip() {
        let repo = WatchTableRepository::new(test_pool());
        let mut reg = WatchTableRegistration::new(
            "u1",
            "default",
            "heart_rate",
            Some("pat".to_string()),
            None,
        );
        reg.triggered_subjects = vec!["pat".to_string()];
        repo.insert(&reg).unwrap();
        let loaded = repo.load_all().unwrap();
        assert_eq!(loaded[0].triggered_subjects, vec!["pat".to_string()]);
        assert_eq!(loaded[0].subject.as_deref(), Some("pat"));
    }
}
