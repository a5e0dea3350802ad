//! Directory repository and the core access-directory implementation.

use diesel::prelude::*;
use uuid::Uuid;

use caresync_core::access::{AccessDirectory, AccessRule};
use caresync_core::users::{Role, User};

use crate::actions::enum_to_db;
use crate::db::DbPool;
use crate::errors::{Result, StorageError};
use crate::schema::{access_group_members, project_user_access, project_users, users};

use super::model::{AccessGroupMemberDB, ProjectUserAccessDB, ProjectUserDB, UserDB};

/// Persistence for users, access groups, project membership and access
/// rules. Account administration itself lives outside this system; the
/// mutation helpers here are the provisioning seam it writes through.
#[derive(Clone)]
pub struct DirectoryRepository {
    pool: DbPool,
}

impl DirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn all_users(&self) -> Result<Vec<User>> {
        let mut conn = self.pool.get()?;
        let rows: Vec<UserDB> = users::table.load(&mut conn)?;
        rows.iter().map(UserDB::to_domain).collect()
    }

    pub fn find_user_by_token(&self, token: &str) -> Result<Option<User>> {
        let mut conn = self.pool.get()?;
        let row: Option<UserDB> = users::table
            .filter(users::auth_token.eq(token))
            .first(&mut conn)
            .optional()?;
        row.as_ref().map(UserDB::to_domain).transpose()
    }

    pub fn upsert_user(&self, user: &User, auth_token: Option<&str>) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = UserDB::from_domain(user, auth_token.map(str::to_string))?;
        diesel::insert_into(users::table)
            .values(&row)
            .on_conflict(users::userid)
            .do_update()
            .set(&row)
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn add_group_member(&self, group: &str, userid: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = AccessGroupMemberDB {
            id: Uuid::new_v4().to_string(),
            group_name: group.to_string(),
            userid: userid.to_string(),
        };
        diesel::insert_into(access_group_members::table)
            .values(&row)
            .on_conflict((
                access_group_members::group_name,
                access_group_members::userid,
            ))
            .do_nothing()
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn remove_group_member(&self, group: &str, userid: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(
            access_group_members::table
                .filter(access_group_members::group_name.eq(group))
                .filter(access_group_members::userid.eq(userid)),
        )
        .execute(&mut conn)?;
        Ok(())
    }

    pub fn add_project_user(&self, project: &str, userid: &str, role: Role) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = ProjectUserDB {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            userid: userid.to_string(),
            role: enum_to_db(&role)?,
        };
        diesel::insert_into(project_users::table)
            .values(&row)
            .on_conflict((project_users::project, project_users::userid))
            .do_update()
            .set(project_users::role.eq(row.role.clone()))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn remove_project_user(&self, project: &str, userid: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(
            project_users::table
                .filter(project_users::project.eq(project))
                .filter(project_users::userid.eq(userid)),
        )
        .execute(&mut conn)?;
        Ok(())
    }

    /// User ids of project members, optionally limited to one role.
    pub fn project_members(&self, project: &str, role: Option<Role>) -> Result<Vec<String>> {
        let mut conn = self.pool.get()?;
        let mut q = project_users::table
            .filter(project_users::project.eq(project))
            .into_boxed();
        if let Some(role) = role {
            q = q.filter(project_users::role.eq(enum_to_db(&role)?));
        }
        let rows: Vec<ProjectUserDB> = q.load(&mut conn)?;
        Ok(rows.into_iter().map(|r| r.userid).collect())
    }

    pub fn set_access_rule(
        &self,
        project: &str,
        grantee: &str,
        subject: &str,
        rule: &AccessRule,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let row = ProjectUserAccessDB {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            grantee: grantee.to_string(),
            subject: subject.to_string(),
            access_rule: serde_json::to_string(rule)?,
        };
        diesel::insert_into(project_user_access::table)
            .values(&row)
            .on_conflict((
                project_user_access::project,
                project_user_access::grantee,
                project_user_access::subject,
            ))
            .do_update()
            .set(project_user_access::access_rule.eq(row.access_rule.clone()))
            .execute(&mut conn)?;
        Ok(())
    }

    pub fn remove_access_rule(&self, project: &str, grantee: &str, subject: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        diesel::delete(
            project_user_access::table
                .filter(project_user_access::project.eq(project))
                .filter(project_user_access::grantee.eq(grantee))
                .filter(project_user_access::subject.eq(subject)),
        )
        .execute(&mut conn)?;
        Ok(())
    }
}

impl AccessDirectory for DirectoryRepository {
    fn access_rule(
        &self,
        project: &str,
        grantee: &str,
        subject: &str,
    ) -> caresync_core::Result<Option<AccessRule>> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let row: Option<ProjectUserAccessDB> = project_user_access::table
            .filter(project_user_access::project.eq(project))
            .filter(project_user_access::grantee.eq(grantee))
            .filter(project_user_access::subject.eq(subject))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let rule = serde_json::from_str(&row.access_rule).map_err(StorageError::from)?;
                Ok(Some(rule))
            }
        }
    }

    fn share_access_group(&self, a: &str, b: &str) -> caresync_core::Result<bool> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let groups_of_a: Vec<String> = access_group_members::table
            .filter(access_group_members::userid.eq(a))
            .select(access_group_members::group_name)
            .load(&mut conn)
            .map_err(StorageError::from)?;
        let shared: i64 = access_group_members::table
            .filter(access_group_members::userid.eq(b))
            .filter(access_group_members::group_name.eq_any(groups_of_a))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?;
        Ok(shared > 0)
    }

    fn is_project_member(&self, project: &str, userid: &str) -> caresync_core::Result<bool> {
        let mut conn = self.pool.get().map_err(StorageError::from)?;
        let count: i64 = project_users::table
            .filter(project_users::project.eq(project))
            .filter(project_users::userid.eq(userid))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use caresync_core::access::{AccessMode, AccessRestriction};

    fn user(userid: &str, role: Role) -> User {
        User {
            userid: userid.to_string(),
            email: format!("{}@example.com", userid),
            role,
            active: true,
        }
    }

    #[test]
    fn token_lookup_resolves_user() {
        let repo = DirectoryRepository::new(test_pool());
        repo.upsert_user(&user("u1", Role::Professional), Some("tok-1"))
            .unwrap();
        let found = repo.find_user_by_token("tok-1").unwrap().unwrap();
        assert_eq!(found.userid, "u1");
        assert_eq!(found.role, Role::Professional);
        assert!(repo.find_user_by_token("other").unwrap().is_none());
    }

    #[test]
    fn access_rule_roundtrip_preserves_restrictions() {
        let repo = DirectoryRepository::new(test_pool());
        let rule = AccessRule {
            restrictions: Some(vec![AccessRestriction {
                module: "vitals".to_string(),
                access_mode: AccessMode::Read,
                start: Some("2024-01-01".parse().unwrap()),
                end: None,
            }]),
        };
        repo.set_access_rule("default", "prof", "pat", &rule).unwrap();
        let loaded = repo.access_rule("default", "prof", "pat").unwrap().unwrap();
        assert_eq!(loaded, rule);

        // Upsert replaces the rule for the same triple.
        repo.set_access_rule("default", "prof", "pat", &AccessRule::default())
            .unwrap();
        let replaced = repo.access_rule("default", "prof", "pat").unwrap().unwrap();
        assert_eq!(replaced, AccessRule::default());
    }

    #[test]
    fn group_sharing_requires_a_common_group() {
        let repo = DirectoryRepository::new(test_pool());
        repo.add_group_member("clinic-a", "prof").unwrap();
        repo.add_group_member("clinic-a", "pat").unwrap();
        repo.add_group_member("clinic-b", "other").unwrap();
        assert!(repo.share_access_group("prof", "pat").unwrap());
        assert!(!repo.share_access_group("prof", "other").unwrap());
    }

    #[test]
    fn project_membership_filters_by_role() {
        let repo = DirectoryRepository::new(test_pool());
        repo.add_project_user("default", "pat", Role::Patient).unwrap();
        repo.add_project_user("default", "prof", Role::Professional)
            .unwrap();
        let patients = repo.project_members("default", Some(Role::Patient)).unwrap();
        assert_eq!(patients, vec!["pat".to_string()]);
        assert!(repo.is_project_member("default", "prof").unwrap());
        assert!(!repo.is_project_member("default", "ghost").unwrap());
    }
}
