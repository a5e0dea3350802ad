//! Access resolution: who may read or write whose data, and for which
//! date range.
//!
//! Grants are expressed as access rules from a grantee to a subject within a
//! project. A rule without restrictions is full access; a rule with
//! restrictions only grants access for tables whose module matches one of the
//! restrictions with a compatible access mode, limited to the union of the
//! matching date ranges.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::projects::ProjectRegistry;
use crate::sync::TimeRangeRestriction;
use crate::users::{Role, User, UserCache};

/// Access mode of a restriction, or the mode required by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl AccessMode {
    /// Whether a restriction with this mode satisfies the required mode.
    /// Read-write requests need a read-write grant; read and write requests
    /// are satisfied by their own mode or read-write.
    pub fn matches_request(self, required: AccessMode) -> bool {
        match required {
            AccessMode::ReadWrite => self == AccessMode::ReadWrite,
            AccessMode::Read => matches!(self, AccessMode::Read | AccessMode::ReadWrite),
            AccessMode::Write => matches!(self, AccessMode::Write | AccessMode::ReadWrite),
        }
    }
}

/// One restriction within an access rule: a module, an access mode, and an
/// optional date range (start inclusive, end exclusive; `None` = unbounded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRestriction {
    pub module: String,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

/// The rule a grantee holds on a subject. `restrictions: None` means full
/// access; `Some(..)` limits access to the matching modules/modes/ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    #[serde(default)]
    pub restrictions: Option<Vec<AccessRestriction>>,
}

/// The outcome of a successful resolution: the subject user plus the
/// accessible date range (either bound `None` when unbounded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectAccess {
    pub user: User,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

fn date_start_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        .timestamp_millis()
}

impl SubjectAccess {
    pub fn unrestricted(user: User) -> Self {
        Self {
            user,
            start: None,
            end: None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Fails unless the grant covers all dates. Used by watch registrations,
    /// which have no per-record time to check against.
    pub fn require_unrestricted(&self) -> Result<()> {
        if self.is_unrestricted() {
            return Ok(());
        }
        Err(Error::forbidden("access forbidden for unrestricted time range"))
    }

    /// Checks a record's sample time (unix millis) against the granted range.
    /// Day boundaries are strict: start is inclusive at midnight UTC, end is
    /// exclusive at midnight UTC.
    pub fn check_sample_time(&self, sample_time: i64) -> Result<()> {
        if let Some(start) = self.start {
            if sample_time < date_start_millis(start) {
                return Err(Error::forbidden("record outside granted time range"));
            }
        }
        if let Some(end) = self.end {
            if sample_time >= date_start_millis(end) {
                return Err(Error::forbidden("record outside granted time range"));
            }
        }
        Ok(())
    }

    /// Converts the granted range into a sample-time restriction for reads on
    /// the specified table. Returns `None` when unrestricted. Read selection
    /// gets a day of slack on both ends so that records of a granted date are
    /// selected in any time zone; writes use the strict check above.
    pub fn to_time_restriction(&self, table: &str) -> Option<TimeRangeRestriction> {
        if self.is_unrestricted() {
            return None;
        }
        Some(TimeRangeRestriction {
            table: table.to_string(),
            start_time: self
                .start
                .map(TimeRangeRestriction::start_time_for_date)
                .unwrap_or(i64::MIN),
            end_time: self
                .end
                .map(TimeRangeRestriction::end_time_for_date)
                .unwrap_or(i64::MAX),
        })
    }
}

/// Directory queries the resolver needs from storage.
pub trait AccessDirectory: Send + Sync {
    /// The access rule for (project, grantee, subject), if one exists.
    fn access_rule(&self, project: &str, grantee: &str, subject: &str)
        -> Result<Option<AccessRule>>;

    /// Whether the two users share an access group.
    fn share_access_group(&self, a: &str, b: &str) -> Result<bool>;

    /// Whether the user is a member of the project.
    fn is_project_member(&self, project: &str, userid: &str) -> Result<bool>;
}

/// Stateless access resolver over the injected user cache, directory and
/// project registry. Reentrant; holds no locks of its own.
pub struct AccessResolver<'a> {
    users: &'a UserCache,
    directory: &'a dyn AccessDirectory,
    registry: &'a ProjectRegistry,
}

impl<'a> AccessResolver<'a> {
    pub fn new(
        users: &'a UserCache,
        directory: &'a dyn AccessDirectory,
        registry: &'a ProjectRegistry,
    ) -> Self {
        Self {
            users,
            directory,
            registry,
        }
    }

    fn subject_user(&self, caller: &User, subject: Option<&str>) -> Result<User> {
        match subject {
            None => Ok(caller.clone()),
            Some(id) if id.is_empty() || id == caller.userid => Ok(caller.clone()),
            Some(id) => self
                .users
                .find_by_userid(id)
                .ok_or_else(|| Error::subject_forbidden(id)),
        }
    }

    /// Resolves the subject for a project data request on one table, with the
    /// required access mode. Returns the subject user and the accessible date
    /// range, or `Forbidden`. Denials never reveal whether the subject
    /// exists.
    pub fn resolve_subject(
        &self,
        caller: &User,
        subject: Option<&str>,
        project: &str,
        table: &str,
        required: AccessMode,
    ) -> Result<SubjectAccess> {
        let denied = || Error::subject_forbidden(subject.unwrap_or_default());
        let subject_user = self.subject_user(caller, subject)?;

        // Admins can access everyone; everyone can access themselves.
        if caller.is_admin() || subject_user.userid == caller.userid {
            return Ok(SubjectAccess::unrestricted(subject_user));
        }

        if let Some(rule) =
            self.directory
                .access_rule(project, &caller.userid, &subject_user.userid)?
        {
            let modules = self
                .registry
                .find_project(project)
                .map(|p| p.modules_for_table(table))
                .unwrap_or_default();
            if let Some((start, end)) = merged_rule_range(&rule, &modules, required) {
                return Ok(SubjectAccess {
                    user: subject_user,
                    start,
                    end,
                });
            }
        }

        self.fallback_access(caller, subject_user, project)
            .ok_or_else(denied)
            .and_then(|access| access)
    }

    /// Resolves the subject for requests that are not scoped to a single
    /// table (subject lookups for stats/read/write target resolution). Any
    /// access rule counts, regardless of its restrictions: the restrictions
    /// are enforced per table later.
    pub fn resolve_accessible_user(
        &self,
        caller: &User,
        subject: Option<&str>,
        project: &str,
    ) -> Result<User> {
        let denied = || Error::subject_forbidden(subject.unwrap_or_default());
        let subject_user = self.subject_user(caller, subject)?;

        if caller.is_admin() || subject_user.userid == caller.userid {
            return Ok(subject_user);
        }
        if self
            .directory
            .access_rule(project, &caller.userid, &subject_user.userid)?
            .is_some()
        {
            return Ok(subject_user);
        }

        self.fallback_access(caller, subject_user, project)
            .ok_or_else(denied)
            .and_then(|access| access.map(|a| a.user))
    }

    /// The shared tail of the resolution walk after rule matching fails:
    /// patients only reach themselves, admins are never reachable, then group
    /// co-membership and the project access policy are consulted.
    fn fallback_access(
        &self,
        caller: &User,
        subject_user: User,
        project: &str,
    ) -> Option<Result<SubjectAccess>> {
        if caller.role == Role::Patient || subject_user.is_admin() {
            return None;
        }
        match self
            .directory
            .share_access_group(&caller.userid, &subject_user.userid)
        {
            Ok(true) => return Some(Ok(SubjectAccess::unrestricted(subject_user))),
            Ok(false) => {}
            Err(err) => return Some(Err(err)),
        }
        if let Some(policy) = self.registry.policy(project) {
            match policy.is_accessible_user(caller, &subject_user) {
                Ok(true) => return Some(Ok(SubjectAccess::unrestricted(subject_user))),
                Ok(false) => {}
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}

/// Merges the date ranges of all restrictions matching the table's modules
/// and the required mode. `None` bounds absorb: the merged start is `None` if
/// any matching restriction is open-ended at the start, else the minimum; the
/// end analogously with the maximum. Returns `None` when nothing matches.
///
/// Restrictions with a mode incompatible with the required mode never
/// participate in the merge; modes are not merged across each other.
fn merged_rule_range(
    rule: &AccessRule,
    modules: &HashSet<String>,
    required: AccessMode,
) -> Option<(Option<NaiveDate>, Option<NaiveDate>)> {
    let restrictions = match &rule.restrictions {
        // No restrictions recorded: full access.
        None => return Some((None, None)),
        Some(list) => list,
    };
    if modules.is_empty() {
        return None;
    }
    let mut range: Option<(Option<NaiveDate>, Option<NaiveDate>)> = None;
    for restriction in restrictions {
        if !modules.contains(&restriction.module)
            || !restriction.access_mode.matches_request(required)
        {
            continue;
        }
        range = Some(match range {
            None => (restriction.start, restriction.end),
            Some((start, end)) => (
                match (start, restriction.start) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    _ => None,
                },
                match (end, restriction.end) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                },
            ),
        });
    }
    range
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::{ProjectDef, TableDef};

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn user(userid: &str, role: Role) -> User {
        User {
            userid: userid.to_string(),
            email: format!("{}@example.com", userid),
            role,
            active: true,
        }
    }

    fn restriction(
        module: &str,
        mode: AccessMode,
        start: Option<&str>,
        end: Option<&str>,
    ) -> AccessRestriction {
        AccessRestriction {
            module: module.to_string(),
            access_mode: mode,
            start: start.map(date),
            end: end.map(date),
        }
    }

    struct FixedDirectory {
        rule: Option<AccessRule>,
        share_group: bool,
    }

    impl AccessDirectory for FixedDirectory {
        fn access_rule(&self, _: &str, _: &str, _: &str) -> Result<Option<AccessRule>> {
            Ok(self.rule.clone())
        }

        fn share_access_group(&self, _: &str, _: &str) -> Result<bool> {
            Ok(self.share_group)
        }

        fn is_project_member(&self, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn registry() -> ProjectRegistry {
        ProjectRegistry::new(vec![ProjectDef {
            code: "default".to_string(),
            tables: vec![TableDef {
                name: "heart_rate".to_string(),
                modules: vec!["vitals".to_string()],
                columns: vec!["user".to_string(), "bpm".to_string(), "sampleTime".to_string()],
                time_column: Some("sampleTime".to_string()),
            }],
        }])
    }

    #[test]
    fn access_mode_compatibility() {
        assert!(AccessMode::ReadWrite.matches_request(AccessMode::Read));
        assert!(AccessMode::ReadWrite.matches_request(AccessMode::Write));
        assert!(!AccessMode::Read.matches_request(AccessMode::Write));
        assert!(!AccessMode::Write.matches_request(AccessMode::ReadWrite));
    }

    #[test]
    fn merged_range_takes_most_permissive_bounds() {
        let rule = AccessRule {
            restrictions: Some(vec![
                restriction("vitals", AccessMode::Read, Some("2024-02-01"), Some("2024-03-01")),
                restriction("vitals", AccessMode::Read, Some("2024-01-01"), None),
            ]),
        };
        let modules: HashSet<String> = ["vitals".to_string()].into();
        let (start, end) = merged_rule_range(&rule, &modules, AccessMode::Read).unwrap();
        assert_eq!(start, Some(date("2024-01-01")));
        assert_eq!(end, None);
    }

    #[test]
    fn incompatible_mode_does_not_merge() {
        let rule = AccessRule {
            restrictions: Some(vec![
                restriction("vitals", AccessMode::Read, Some("2024-01-01"), Some("2024-02-01")),
                restriction("vitals", AccessMode::Write, None, None),
            ]),
        };
        let modules: HashSet<String> = ["vitals".to_string()].into();
        // The open-ended write grant must not widen the read range.
        let (start, end) = merged_rule_range(&rule, &modules, AccessMode::Read).unwrap();
        assert_eq!(start, Some(date("2024-01-01")));
        assert_eq!(end, Some(date("2024-02-01")));
    }

    #[test]
    fn module_mismatch_denies() {
        let rule = AccessRule {
            restrictions: Some(vec![restriction(
                "sleep",
                AccessMode::ReadWrite,
                None,
                None,
            )]),
        };
        let modules: HashSet<String> = ["vitals".to_string()].into();
        assert!(merged_rule_range(&rule, &modules, AccessMode::Read).is_none());
    }

    #[test]
    fn resolver_grants_self_access_without_rules() {
        let users = UserCache::new(vec![user("p1", Role::Patient)]);
        let directory = FixedDirectory {
            rule: None,
            share_group: false,
        };
        let registry = registry();
        let resolver = AccessResolver::new(&users, &directory, &registry);
        let caller = user("p1", Role::Patient);
        let access = resolver
            .resolve_subject(&caller, None, "default", "heart_rate", AccessMode::ReadWrite)
            .unwrap();
        assert!(access.is_unrestricted());
        assert_eq!(access.user.userid, "p1");
    }

    #[test]
    fn resolver_denies_patient_reaching_other_users() {
        let users = UserCache::new(vec![user("p1", Role::Patient), user("p2", Role::Patient)]);
        let directory = FixedDirectory {
            rule: None,
            share_group: true,
        };
        let registry = registry();
        let resolver = AccessResolver::new(&users, &directory, &registry);
        let caller = user("p1", Role::Patient);
        // Group co-membership does not help a patient caller.
        let err = resolver
            .resolve_subject(&caller, Some("p2"), "default", "heart_rate", AccessMode::Read)
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn resolver_applies_rule_range_for_professional() {
        let users = UserCache::new(vec![
            user("prof", Role::Professional),
            user("pat", Role::Patient),
        ]);
        let directory = FixedDirectory {
            rule: Some(AccessRule {
                restrictions: Some(vec![restriction(
                    "vitals",
                    AccessMode::Read,
                    Some("2024-01-01"),
                    None,
                )]),
            }),
            share_group: false,
        };
        let registry = registry();
        let resolver = AccessResolver::new(&users, &directory, &registry);
        let caller = user("prof", Role::Professional);
        let access = resolver
            .resolve_subject(&caller, Some("pat"), "default", "heart_rate", AccessMode::Read)
            .unwrap();
        assert_eq!(access.start, Some(date("2024-01-01")));
        assert_eq!(access.end, None);
        // Write mode does not match the read-only restriction and there is no
        // other access path.
        let err = resolver
            .resolve_subject(&caller, Some("pat"), "default", "heart_rate", AccessMode::Write)
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn denial_is_identical_for_missing_and_inaccessible_subjects() {
        let users = UserCache::new(vec![user("prof", Role::Professional), user("pat", Role::Patient)]);
        let directory = FixedDirectory {
            rule: None,
            share_group: false,
        };
        let registry = registry();
        let resolver = AccessResolver::new(&users, &directory, &registry);
        let caller = user("prof", Role::Professional);
        let missing = resolver
            .resolve_subject(&caller, Some("ghost"), "default", "heart_rate", AccessMode::Read)
            .unwrap_err();
        let inaccessible = resolver
            .resolve_subject(&caller, Some("pat"), "default", "heart_rate", AccessMode::Read)
            .unwrap_err();
        // Same shape, same wording apart from the requested identifier.
        assert_eq!(
            missing.to_string().replace("ghost", "{s}"),
            inaccessible.to_string().replace("pat", "{s}")
        );
    }

    #[test]
    fn sample_time_range_check_uses_day_boundaries() {
        let access = SubjectAccess {
            user: user("pat", Role::Patient),
            start: Some(date("2024-01-01")),
            end: Some(date("2024-02-01")),
        };
        let jan_15 = date("2024-01-15").and_hms_opt(12, 0, 0).unwrap().and_utc();
        let dec_31 = date("2023-12-31").and_hms_opt(23, 59, 0).unwrap().and_utc();
        let feb_15 = date("2024-02-15").and_hms_opt(0, 0, 0).unwrap().and_utc();
        assert!(access.check_sample_time(jan_15.timestamp_millis()).is_ok());
        assert!(access.check_sample_time(dec_31.timestamp_millis()).is_err());
        assert!(access.check_sample_time(feb_15.timestamp_millis()).is_err());
    }
}
