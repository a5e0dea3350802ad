//! Project and table descriptors.
//!
//! A project defines the set of data tables a client can synchronize, which
//! module each table belongs to (modules are the unit of access restriction),
//! and which payload column carries the record's sample time. The registry is
//! built once at startup (typically from a JSON file) and injected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::users::User;

/// One synchronizable data table of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDef {
    pub name: String,
    /// Modules this table belongs to; access restrictions match on these.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Payload columns, excluding the implicit `id`. A column named `user`
    /// marks the table as user data (split per subject).
    #[serde(default)]
    pub columns: Vec<String>,
    /// Payload column holding the record's sample time (unix millis), if any.
    #[serde(default)]
    pub time_column: Option<String>,
}

impl TableDef {
    /// A table with a `user` column holds per-subject data; anything else is
    /// shared resource data.
    pub fn is_user_table(&self) -> bool {
        self.columns.iter().any(|c| c == "user")
    }
}

/// A project: a code plus its table definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDef {
    pub code: String,
    pub tables: Vec<TableDef>,
}

impl ProjectDef {
    pub fn find_table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// The modules the specified table belongs to. Empty if the table is
    /// unknown or carries no module tags.
    pub fn modules_for_table(&self, table: &str) -> HashSet<String> {
        self.find_table(table)
            .map(|t| t.modules.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The per-project database name, used to key push registrations.
    pub fn database_name(&self) -> String {
        format!("{}_data", self.code)
    }
}

/// Per-project access policy hook. Projects can grant access between users
/// beyond explicit access rules and group co-membership (for example based on
/// external enrollment state).
pub trait ProjectAccessPolicy: Send + Sync {
    fn is_accessible_user(&self, caller: &User, subject: &User) -> Result<bool>;
}

/// Registry of all projects this deployment serves. Constructed once,
/// injected everywhere; no ambient global state.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: HashMap<String, ProjectDef>,
    policies: HashMap<String, Arc<dyn ProjectAccessPolicy>>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<ProjectDef>) -> Self {
        let projects = projects
            .into_iter()
            .map(|p| (p.code.clone(), p))
            .collect();
        Self {
            projects,
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(
        mut self,
        project: impl Into<String>,
        policy: Arc<dyn ProjectAccessPolicy>,
    ) -> Self {
        self.policies.insert(project.into(), policy);
        self
    }

    pub fn find_project(&self, code: &str) -> Option<&ProjectDef> {
        self.projects.get(code)
    }

    pub fn policy(&self, code: &str) -> Option<&Arc<dyn ProjectAccessPolicy>> {
        self.policies.get(code)
    }

    pub fn project_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.projects.keys().cloned().collect();
        codes.sort();
        codes
    }
}

impl std::fmt::Debug for ProjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectRegistry")
            .field("projects", &self.projects.keys())
            .field("policies", &self.policies.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> ProjectDef {
        ProjectDef {
            code: "default".to_string(),
            tables: vec![
                TableDef {
                    name: "heart_rate".to_string(),
                    modules: vec!["vitals".to_string()],
                    columns: vec!["user".to_string(), "bpm".to_string(), "sampleTime".to_string()],
                    time_column: Some("sampleTime".to_string()),
                },
                TableDef {
                    name: "device_models".to_string(),
                    modules: vec![],
                    columns: vec!["label".to_string()],
                    time_column: None,
                },
            ],
        }
    }

    #[test]
    fn user_table_detection_by_user_column() {
        let project = project();
        assert!(project.find_table("heart_rate").unwrap().is_user_table());
        assert!(!project.find_table("device_models").unwrap().is_user_table());
    }

    #[test]
    fn modules_for_unknown_table_is_empty() {
        assert!(project().modules_for_table("nope").is_empty());
    }
}
