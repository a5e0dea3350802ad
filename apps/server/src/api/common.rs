//! Shared request helpers.

use caresync_core::access::AccessDirectory;
use caresync_core::projects::ProjectDef;
use caresync_core::users::User;

use crate::error::ApiError;
use crate::main_lib::AppState;

/// Finds the project and checks the caller can reach it (admins reach all
/// projects, everyone else their own). An unknown and an unreachable project
/// are indistinguishable.
pub(crate) fn find_project<'a>(
    state: &'a AppState,
    user: &User,
    project: &str,
) -> Result<&'a ProjectDef, ApiError> {
    let not_found = || ApiError::NotFound(format!("project \"{}\" not found", project));
    let def = state.registry.find_project(project).ok_or_else(not_found)?;
    if user.is_admin() || state.directory.is_project_member(project, &user.userid)? {
        Ok(def)
    } else {
        Err(not_found())
    }
}
