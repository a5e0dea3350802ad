//! Watch endpoints: table watches and subject watches
//! (register / poll / unregister).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use caresync_core::access::AccessMode;
use caresync_core::watch::SubjectEvent;
use caresync_core::wire::subjects_to_wire;

use crate::auth::{AuthUser, Version};
use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

use super::find_project;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/projects/:project/tables/:table/watch",
            post(register_watch_table),
        )
        .route(
            "/projects/:project/tables/:table/watch/:id",
            get(watch_table),
        )
        .route(
            "/projects/:project/tables/:table/watch/:id",
            delete(unregister_watch_table),
        )
        .route(
            "/projects/:project/subjects/watch",
            post(register_watch_subjects),
        )
        .route("/projects/:project/subjects/watch/:id", get(watch_subjects))
        .route(
            "/projects/:project/subjects/watch/:id",
            delete(unregister_watch_subjects),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterWatchTableParams {
    pub subject: Option<String>,
    pub any_subject: bool,
    pub callback_url: Option<String>,
    pub reset: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub registration_id: String,
}

/// Checks that the caller may watch the registration's scope right now.
/// Called both at registration and on every poll; access revoked in between
/// must surface on the next poll, not deliver stale data.
fn check_watch_access(
    state: &AppState,
    caller: &caresync_core::users::User,
    project: &str,
    table: &str,
    subject: Option<&str>,
) -> Result<Option<String>, ApiError> {
    match subject {
        None => {
            if !caller.is_admin() {
                return Err(ApiError::Forbidden(
                    "watch table for any user not allowed".to_string(),
                ));
            }
            Ok(None)
        }
        Some(subject) => {
            let access = state.resolver().resolve_subject(
                caller,
                Some(subject),
                project,
                table,
                AccessMode::Read,
            )?;
            access.require_unrestricted()?;
            Ok(Some(access.user.userid))
        }
    }
}

async fn register_watch_table(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path((project, table)): Path<(String, String)>,
    Json(params): Json<RegisterWatchTableParams>,
) -> ApiResult<Json<RegistrationResponse>> {
    let project = find_project(&state, &caller, &project)?;
    if project.find_table(&table).is_none() {
        return Err(ApiError::NotFound(format!(
            "table \"{}\" not found in project \"{}\"",
            table, project.code
        )));
    }
    let subject = if params.any_subject {
        check_watch_access(&state, &caller, &project.code, &table, None)?
    } else {
        check_watch_access(
            &state,
            &caller,
            &project.code,
            &table,
            Some(params.subject.as_deref().unwrap_or_default()),
        )?
    };
    let callback_url = match params.callback_url.filter(|url| !url.is_empty()) {
        None => None,
        Some(url) => Some(
            reqwest::Url::parse(&url)
                .map_err(|_| ApiError::BadRequest(format!("invalid callbackUrl: {}", url)))?
                .to_string(),
        ),
    };
    let registration_id = state.table_watches.register(
        &caller.userid,
        &project.code,
        &table,
        subject,
        callback_url,
        params.reset,
    )?;
    Ok(Json(RegistrationResponse { registration_id }))
}

async fn watch_table(
    State(state): State<Arc<AppState>>,
    Version(version): Version,
    AuthUser(caller): AuthUser,
    Path((project, table, id)): Path<(String, String, String)>,
) -> ApiResult<Json<Vec<String>>> {
    let project = find_project(&state, &caller, &project)?;
    // The table may have been dropped from the project since registration.
    if project.find_table(&table).is_none() {
        return Err(ApiError::NotFound(format!(
            "table \"{}\" not found in project \"{}\"",
            table, project.code
        )));
    }
    let registration_subject =
        state
            .table_watches
            .registration_subject(&id, &caller.userid, &project.code, &table)?;
    check_watch_access(
        &state,
        &caller,
        &project.code,
        &table,
        registration_subject.as_deref(),
    )?;
    let subjects = state
        .table_watches
        .poll(&id, &caller.userid, &project.code, &table)
        .await?;
    Ok(Json(subjects_to_wire(version, &subjects, &state.users)))
}

async fn unregister_watch_table(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path((project, table, id)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let project = find_project(&state, &caller, &project)?;
    state
        .table_watches
        .unregister(&id, &caller.userid, &project.code, &table)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterWatchSubjectsParams {
    pub reset: bool,
}

async fn register_watch_subjects(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<RegisterWatchSubjectsParams>,
) -> ApiResult<Json<RegistrationResponse>> {
    let project = find_project(&state, &caller, &project)?;
    let registration_id =
        state
            .subject_watches
            .register(&caller.userid, &project.code, params.reset)?;
    Ok(Json(RegistrationResponse { registration_id }))
}

async fn watch_subjects(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<Vec<SubjectEvent>>> {
    let project = find_project(&state, &caller, &project)?;
    let events = state
        .subject_watches
        .poll(&id, &caller.userid, &project.code)
        .await?;
    Ok(Json(events))
}

async fn unregister_watch_subjects(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let project = find_project(&state, &caller, &project)?;
    state
        .subject_watches
        .unregister(&id, &caller.userid, &project.code)?;
    Ok(StatusCode::NO_CONTENT)
}
