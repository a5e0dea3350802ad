//! Synchronization endpoints: read stats, read, write, progress, the single
//! blocking watch, and push registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use caresync_core::access::AccessMode;
use caresync_core::errors::Error;
use caresync_core::projects::ProjectDef;
use caresync_core::push::PushRegistration;
use caresync_core::sync::{
    DataAction, SyncActionStats, SyncProgress, Synchronizer, TableFilter, TimeRangeRestriction,
    REMOTE_ORIGIN,
};
use caresync_core::users::User;
use caresync_core::watch::{SyncWatchResult, WatchResultCode, HANGING_GET_TIMEOUT_MS};
use caresync_core::wire::action_to_wire;

use crate::auth::{AuthUser, Version};
use crate::error::{ApiError, ApiResult};
use crate::events::ChangeEvent;
use crate::main_lib::AppState;

use super::find_project;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects/:project/sync/read-stats", post(read_stats))
        .route("/projects/:project/sync/read", post(read))
        .route("/projects/:project/sync/write", post(write))
        .route("/projects/:project/sync/progress", post(progress))
        .route("/projects/:project/sync/watch", post(watch))
        .route("/projects/:project/sync/push/register", post(register_push))
        .route(
            "/projects/:project/sync/push/register",
            delete(unregister_push),
        )
        .route("/projects/:project/sync/tables", get(table_list))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncParams {
    pub subject: Option<String>,
    pub include_own: bool,
    pub progress: Option<Vec<SyncProgress>>,
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
    pub time_range_restrictions: Vec<TimeRangeRestriction>,
    pub max_count: i64,
    pub max_time: Option<i64>,
}

/// The per-request read scope: the resolved subject, the table filter with
/// per-table denials folded in, and the combined time-range restrictions.
struct ReadScope {
    subject: User,
    filter: TableFilter,
    restrictions: Vec<TimeRangeRestriction>,
}

/// Resolves the subject and, per included table, the accessible range.
/// Tables the caller may not read for this subject are excluded from the
/// scope; a subject the caller may not reach at all is `Forbidden`.
fn read_scope(
    state: &AppState,
    caller: &User,
    project: &ProjectDef,
    params: &SyncParams,
) -> Result<ReadScope, ApiError> {
    let resolver = state.resolver();
    let subject =
        resolver.resolve_accessible_user(caller, params.subject.as_deref(), &project.code)?;
    let mut filter = TableFilter {
        include_tables: params.include_tables.clone(),
        exclude_tables: params.exclude_tables.clone(),
    };
    let mut restrictions = params.time_range_restrictions.clone();
    for table in &project.tables {
        if !filter.includes(&table.name) {
            continue;
        }
        match resolver.resolve_subject(
            caller,
            params.subject.as_deref(),
            &project.code,
            &table.name,
            AccessMode::Read,
        ) {
            Ok(access) => {
                if let Some(restriction) = access.to_time_restriction(&table.name) {
                    restrictions.push(restriction);
                }
            }
            Err(Error::Forbidden(_)) => filter.exclude_tables.push(table.name.clone()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ReadScope {
        subject,
        filter,
        restrictions,
    })
}

fn exclude_origins(caller: &User, include_own: bool) -> Vec<String> {
    if include_own {
        Vec::new()
    } else {
        vec![REMOTE_ORIGIN.to_string(), caller.userid.clone()]
    }
}

async fn read_stats(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<SyncParams>,
) -> ApiResult<Json<SyncActionStats>> {
    let project = find_project(&state, &caller, &project)?;
    let scope = read_scope(&state, &caller, project, &params)?;
    let sync = Synchronizer::new(state.actions.as_ref(), project, scope.subject.userid)
        .with_table_filter(scope.filter)
        .with_restrictions(scope.restrictions);
    let stats = sync.action_stats(
        params.progress.as_deref(),
        &exclude_origins(&caller, params.include_own),
    )?;
    Ok(Json(stats))
}

async fn read(
    State(state): State<Arc<AppState>>,
    Version(version): Version,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<SyncParams>,
) -> ApiResult<Json<Vec<Value>>> {
    let project = find_project(&state, &caller, &project)?;
    let scope = read_scope(&state, &caller, project, &params)?;
    let sync = Synchronizer::new(state.actions.as_ref(), project, scope.subject.userid)
        .with_table_filter(scope.filter)
        .with_restrictions(scope.restrictions);
    let actions = sync.read_actions(
        params.progress.as_deref(),
        params.max_count,
        params.max_time,
        &exclude_origins(&caller, params.include_own),
    )?;
    debug!(
        "read returned {} actions for project {}",
        actions.len(),
        project.code
    );
    let wire = actions
        .iter()
        .map(|action| action_to_wire(version, action, &state.users))
        .collect();
    Ok(Json(wire))
}

async fn progress(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<SyncParams>,
) -> ApiResult<Json<Vec<SyncProgress>>> {
    let project = find_project(&state, &caller, &project)?;
    let resolver = state.resolver();
    let subject =
        resolver.resolve_accessible_user(&caller, params.subject.as_deref(), &project.code)?;
    let filter = TableFilter {
        include_tables: params.include_tables,
        exclude_tables: params.exclude_tables,
    };
    let sync = Synchronizer::new(state.actions.as_ref(), project, subject.userid)
        .with_table_filter(filter);
    Ok(Json(sync.sync_progress()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    #[serde(default)]
    pub subject: Option<String>,
    pub actions: Vec<DataAction>,
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

async fn write(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<WriteParams>,
) -> ApiResult<StatusCode> {
    let project = find_project(&state, &caller, &project)?;
    if params.actions.is_empty() {
        return Ok(StatusCode::NO_CONTENT);
    }
    let resolver = state.resolver();
    let subject =
        resolver.resolve_accessible_user(&caller, params.subject.as_deref(), &project.code)?;

    // Resolve write access per affected table up front; a single denied
    // table rejects the whole batch.
    let mut access = HashMap::new();
    for action in &params.actions {
        if access.contains_key(&action.table) {
            continue;
        }
        let table_access = resolver.resolve_subject(
            &caller,
            params.subject.as_deref(),
            &project.code,
            &action.table,
            AccessMode::Write,
        )?;
        access.insert(action.table.clone(), table_access);
    }

    let filter = TableFilter {
        include_tables: params.include_tables,
        exclude_tables: params.exclude_tables,
    };
    let sync = Synchronizer::new(state.actions.as_ref(), project, subject.userid.clone())
        .with_table_filter(filter);
    let applied = sync.write_actions(&params.actions, &caller.userid, &access)?;

    notify_applied(&state, project, applied);
    Ok(StatusCode::NO_CONTENT)
}

/// Wakes listeners and push after a successful write.
fn notify_applied(state: &AppState, project: &ProjectDef, applied: Vec<DataAction>) {
    if applied.is_empty() {
        return;
    }
    let mut by_table: HashMap<String, Vec<DataAction>> = HashMap::new();
    for action in applied {
        by_table.entry(action.table.clone()).or_default().push(action);
    }
    for (table, actions) in by_table {
        let mut subjects: Vec<String> = actions.iter().filter_map(|a| a.user.clone()).collect();
        subjects.sort();
        subjects.dedup();
        state.table_watches.on_change(&project.code, &table, &actions);
        state.push.notify(&project.code, &table, &actions);
        state.change_bus.publish(ChangeEvent {
            project: project.code.clone(),
            table,
            subjects,
        });
    }
}

/// Single blocking watch: polls for new actions and parks on the change bus
/// until something matching arrives or the hanging-GET deadline passes.
/// Access is re-resolved on every pass, so a revocation mid-watch surfaces
/// instead of returning stale data.
async fn watch(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project_code): Path<String>,
    Json(params): Json<SyncParams>,
) -> ApiResult<Json<SyncWatchResult>> {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(HANGING_GET_TIMEOUT_MS);
    let mut rx = state.change_bus.subscribe();
    loop {
        let project = find_project(&state, &caller, &project_code)?;
        let scope = read_scope(&state, &caller, project, &params)?;
        let sync = Synchronizer::new(state.actions.as_ref(), project, scope.subject.userid)
            .with_table_filter(scope.filter)
            .with_restrictions(scope.restrictions);
        if sync.sync_tables().is_empty() {
            return Ok(Json(SyncWatchResult {
                result_code: WatchResultCode::NoData,
                actions: None,
            }));
        }
        let actions = sync.read_actions(
            params.progress.as_deref(),
            params.max_count,
            None,
            &exclude_origins(&caller, params.include_own),
        )?;
        if !actions.is_empty() {
            return Ok(Json(SyncWatchResult {
                result_code: WatchResultCode::Ok,
                actions: Some(actions),
            }));
        }
        // Park until an event for this project arrives, then poll again.
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    return Ok(Json(SyncWatchResult {
                        result_code: WatchResultCode::Timeout,
                        actions: None,
                    }))
                }
                Ok(Ok(event)) if event.project == project_code => break,
                Ok(Ok(_)) => continue,
                // After a lag the buffer was overrun; poll to be safe.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Ok(Json(SyncWatchResult {
                        result_code: WatchResultCode::Timeout,
                        actions: None,
                    }))
                }
            }
        }
    }
}

async fn table_list(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    let project = find_project(&state, &caller, &project)?;
    Ok(Json(project.table_names()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPushParams {
    #[serde(default)]
    pub subject: Option<String>,
    pub device_id: String,
    pub fcm_token: String,
    #[serde(default)]
    pub restrictions: TableFilter,
}

async fn register_push(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Json(params): Json<RegisterPushParams>,
) -> ApiResult<StatusCode> {
    let project = find_project(&state, &caller, &project)?;
    if params.device_id.is_empty() || params.fcm_token.is_empty() {
        return Err(ApiError::BadRequest(
            "deviceId and fcmToken must be set".to_string(),
        ));
    }
    let resolver = state.resolver();
    let subject =
        resolver.resolve_accessible_user(&caller, params.subject.as_deref(), &project.code)?;
    let registration = PushRegistration::new(
        subject.userid,
        project.code.clone(),
        project.database_name(),
        params.device_id,
        params.fcm_token,
        params.restrictions,
    );
    let stored = state.push_store.upsert(&registration)?;
    state.push.add_registration(&stored);
    info!(
        "registered push device {} for project {}",
        stored.device_id, project.code
    );
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPushParams {
    #[serde(default)]
    pub subject: Option<String>,
    pub device_id: String,
}

async fn unregister_push(
    State(state): State<Arc<AppState>>,
    AuthUser(caller): AuthUser,
    Path(project): Path<String>,
    Query(params): Query<UnregisterPushParams>,
) -> ApiResult<StatusCode> {
    let project = find_project(&state, &caller, &project)?;
    let resolver = state.resolver();
    let subject =
        resolver.resolve_accessible_user(&caller, params.subject.as_deref(), &project.code)?;
    let database = project.database_name();
    state
        .push_store
        .delete_by_device(&database, &subject.userid, &params.device_id)?;
    state
        .push
        .remove_registrations(&database, &subject.userid, &params.device_id);
    Ok(StatusCode::NO_CONTENT)
}
