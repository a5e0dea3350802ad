//! Application state and server bootstrap.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tracing::{debug, info, warn};

use caresync_core::access::AccessResolver;
use caresync_core::projects::{ProjectDef, ProjectRegistry};
use caresync_core::push::PushMessageData;
use caresync_core::users::UserCache;
use caresync_push::{FcmClient, PushDispatcher, PushGateway, RegistrationStore};
use caresync_storage_sqlite::{
    create_pool, run_migrations, ActionLogRepository, DbPool, DirectoryRepository,
    PushRegistrationRepository, WatchSubjectRepository, WatchTableRepository,
};

use crate::api;
use crate::config::Config;
use crate::events::{ChangeBus, UserEventBus};
use crate::watch::{SubjectWatchHub, TableWatchHub};

pub struct AppState {
    pub registry: Arc<ProjectRegistry>,
    pub users: Arc<UserCache>,
    pub directory: Arc<DirectoryRepository>,
    pub actions: Arc<ActionLogRepository>,
    pub push_store: Arc<PushRegistrationRepository>,
    pub push: PushDispatcher,
    pub change_bus: ChangeBus,
    pub user_events: UserEventBus,
    pub table_watches: TableWatchHub,
    pub subject_watches: SubjectWatchHub,
}

impl AppState {
    pub fn resolver(&self) -> AccessResolver<'_> {
        AccessResolver::new(
            self.users.as_ref(),
            self.directory.as_ref(),
            self.registry.as_ref(),
        )
    }
}

/// Gateway used when no push service is configured.
struct DisabledPushGateway;

#[async_trait]
impl PushGateway for DisabledPushGateway {
    async fn send_data_message(
        &self,
        _token: &str,
        data: &PushMessageData,
    ) -> caresync_push::Result<()> {
        debug!(
            "push delivery disabled, dropping message for table {}",
            data.table
        );
        Ok(())
    }
}

/// Adapts the push registration repository to the dispatcher's removal seam.
struct PushStoreAdapter(Arc<PushRegistrationRepository>);

impl RegistrationStore for PushStoreAdapter {
    fn remove_registration(&self, id: &str) -> Result<(), String> {
        self.0.delete_by_id(id).map_err(|e| e.to_string())
    }
}

fn load_projects(config: &Config) -> anyhow::Result<ProjectRegistry> {
    let Some(path) = &config.projects_file else {
        warn!("no projects file configured, serving an empty project registry");
        return Ok(ProjectRegistry::new(Vec::new()));
    };
    let content = std::fs::read_to_string(path)?;
    let projects: Vec<ProjectDef> = serde_json::from_str(&content)?;
    info!("loaded {} project definitions", projects.len());
    Ok(ProjectRegistry::new(projects))
}

/// Builds the application state over an existing pool and registry. Must run
/// inside a tokio runtime (the push dispatcher and subject watch router
/// spawn tasks).
pub fn build_state(
    pool: DbPool,
    registry: Arc<ProjectRegistry>,
    gateway: Arc<dyn PushGateway>,
) -> anyhow::Result<Arc<AppState>> {
    let directory = Arc::new(DirectoryRepository::new(pool.clone()));
    let users = Arc::new(UserCache::new(directory.all_users()?));
    let actions = Arc::new(ActionLogRepository::new(pool.clone()));
    let push_store = Arc::new(PushRegistrationRepository::new(pool.clone()));
    let push = PushDispatcher::start(
        gateway,
        Arc::new(PushStoreAdapter(push_store.clone())),
        registry.clone(),
        push_store.load_all()?,
    );
    let table_watches = TableWatchHub::new(
        WatchTableRepository::new(pool.clone()),
        reqwest::Client::new(),
    );
    table_watches.load()?;
    let subject_watches = SubjectWatchHub::new(
        WatchSubjectRepository::new(pool),
        directory.clone(),
        users.clone(),
    );
    subject_watches.load()?;
    let user_events = UserEventBus::new();
    subject_watches.start(&user_events);
    Ok(Arc::new(AppState {
        registry,
        users,
        directory,
        actions,
        push_store,
        push,
        change_bus: ChangeBus::new(),
        user_events,
        table_watches,
        subject_watches,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::sync::router())
        .merge(api::watch::router())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let pool = create_pool(&config.database_url)?;
    run_migrations(&pool)?;
    let registry = Arc::new(load_projects(&config)?);
    let gateway: Arc<dyn PushGateway> = match (&config.fcm_endpoint, &config.fcm_token) {
        (Some(endpoint), Some(token)) => Arc::new(FcmClient::new(endpoint, token)),
        _ => {
            info!("push delivery disabled (no FCM configuration)");
            Arc::new(DisabledPushGateway)
        }
    };
    let state = build_state(pool, registry, gateway)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("listening on {}", config.bind_addr);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    state.push.shutdown();
    Ok(())
}
