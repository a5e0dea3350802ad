//! The push dispatcher: an in-memory registration index plus a worker task
//! draining a queue of pending "data changed" updates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use caresync_core::projects::ProjectRegistry;
use caresync_core::push::{PushMessageData, PushRegistration};
use caresync_core::sync::{DataAction, REMOTE_ORIGIN};

use crate::client::PushGateway;
use crate::error::PushRetryClass;

/// Pause before a failed update is retried.
const RETRY_PAUSE: Duration = Duration::from_secs(10);

/// Removal seam into persisted registrations, used when a device token turns
/// out to be dead.
pub trait RegistrationStore: Send + Sync {
    fn remove_registration(&self, id: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistrationKey {
    database: String,
    table: String,
    user: String,
}

impl RegistrationKey {
    fn matches_update(&self, update: &PushUpdate) -> bool {
        if self.database != update.database || self.table != update.table {
            return false;
        }
        match &update.user {
            Some(user) => self.user == *user,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PushUpdate {
    database: String,
    table: String,
    user: Option<String>,
    project: String,
}

struct DispatcherInner {
    gateway: Arc<dyn PushGateway>,
    store: Arc<dyn RegistrationStore>,
    projects: Arc<ProjectRegistry>,
    registrations: Mutex<HashMap<RegistrationKey, Vec<PushRegistration>>>,
    pending: Mutex<HashSet<PushUpdate>>,
    tx: mpsc::UnboundedSender<PushUpdate>,
}

/// Fan-out of "something changed" to registered devices. Notification is a
/// cheap enqueue; delivery happens on a background task so the writer is
/// never blocked.
pub struct PushDispatcher {
    inner: Arc<DispatcherInner>,
    shutdown: watch::Sender<bool>,
}

impl PushDispatcher {
    /// Starts the dispatcher with the persisted registrations and spawns the
    /// delivery worker. Must be called from within a tokio runtime.
    pub fn start(
        gateway: Arc<dyn PushGateway>,
        store: Arc<dyn RegistrationStore>,
        projects: Arc<ProjectRegistry>,
        initial: Vec<PushRegistration>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(DispatcherInner {
            gateway,
            store,
            projects,
            registrations: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            tx,
        });
        let dispatcher = Self { inner, shutdown };
        for registration in initial {
            dispatcher.add_registration(&registration);
        }
        tokio::spawn(run_worker(dispatcher.inner.clone(), rx, shutdown_rx));
        dispatcher
    }

    /// Indexes a registration under every table its restrictions cover. A
    /// registration for an unknown project is dropped from storage instead.
    pub fn add_registration(&self, registration: &PushRegistration) {
        let Some(project) = self.inner.projects.find_project(&registration.project) else {
            info!(
                "removing push registration for unknown project \"{}\" (device {})",
                registration.project, registration.device_id
            );
            if let Err(err) = self.inner.store.remove_registration(&registration.id) {
                error!("failed to remove push registration: {}", err);
            }
            return;
        };
        let mut index = self.inner.registrations.lock().expect("lock poisoned");
        for table in project.tables.iter() {
            if !registration.restrictions.includes(&table.name) {
                continue;
            }
            let key = RegistrationKey {
                database: registration.database.clone(),
                table: table.name.clone(),
                user: registration.user.clone(),
            };
            let list = index.entry(key).or_default();
            list.retain(|other| other.id != registration.id);
            list.push(registration.clone());
        }
    }

    /// Drops one device's registrations from the index.
    pub fn remove_registrations(&self, database: &str, user: &str, device_id: &str) {
        let mut index = self.inner.registrations.lock().expect("lock poisoned");
        index.retain(|key, list| {
            if key.database == database && key.user == user {
                list.retain(|reg| reg.device_id != device_id);
            }
            !list.is_empty()
        });
    }

    /// Drops all registrations a user holds within a project.
    pub fn remove_user_project(&self, user: &str, project: &str) {
        let mut index = self.inner.registrations.lock().expect("lock poisoned");
        index.retain(|key, list| {
            if key.user == user {
                list.retain(|reg| reg.project != project);
            }
            !list.is_empty()
        });
    }

    /// Hook invoked after a successful write. Actions written by the subject
    /// itself or replayed from a remote never push (the owning device already
    /// has them); everything else is deduplicated and enqueued.
    pub fn notify(&self, project: &str, table: &str, actions: &[DataAction]) {
        let Some(database) = self
            .inner
            .projects
            .find_project(project)
            .map(|p| p.database_name())
        else {
            return;
        };
        let mut users: Vec<String> = Vec::new();
        let mut resource_update = false;
        for action in actions {
            if action.source == REMOTE_ORIGIN {
                continue;
            }
            match &action.user {
                Some(user) => {
                    if action.source == *user {
                        continue;
                    }
                    if !users.contains(user) {
                        users.push(user.clone());
                    }
                }
                None => resource_update = true,
            }
        }
        let mut updates: Vec<PushUpdate> = users
            .into_iter()
            .map(|user| PushUpdate {
                database: database.clone(),
                table: table.to_string(),
                user: Some(user),
                project: project.to_string(),
            })
            .collect();
        if resource_update {
            updates.push(PushUpdate {
                database,
                table: table.to_string(),
                user: None,
                project: project.to_string(),
            });
        }
        let mut pending = self.inner.pending.lock().expect("lock poisoned");
        for update in updates {
            if pending.insert(update.clone()) {
                // The worker is gone only after shutdown.
                let _ = self.inner.tx.send(update);
            }
        }
    }

    /// Stops the delivery worker. Pending updates are dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_worker(
    inner: Arc<DispatcherInner>,
    mut rx: mpsc::UnboundedReceiver<PushUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let update = tokio::select! {
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Some(update) => update,
                None => break,
            },
        };
        inner.pending.lock().expect("lock poisoned").remove(&update);
        loop {
            if *shutdown.borrow() {
                return;
            }
            if deliver(&inner, &update).await {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(RETRY_PAUSE) => {}
            }
        }
    }
}

/// Delivers one update to every matching registration. Returns false when a
/// transient failure means the update should be retried.
async fn deliver(inner: &Arc<DispatcherInner>, update: &PushUpdate) -> bool {
    let matching: Vec<(RegistrationKey, PushRegistration)> = {
        let index = inner.registrations.lock().expect("lock poisoned");
        index
            .iter()
            .filter(|(key, _)| key.matches_update(update))
            .flat_map(|(key, list)| list.iter().map(|reg| (key.clone(), reg.clone())))
            .collect()
    };
    if matching.is_empty() {
        return true;
    }
    let data = PushMessageData {
        project: update.project.clone(),
        user: update.user.clone(),
        table: update.table.clone(),
    };
    info!(
        "sending push message for project {}, table {}, user {:?} to {} devices",
        update.project,
        update.table,
        update.user,
        matching.len()
    );
    for (key, registration) in matching {
        match inner
            .gateway
            .send_data_message(&registration.fcm_token, &data)
            .await
        {
            Ok(()) => {}
            Err(err) => match err.retry_class() {
                PushRetryClass::DropRegistration => {
                    info!(
                        "dropping push registration for device {} on delivery error: {}",
                        registration.device_id, err
                    );
                    remove_dead_registration(inner, &key, &registration);
                }
                PushRetryClass::Retryable => {
                    error!("push delivery failed, will retry: {}", err);
                    return false;
                }
                PushRetryClass::Permanent => {
                    warn!("push delivery failed permanently: {}", err);
                }
            },
        }
    }
    true
}

fn remove_dead_registration(
    inner: &Arc<DispatcherInner>,
    key: &RegistrationKey,
    registration: &PushRegistration,
) {
    {
        let mut index = inner.registrations.lock().expect("lock poisoned");
        if let Some(list) = index.get_mut(key) {
            list.retain(|reg| reg.id != registration.id);
            if list.is_empty() {
                index.remove(key);
            }
        }
    }
    if let Err(err) = inner.store.remove_registration(&registration.id) {
        error!("failed to remove dead push registration: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use caresync_core::projects::{ProjectDef, TableDef};
    use caresync_core::sync::{ActionKind, TableFilter};

    use crate::error::{PushError, Result};

    #[derive(Default)]
    struct MockGateway {
        sent: Mutex<Vec<(String, PushMessageData)>>,
        fail_tokens: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl PushGateway for MockGateway {
        async fn send_data_message(&self, token: &str, data: &PushMessageData) -> Result<()> {
            if self.fail_tokens.lock().unwrap().contains(token) {
                return Err(PushError::service(404, "UNREGISTERED"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), data.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        removed: Mutex<Vec<String>>,
    }

    impl RegistrationStore for MockStore {
        fn remove_registration(&self, id: &str) -> std::result::Result<(), String> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn registry() -> Arc<ProjectRegistry> {
        Arc::new(ProjectRegistry::new(vec![ProjectDef {
            code: "default".to_string(),
            tables: vec![
                TableDef {
                    name: "heart_rate".to_string(),
                    modules: vec!["vitals".to_string()],
                    columns: vec!["user".to_string(), "bpm".to_string()],
                    time_column: None,
                },
                TableDef {
                    name: "steps".to_string(),
                    modules: vec!["activity".to_string()],
                    columns: vec!["user".to_string(), "count".to_string()],
                    time_column: None,
                },
            ],
        }]))
    }

    fn registration(device: &str, token: &str, restrictions: TableFilter) -> PushRegistration {
        PushRegistration::new("pat", "default", "default_data", device, token, restrictions)
    }

    fn action(table: &str, user: &str, source: &str) -> DataAction {
        DataAction {
            id: String::new(),
            table: table.to_string(),
            user: Some(user.to_string()),
            kind: ActionKind::Insert,
            record_id: "r1".to_string(),
            payload: None,
            sample_time: None,
            time: 0,
            seq: 1,
            source: source.to_string(),
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn delivers_to_matching_registration() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MockStore::default());
        let dispatcher = PushDispatcher::start(
            gateway.clone(),
            store,
            registry(),
            vec![registration("dev-1", "tok-1", TableFilter::default())],
        );
        // Written by another device of the same user: still pushed, because
        // the source is the acting origin, not this device.
        dispatcher.notify("default", "heart_rate", &[action("heart_rate", "pat", "writer")]);
        wait_until(|| !gateway.sent.lock().unwrap().is_empty()).await;
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent[0].0, "tok-1");
        assert_eq!(sent[0].1.table, "heart_rate");
        assert_eq!(sent[0].1.user.as_deref(), Some("pat"));
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn subject_own_writes_do_not_push() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MockStore::default());
        let dispatcher = PushDispatcher::start(
            gateway.clone(),
            store,
            registry(),
            vec![registration("dev-1", "tok-1", TableFilter::default())],
        );
        dispatcher.notify("default", "heart_rate", &[action("heart_rate", "pat", "pat")]);
        dispatcher.notify(
            "default",
            "heart_rate",
            &[action("heart_rate", "pat", REMOTE_ORIGIN)],
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(gateway.sent.lock().unwrap().is_empty());
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn restrictions_limit_triggering_tables() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MockStore::default());
        let restrictions = TableFilter {
            include_tables: vec!["steps".to_string()],
            exclude_tables: vec![],
        };
        let dispatcher = PushDispatcher::start(
            gateway.clone(),
            store,
            registry(),
            vec![registration("dev-1", "tok-1", restrictions)],
        );
        dispatcher.notify("default", "heart_rate", &[action("heart_rate", "pat", "writer")]);
        dispatcher.notify("default", "steps", &[action("steps", "pat", "writer")]);
        wait_until(|| !gateway.sent.lock().unwrap().is_empty()).await;
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.table, "steps");
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn dead_tokens_remove_the_registration() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .fail_tokens
            .lock()
            .unwrap()
            .insert("tok-dead".to_string());
        let store = Arc::new(MockStore::default());
        let reg = registration("dev-1", "tok-dead", TableFilter::default());
        let reg_id = reg.id.clone();
        let dispatcher =
            PushDispatcher::start(gateway.clone(), store.clone(), registry(), vec![reg]);
        dispatcher.notify("default", "heart_rate", &[action("heart_rate", "pat", "writer")]);
        wait_until(|| !store.removed.lock().unwrap().is_empty()).await;
        assert_eq!(store.removed.lock().unwrap().clone(), vec![reg_id]);
        dispatcher.shutdown();
    }
}
