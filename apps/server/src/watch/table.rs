//! Table watch hub: wakes pollers when a watched project table changes, and
//! delivers webhook callbacks for registrations that asked for them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{error, info};

use caresync_core::errors::{Error, Result};
use caresync_core::sync::DataAction;
use caresync_core::watch::{WatchTableRegistration, HANGING_GET_TIMEOUT_MS};
use caresync_storage_sqlite::WatchTableRepository;

struct WatchEntry {
    state: Mutex<WatchTableRegistration>,
    notify: Notify,
    /// Incremented by every new poll or re-registration; an in-flight poll
    /// holding an older ticket is superseded and returns promptly.
    epoch: AtomicU64,
    removed: AtomicBool,
}

impl WatchEntry {
    fn new(registration: WatchTableRegistration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(registration),
            notify: Notify::new(),
            epoch: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> WatchTableRegistration {
        self.state.lock().expect("watch entry lock poisoned").clone()
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

struct TableHubInner {
    entries: Mutex<HashMap<String, Arc<WatchEntry>>>,
    repo: WatchTableRepository,
    http: reqwest::Client,
}

#[derive(Clone)]
pub struct TableWatchHub {
    inner: Arc<TableHubInner>,
}

impl TableWatchHub {
    pub fn new(repo: WatchTableRepository, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(TableHubInner {
                entries: Mutex::new(HashMap::new()),
                repo,
                http,
            }),
        }
    }

    /// Restores entries for registrations that survived a restart.
    pub fn load(&self) -> Result<()> {
        self.maintain();
        let registrations = self.inner.repo.load_all().map_err(Error::from)?;
        let mut entries = self.inner.entries.lock().expect("hub lock poisoned");
        for registration in registrations {
            info!(
                "start watch project {}, table {}, subject {:?}",
                registration.project, registration.table, registration.subject
            );
            entries.insert(registration.id.clone(), WatchEntry::new(registration));
        }
        Ok(())
    }

    /// Reaps abandoned registrations.
    pub fn maintain(&self) {
        let now = Utc::now().timestamp_millis();
        match self.inner.repo.reap(now) {
            Ok(removed) => {
                if removed.is_empty() {
                    return;
                }
                let mut entries = self.inner.entries.lock().expect("hub lock poisoned");
                for id in removed {
                    if let Some(entry) = entries.remove(&id) {
                        let reg = entry.snapshot();
                        info!(
                            "autoremove watch project {}, table {}, subject {:?}",
                            reg.project, reg.table, reg.subject
                        );
                        entry.mark_removed();
                    }
                }
            }
            Err(err) => error!("failed to reap watch registrations: {}", err),
        }
    }

    /// Creates a registration, or resets the matching existing one. Returns
    /// its id.
    pub fn register(
        &self,
        user: &str,
        project: &str,
        table: &str,
        subject: Option<String>,
        callback_url: Option<String>,
        reset: bool,
    ) -> Result<String> {
        self.maintain();
        let now = Utc::now().timestamp_millis();
        let existing = {
            let entries = self.inner.entries.lock().expect("hub lock poisoned");
            entries
                .values()
                .find(|entry| {
                    let reg = entry.state.lock().expect("watch entry lock poisoned");
                    reg.user == user
                        && reg.project == project
                        && reg.table == table
                        && reg.subject == subject
                        && reg.callback_url == callback_url
                })
                .cloned()
        };
        if let Some(entry) = existing {
            entry.epoch.fetch_add(1, Ordering::SeqCst);
            entry.notify.notify_waiters();
            let snapshot = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                reg.last_watch_time = now;
                if reset {
                    reg.triggered_subjects.clear();
                }
                reg.clone()
            };
            self.inner.repo.update(&snapshot).map_err(Error::from)?;
            return Ok(snapshot.id);
        }
        let registration =
            WatchTableRegistration::new(user, project, table, subject, callback_url);
        self.inner.repo.insert(&registration).map_err(Error::from)?;
        info!(
            "start watch project {}, table {}, subject {:?}",
            registration.project, registration.table, registration.subject
        );
        let id = registration.id.clone();
        self.inner
            .entries
            .lock()
            .expect("hub lock poisoned")
            .insert(id.clone(), WatchEntry::new(registration));
        Ok(id)
    }

    fn find_entry(
        &self,
        id: &str,
        caller: &str,
        project: &str,
        table: &str,
    ) -> Result<Arc<WatchEntry>> {
        let entries = self.inner.entries.lock().expect("hub lock poisoned");
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::not_found("watch registration not found"))?;
        let reg = entry.state.lock().expect("watch entry lock poisoned");
        if reg.user != caller || reg.project != project || reg.table != table {
            return Err(Error::not_found("watch registration not found"));
        }
        drop(reg);
        Ok(entry.clone())
    }

    /// The subject the registration is scoped to (`None` = any subject),
    /// needed by the per-poll access re-check.
    pub fn registration_subject(
        &self,
        id: &str,
        caller: &str,
        project: &str,
        table: &str,
    ) -> Result<Option<String>> {
        let entry = self.find_entry(id, caller, project, table)?;
        Ok(entry.snapshot().subject)
    }

    /// Blocks until the registration has triggered subjects, the poll is
    /// superseded, the registration disappears, or the hanging-GET deadline
    /// passes. Everything but the first case returns an empty list.
    pub async fn poll(
        &self,
        id: &str,
        caller: &str,
        project: &str,
        table: &str,
    ) -> Result<Vec<String>> {
        let entry = self.find_entry(id, caller, project, table)?;
        let snapshot = {
            let mut reg = entry.state.lock().expect("watch entry lock poisoned");
            reg.last_watch_time = Utc::now().timestamp_millis();
            reg.clone()
        };
        self.inner.repo.update(&snapshot).map_err(Error::from)?;

        let ticket = entry.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        entry.notify.notify_waiters();
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(HANGING_GET_TIMEOUT_MS);
        loop {
            // Register for wakeups before checking state, so a notification
            // arriving in between is not lost.
            let notified = entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if entry.removed.load(Ordering::SeqCst)
                || entry.epoch.load(Ordering::SeqCst) != ticket
            {
                return Ok(Vec::new());
            }
            let triggered = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                if reg.triggered_subjects.is_empty() {
                    None
                } else {
                    let result = std::mem::take(&mut reg.triggered_subjects);
                    Some((result, reg.clone()))
                }
            };
            if let Some((result, snapshot)) = triggered {
                self.inner.repo.update(&snapshot).map_err(Error::from)?;
                return Ok(result);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Idempotent removal. A poll racing with this observes the removed flag
    /// and returns promptly.
    pub fn unregister(&self, id: &str, caller: &str, project: &str, table: &str) -> Result<()> {
        let Ok(entry) = self.find_entry(id, caller, project, table) else {
            return Ok(());
        };
        {
            let mut entries = self.inner.entries.lock().expect("hub lock poisoned");
            entries.remove(id);
        }
        let reg = entry.snapshot();
        info!(
            "remove watch project {}, table {}, subject {:?}",
            reg.project, reg.table, reg.subject
        );
        entry.mark_removed();
        self.inner.repo.delete(id).map_err(Error::from)?;
        Ok(())
    }

    /// Write-path hook: accumulates triggered subjects on matching
    /// registrations, wakes pollers and spawns callback delivery.
    pub fn on_change(&self, project: &str, table: &str, actions: &[DataAction]) {
        let entries: Vec<Arc<WatchEntry>> = {
            let entries = self.inner.entries.lock().expect("hub lock poisoned");
            entries.values().cloned().collect()
        };
        for entry in entries {
            if entry.removed.load(Ordering::SeqCst) {
                continue;
            }
            let snapshot = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                if reg.project != project || reg.table != table {
                    continue;
                }
                let subjects = reg.matching_subjects(actions);
                if subjects.is_empty() {
                    continue;
                }
                let mut changed = false;
                for subject in subjects {
                    if !reg.triggered_subjects.contains(&subject) {
                        reg.triggered_subjects.push(subject);
                        changed = true;
                    }
                }
                if !changed {
                    continue;
                }
                reg.triggered_subjects.sort();
                reg.clone()
            };
            if let Err(err) = self.inner.repo.update(&snapshot) {
                error!("failed to save triggered subjects: {}", err);
            }
            entry.notify.notify_waiters();
            if snapshot.callback_url.is_some() && !snapshot.triggered_subjects.is_empty() {
                tokio::spawn(run_callback(
                    self.inner.clone(),
                    entry.clone(),
                    snapshot.triggered_subjects.clone(),
                ));
            }
        }
    }
}

fn is_callback_expired(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::NOT_FOUND {
        return false;
    }
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|e| e.as_str())
                .map(|e| e.eq_ignore_ascii_case("callback_expired"))
        })
        .unwrap_or(false)
}

async fn run_callback(
    inner: Arc<TableHubInner>,
    entry: Arc<WatchEntry>,
    subjects: Vec<String>,
) {
    let Some((url, reg)) = ({
        let reg = entry.state.lock().expect("watch entry lock poisoned");
        reg.callback_url.clone().map(|url| (url, reg.clone()))
    }) else {
        return;
    };
    let body = json!({
        "project": reg.project,
        "table": reg.table,
        "subjects": subjects,
    });
    match inner.http.post(&url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            info!(
                "sent callback for watch project {}, table {}, subject {:?}: triggered subjects = {:?}",
                reg.project, reg.table, reg.subject, subjects
            );
            let snapshot = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                reg.callback_fail_count = 0;
                reg.callback_fail_start = 0;
                reg.triggered_subjects.retain(|s| !subjects.contains(s));
                reg.clone()
            };
            if let Err(err) = inner.repo.update(&snapshot) {
                error!("failed to save callback result: {}", err);
            }
        }
        outcome => {
            info!(
                "callback failed for watch project {}, table {}, subject {:?}: triggered subjects = {:?}",
                reg.project, reg.table, reg.subject, subjects
            );
            let expired = match outcome {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    is_callback_expired(status, &text)
                }
                Err(_) => false,
            };
            if expired {
                inner
                    .entries
                    .lock()
                    .expect("hub lock poisoned")
                    .remove(&reg.id);
                entry.mark_removed();
                if let Err(err) = inner.repo.delete(&reg.id) {
                    error!("failed to remove expired callback registration: {}", err);
                }
                return;
            }
            let now = Utc::now().timestamp_millis();
            let snapshot = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                if reg.callback_fail_count == 0 {
                    reg.callback_fail_count = 1;
                    reg.callback_fail_start = now;
                } else {
                    reg.callback_fail_count += 1;
                }
                reg.clone()
            };
            if let Err(err) = inner.repo.update(&snapshot) {
                error!("failed to save callback failure: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresync_core::sync::ActionKind;
    use caresync_storage_sqlite::db::create_in_memory_pool;

    fn hub() -> TableWatchHub {
        TableWatchHub::new(
            WatchTableRepository::new(create_in_memory_pool().expect("in-memory pool")),
            reqwest::Client::new(),
        )
    }

    fn action(user: &str) -> DataAction {
        DataAction {
            id: String::new(),
            table: "heart_rate".to_string(),
            user: Some(user.to_string()),
            kind: ActionKind::Insert,
            record_id: "r1".to_string(),
            payload: None,
            sample_time: None,
            time: 0,
            seq: 1,
            source: user.to_string(),
        }
    }

    #[tokio::test]
    async fn poll_returns_subjects_triggered_by_a_change() {
        let hub = hub();
        let id = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, false)
            .unwrap();
        let poller = {
            let hub = hub.clone();
            let id = id.clone();
            tokio::spawn(async move { hub.poll(&id, "prof", "default", "heart_rate").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.on_change("default", "heart_rate", &[action("pat")]);
        let subjects = poller.await.unwrap().unwrap();
        assert_eq!(subjects, vec!["pat".to_string()]);
    }

    #[tokio::test]
    async fn second_poll_supersedes_the_first() {
        let hub = hub();
        let id = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, false)
            .unwrap();
        let first = {
            let hub = hub.clone();
            let id = id.clone();
            tokio::spawn(async move { hub.poll(&id, "prof", "default", "heart_rate").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let hub = hub.clone();
            let id = id.clone();
            tokio::spawn(async move { hub.poll(&id, "prof", "default", "heart_rate").await })
        };
        // The first poll returns promptly and empty once superseded.
        let first_result =
            tokio::time::timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
        assert_eq!(first_result.unwrap(), Vec::<String>::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.on_change("default", "heart_rate", &[action("pat")]);
        let second_result =
            tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap();
        assert_eq!(second_result.unwrap(), vec!["pat".to_string()]);
    }

    #[tokio::test]
    async fn unregister_wakes_a_parked_poll() {
        let hub = hub();
        let id = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, false)
            .unwrap();
        let poller = {
            let hub = hub.clone();
            let id = id.clone();
            tokio::spawn(async move { hub.poll(&id, "prof", "default", "heart_rate").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.unregister(&id, "prof", "default", "heart_rate").unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), poller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), Vec::<String>::new());
        // The next poll observes the removal.
        let err = hub.poll(&id, "prof", "default", "heart_rate").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn foreign_caller_cannot_poll_a_registration() {
        let hub = hub();
        let id = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, false)
            .unwrap();
        let err = hub
            .poll(&id, "other", "default", "heart_rate")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn reregistration_reuses_the_registration() {
        let hub = hub();
        let first = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, false)
            .unwrap();
        hub.on_change("default", "heart_rate", &[action("pat")]);
        let second = hub
            .register("prof", "default", "heart_rate", Some("pat".to_string()), None, true)
            .unwrap();
        assert_eq!(first, second);
        // The reset cleared the accumulated subjects, so a fresh poll times
        // out instead of returning them; verify via the stored state.
        let entries = hub.inner.entries.lock().unwrap();
        let reg = entries.get(&second).unwrap().snapshot();
        assert!(reg.triggered_subjects.is_empty());
    }
}
