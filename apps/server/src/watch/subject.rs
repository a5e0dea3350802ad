//! Subject watch hub: wakes pollers when the set of subjects visible to the
//! registration's user changes, or a visible subject's profile is updated.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use caresync_core::access::AccessDirectory;
use caresync_core::errors::{Error, Result};
use caresync_core::users::{Role, UserCache};
use caresync_core::watch::{
    SubjectEvent, SubjectEventType, WatchSubjectRegistration, HANGING_GET_TIMEOUT_MS,
};
use caresync_storage_sqlite::{DirectoryRepository, WatchSubjectRepository};

use crate::events::{UserEvent, UserEventBus};

struct SubjectEntry {
    state: Mutex<WatchSubjectRegistration>,
    /// Subjects currently visible to the registration's user; events are
    /// emitted on transitions of this set.
    known_subjects: Mutex<HashSet<String>>,
    notify: Notify,
    epoch: AtomicU64,
    removed: AtomicBool,
}

impl SubjectEntry {
    fn new(registration: WatchSubjectRegistration, known: HashSet<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(registration),
            known_subjects: Mutex::new(known),
            notify: Notify::new(),
            epoch: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        })
    }
}

struct SubjectHubInner {
    entries: Mutex<HashMap<String, Arc<SubjectEntry>>>,
    repo: WatchSubjectRepository,
    directory: Arc<DirectoryRepository>,
    users: Arc<UserCache>,
}

#[derive(Clone)]
pub struct SubjectWatchHub {
    inner: Arc<SubjectHubInner>,
}

impl SubjectWatchHub {
    pub fn new(
        repo: WatchSubjectRepository,
        directory: Arc<DirectoryRepository>,
        users: Arc<UserCache>,
    ) -> Self {
        Self {
            inner: Arc::new(SubjectHubInner {
                entries: Mutex::new(HashMap::new()),
                repo,
                directory,
                users,
            }),
        }
    }

    /// Spawns the task routing user events into registrations. Runs until
    /// the bus closes.
    pub fn start(&self, bus: &UserEventBus) {
        let hub = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => hub.handle_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("subject watch router lagged, dropped {} events", missed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn load(&self) -> Result<()> {
        self.maintain();
        let registrations = self.inner.repo.load_all().map_err(Error::from)?;
        let mut entries = self.inner.entries.lock().expect("hub lock poisoned");
        for registration in registrations {
            let known = self.visible_subjects(&registration.user, &registration.project)?;
            entries.insert(
                registration.id.clone(),
                SubjectEntry::new(registration, known),
            );
        }
        Ok(())
    }

    /// The project patients the user can see: everyone for admins, group
    /// co-members for professionals, themselves for patients. Inactive users
    /// are never visible.
    fn visible_subjects(&self, user: &str, project: &str) -> Result<HashSet<String>> {
        let Some(reg_user) = self.inner.users.find_by_userid(user) else {
            return Ok(HashSet::new());
        };
        let patients = self
            .inner
            .directory
            .project_members(project, Some(Role::Patient))
            .map_err(Error::from)?;
        let mut visible = HashSet::new();
        for patient in patients {
            if self.is_visible_subject(&reg_user.userid, reg_user.role, &patient)? {
                visible.insert(patient);
            }
        }
        Ok(visible)
    }

    fn is_visible_subject(
        &self,
        reg_user: &str,
        reg_role: Role,
        subject: &str,
    ) -> Result<bool> {
        let active = self
            .inner
            .users
            .find_by_userid(subject)
            .map(|u| u.active)
            .unwrap_or(false);
        if !active {
            return Ok(false);
        }
        match reg_role {
            Role::Admin => Ok(true),
            Role::Professional => self
                .inner
                .directory
                .share_access_group(reg_user, subject)
                .map_err(Error::from),
            Role::Patient => Ok(reg_user == subject),
        }
    }

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
                        entry.removed.store(true, Ordering::SeqCst);
                        entry.notify.notify_waiters();
                    }
                }
            }
            Err(err) => error!("failed to reap subject watch registrations: {}", err),
        }
    }

    pub fn register(&self, user: &str, project: &str, reset: bool) -> Result<String> {
        self.maintain();
        let now = Utc::now().timestamp_millis();
        let existing = {
            let entries = self.inner.entries.lock().expect("hub lock poisoned");
            entries
                .values()
                .find(|entry| {
                    let reg = entry.state.lock().expect("watch entry lock poisoned");
                    reg.user == user && reg.project == project
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
                    reg.events.clear();
                }
                reg.clone()
            };
            self.inner.repo.update(&snapshot).map_err(Error::from)?;
            return Ok(snapshot.id);
        }
        let registration = WatchSubjectRegistration::new(user, project);
        let known = self.visible_subjects(user, project)?;
        self.inner.repo.insert(&registration).map_err(Error::from)?;
        info!("start subject watch for user {} in project {}", user, project);
        let id = registration.id.clone();
        self.inner
            .entries
            .lock()
            .expect("hub lock poisoned")
            .insert(id.clone(), SubjectEntry::new(registration, known));
        Ok(id)
    }

    fn find_entry(&self, id: &str, caller: &str, project: &str) -> Result<Arc<SubjectEntry>> {
        let entries = self.inner.entries.lock().expect("hub lock poisoned");
        let entry = entries
            .get(id)
            .ok_or_else(|| Error::not_found("watch registration not found"))?;
        let reg = entry.state.lock().expect("watch entry lock poisoned");
        if reg.user != caller || reg.project != project {
            return Err(Error::not_found("watch registration not found"));
        }
        drop(reg);
        Ok(entry.clone())
    }

    pub async fn poll(
        &self,
        id: &str,
        caller: &str,
        project: &str,
    ) -> Result<Vec<SubjectEvent>> {
        let entry = self.find_entry(id, caller, project)?;
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
            let events = {
                let mut reg = entry.state.lock().expect("watch entry lock poisoned");
                if reg.events.is_empty() {
                    None
                } else {
                    let result = std::mem::take(&mut reg.events);
                    Some((result, reg.clone()))
                }
            };
            if let Some((result, snapshot)) = events {
                self.inner.repo.update(&snapshot).map_err(Error::from)?;
                return Ok(result);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    pub fn unregister(&self, id: &str, caller: &str, project: &str) -> Result<()> {
        let Ok(entry) = self.find_entry(id, caller, project) else {
            return Ok(());
        };
        self.inner
            .entries
            .lock()
            .expect("hub lock poisoned")
            .remove(id);
        entry.removed.store(true, Ordering::SeqCst);
        entry.notify.notify_waiters();
        self.inner.repo.delete(id).map_err(Error::from)?;
        Ok(())
    }

    /// Routes one directory event into every affected registration.
    pub fn handle_event(&self, event: &UserEvent) {
        let entries: Vec<Arc<SubjectEntry>> = {
            let entries = self.inner.entries.lock().expect("hub lock poisoned");
            entries.values().cloned().collect()
        };
        for entry in entries {
            if let Err(err) = self.apply_event(&entry, event) {
                error!("failed to apply subject watch event: {}", err);
            }
        }
    }

    fn apply_event(&self, entry: &Arc<SubjectEntry>, event: &UserEvent) -> Result<()> {
        let (reg_user, reg_project) = {
            let reg = entry.state.lock().expect("watch entry lock poisoned");
            (reg.user.clone(), reg.project.clone())
        };
        let reg_role = match self.inner.users.find_by_userid(&reg_user) {
            Some(user) => user.role,
            None => return Ok(()),
        };
        let emitted = match event {
            UserEvent::AddedToProject {
                userid,
                project,
                role,
            } => {
                if *role != Role::Patient || *project != reg_project {
                    return Ok(());
                }
                self.try_add_subject(entry, &reg_user, reg_role, userid)?
            }
            UserEvent::RemovedFromProject {
                userid,
                project,
                role,
            } => {
                if *role != Role::Patient || *project != reg_project {
                    return Ok(());
                }
                self.try_remove_subject(entry, userid)
            }
            UserEvent::ActiveChanged { userid, active } => {
                if *active {
                    let is_patient = self
                        .inner
                        .directory
                        .project_members(&reg_project, Some(Role::Patient))
                        .map_err(Error::from)?
                        .contains(userid);
                    if !is_patient {
                        return Ok(());
                    }
                    self.try_add_subject(entry, &reg_user, reg_role, userid)?
                } else {
                    self.try_remove_subject(entry, userid)
                }
            }
            UserEvent::ProfileUpdated { userid } => {
                let known = entry
                    .known_subjects
                    .lock()
                    .expect("watch entry lock poisoned")
                    .contains(userid);
                if known {
                    self.push_event(entry, SubjectEventType::ProfileUpdated, userid)
                } else {
                    false
                }
            }
        };
        if emitted {
            let snapshot = entry.state.lock().expect("watch entry lock poisoned").clone();
            self.inner.repo.update(&snapshot).map_err(Error::from)?;
            entry.notify.notify_waiters();
        }
        Ok(())
    }

    fn try_add_subject(
        &self,
        entry: &Arc<SubjectEntry>,
        reg_user: &str,
        reg_role: Role,
        subject: &str,
    ) -> Result<bool> {
        {
            let known = entry
                .known_subjects
                .lock()
                .expect("watch entry lock poisoned");
            if known.contains(subject) {
                return Ok(false);
            }
        }
        if !self.is_visible_subject(reg_user, reg_role, subject)? {
            return Ok(false);
        }
        entry
            .known_subjects
            .lock()
            .expect("watch entry lock poisoned")
            .insert(subject.to_string());
        Ok(self.push_event(entry, SubjectEventType::Added, subject))
    }

    fn try_remove_subject(&self, entry: &Arc<SubjectEntry>, subject: &str) -> bool {
        let removed = entry
            .known_subjects
            .lock()
            .expect("watch entry lock poisoned")
            .remove(subject);
        if !removed {
            return false;
        }
        self.push_event(entry, SubjectEventType::Removed, subject)
    }

    fn push_event(
        &self,
        entry: &Arc<SubjectEntry>,
        event_type: SubjectEventType,
        subject: &str,
    ) -> bool {
        let mut reg = entry.state.lock().expect("watch entry lock poisoned");
        reg.events.push(SubjectEvent {
            event_type,
            subject: subject.to_string(),
        });
        true
    }
}
