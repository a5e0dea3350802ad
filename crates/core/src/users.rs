//! User model and the in-memory user cache.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Platform roles, from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Professional,
    Patient,
}

/// A platform user. Authentication flows live outside this crate; only the
/// fields the sync/access engine needs are modeled here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub userid: String,
    pub email: String,
    pub role: Role,
    pub active: bool,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// In-memory user lookup, constructed at startup from storage and injected
/// where needed. Mutations go through this API; there is no ambient global
/// instance.
#[derive(Debug, Default)]
pub struct UserCache {
    users: RwLock<HashMap<String, User>>,
}

impl UserCache {
    pub fn new(users: Vec<User>) -> Self {
        let map = users
            .into_iter()
            .map(|user| (user.userid.clone(), user))
            .collect();
        Self {
            users: RwLock::new(map),
        }
    }

    pub fn find_by_userid(&self, userid: &str) -> Option<User> {
        self.users
            .read()
            .expect("user cache lock poisoned")
            .get(userid)
            .cloned()
    }

    /// Email lookups are case-insensitive.
    pub fn find_by_email(&self, email: &str) -> Option<User> {
        let needle = email.to_lowercase();
        self.users
            .read()
            .expect("user cache lock poisoned")
            .values()
            .find(|user| user.email.to_lowercase() == needle)
            .cloned()
    }

    pub fn insert(&self, user: User) {
        self.users
            .write()
            .expect("user cache lock poisoned")
            .insert(user.userid.clone(), user);
    }

    pub fn remove(&self, userid: &str) {
        self.users
            .write()
            .expect("user cache lock poisoned")
            .remove(userid);
    }

    pub fn len(&self) -> usize {
        self.users.read().expect("user cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(userid: &str, email: &str, role: Role) -> User {
        User {
            userid: userid.to_string(),
            email: email.to_string(),
            role,
            active: true,
        }
    }

    #[test]
    fn email_lookup_ignores_case() {
        let cache = UserCache::new(vec![user("u1", "Alice@example.com", Role::Patient)]);
        assert_eq!(
            cache.find_by_email("alice@EXAMPLE.com").map(|u| u.userid),
            Some("u1".to_string())
        );
    }

    #[test]
    fn remove_evicts_user() {
        let cache = UserCache::new(vec![user("u1", "a@example.com", Role::Admin)]);
        cache.remove("u1");
        assert!(cache.find_by_userid("u1").is_none());
    }
}
