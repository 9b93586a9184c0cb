//! Default SPI collaborators wired from [`crate::config::Config`]: a static
//! username/password `AuthService`, a mailbox-directory-backed `UserHandler`,
//! and an `EventHook` that nudges the delivery worker pool awake.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use embermail_delivery::WorkerPool;
use embermail_smtp::{
    auth::AuthService,
    spi::{EventHook, UserHandler},
};

/// Verifies against a fixed username/password table read once at startup.
/// An embedder with a real user directory (LDAP, a database) supplies its
/// own `AuthService` instead of this one.
#[derive(Debug)]
pub struct StaticAuthService {
    users: HashMap<String, String>,
    required_for_mail: bool,
}

impl StaticAuthService {
    #[must_use]
    pub fn new(users: HashMap<String, String>, required_for_mail: bool) -> Self {
        Self {
            users,
            required_for_mail,
        }
    }
}

#[async_trait]
impl AuthService for StaticAuthService {
    fn enabled(&self) -> bool {
        !self.users.is_empty()
    }

    fn required_for_mail(&self) -> bool {
        self.required_for_mail
    }

    async fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|expected| expected == password)
    }
}

/// Resolves VRFY against the same user table an embedder configures for
/// AUTH, treating each key as a local mailbox name.
#[derive(Debug)]
pub struct TableUserHandler {
    users: Vec<String>,
}

impl TableUserHandler {
    #[must_use]
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users: users.into_keys().collect(),
        }
    }
}

#[async_trait]
impl UserHandler for TableUserHandler {
    async fn verify(&self, term: &str) -> Vec<String> {
        self.users
            .iter()
            .filter(|user| user.eq_ignore_ascii_case(term))
            .cloned()
            .collect()
    }
}

/// Wakes the delivery worker pool's claim loop early whenever mail is
/// accepted or an authenticated ETRN requests it, instead of waiting for the
/// next poll interval.
pub struct DeliveryTriggerHook {
    workers: Arc<WorkerPool>,
}

impl DeliveryTriggerHook {
    #[must_use]
    pub fn new(workers: Arc<WorkerPool>) -> Self {
        Self { workers }
    }
}

#[async_trait]
impl EventHook for DeliveryTriggerHook {
    async fn message_accepted(&self, _tracking_id: &str, _sender: &str, _recipients: &[String]) {
        self.workers.trigger();
    }

    async fn etrn_requested(&self, _domain: &str) {
        self.workers.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_auth_service_verifies_known_pair() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "hunter2".to_string());
        let service = StaticAuthService::new(users, false);

        assert!(service.enabled());
        assert!(service.verify("alice", "hunter2").await);
        assert!(!service.verify("alice", "wrong").await);
        assert!(!service.verify("bob", "hunter2").await);
    }

    #[tokio::test]
    async fn empty_table_disables_auth() {
        let service = StaticAuthService::new(HashMap::new(), false);
        assert!(!service.enabled());
    }

    #[tokio::test]
    async fn table_user_handler_matches_case_insensitively() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "pw".to_string());
        let handler = TableUserHandler::new(users);

        assert_eq!(handler.verify("ALICE").await, vec!["alice".to_string()]);
        assert!(handler.verify("bob").await.is_empty());
    }
}
