//! Narrow SPI surfaces the embedder plugs into the session dispatcher:
//! `CommandInterceptor` (pre-command policy hook) and `EventHook`
//! (lifecycle notifications).

use std::net::SocketAddr;

use async_trait::async_trait;
use embermail_common::status::Status;

use crate::command::Command;

/// The point in the dispatch pipeline a `CommandInterceptor` is consulted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorStage {
    PreCommand,
    PostMailFrom,
    PostRcptTo,
    PreData,
}

/// A read-only snapshot of session state handed to a `CommandInterceptor`.
#[derive(Debug, Clone)]
pub struct InterceptorSnapshot<'a> {
    pub peer: SocketAddr,
    pub client_id: &'a str,
    pub authenticated_as: Option<&'a str>,
    pub tls_active: bool,
    pub sender: Option<&'a str>,
    pub recipient_count: usize,
}

/// The interceptor's verdict on a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Allow normal processing to continue.
    Proceed,
    /// Reject this one command with a response, keep the connection open.
    Deny(Status, String),
    /// Reject with a response and then close the connection.
    Drop(Status, String),
}

/// A policy hook invoked before commands are dispatched. Must be safe for
/// concurrent invocation across sessions.
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    async fn intercept(
        &self,
        stage: InterceptorStage,
        command: &Command,
        snapshot: InterceptorSnapshot<'_>,
    ) -> Verdict;
}

/// A no-op interceptor that always proceeds; the default when the embedder
/// supplies none.
#[derive(Debug, Default)]
pub struct NoopInterceptor;

#[async_trait]
impl CommandInterceptor for NoopInterceptor {
    async fn intercept(
        &self,
        _stage: InterceptorStage,
        _command: &Command,
        _snapshot: InterceptorSnapshot<'_>,
    ) -> Verdict {
        Verdict::Proceed
    }
}

/// Session and message lifecycle notifications, for metrics/audit
/// collaborators. Must be safe for concurrent invocation.
#[async_trait]
pub trait EventHook: Send + Sync {
    async fn session_started(&self, peer: SocketAddr) {
        let _ = peer;
    }

    async fn session_ended(&self, peer: SocketAddr) {
        let _ = peer;
    }

    async fn message_accepted(&self, tracking_id: &str, sender: &str, recipients: &[String]) {
        let _ = (tracking_id, sender, recipients);
    }

    async fn message_rejected(&self, reason: &str) {
        let _ = reason;
    }

    /// An authenticated ETRN request for `domain` (empty for a global run).
    /// The default does nothing; an embedder wires this to its spool's
    /// wake-up hook to process queued mail for that domain early.
    async fn etrn_requested(&self, domain: &str) {
        let _ = domain;
    }
}

/// A hook that does nothing; the default when the embedder supplies none.
#[derive(Debug, Default)]
pub struct NoopEventHook;

impl EventHook for NoopEventHook {}

/// Resolves a VRFY argument to the mailbox(es) it identifies, for embedders
/// that choose to enable VRFY rather than return the non-enumerating
/// default response.
#[async_trait]
pub trait UserHandler: Send + Sync {
    /// Returns the matching mailbox addresses, empty if `term` is unknown.
    async fn verify(&self, term: &str) -> Vec<String>;
}

/// A handler that never resolves anyone; paired with VRFY left disabled.
#[derive(Debug, Default)]
pub struct NoopUserHandler;

#[async_trait]
impl UserHandler for NoopUserHandler {
    async fn verify(&self, _term: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Expands a mailing list name to its member addresses, for embedders that
/// choose to enable EXPN.
#[async_trait]
pub trait MailingListHandler: Send + Sync {
    /// Returns `None` if `name` is not a known list.
    async fn expand(&self, name: &str) -> Option<Vec<String>>;
}

/// A handler with no mailing lists; paired with EXPN left disabled.
#[derive(Debug, Default)]
pub struct NoopMailingListHandler;

#[async_trait]
impl MailingListHandler for NoopMailingListHandler {
    async fn expand(&self, _name: &str) -> Option<Vec<String>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_interceptor_always_proceeds() {
        let interceptor = NoopInterceptor;
        let snapshot = InterceptorSnapshot {
            peer: "127.0.0.1:25".parse().unwrap(),
            client_id: "client",
            authenticated_as: None,
            tls_active: false,
            sender: None,
            recipient_count: 0,
        };
        let verdict = interceptor
            .intercept(InterceptorStage::PreCommand, &Command::Noop, snapshot)
            .await;
        assert_eq!(verdict, Verdict::Proceed);
    }
}
