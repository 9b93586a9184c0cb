//! The default outbound relay: an embedder that wants real MX/DNS/TLS
//! delivery to remote domains supplies its own [`MailRelay`]; this one is a
//! convenience default for local-only deployments (everything routes to
//! [`embermail_delivery::routing::StaticRoutingPolicy`]'s local domains, so
//! nothing ever reaches it unless misconfigured).

use async_trait::async_trait;
use embermail_common::status::{EnhancedStatusCode, Status};
use embermail_delivery::{DeliveryError, MailRelay, RelayOutcome, RelayRequest};

/// Permanently rejects every recipient it is asked to relay. Installed by
/// default so a deployment with no configured relay fails fast and visibly
/// (a DSN, if enabled) instead of retrying forever against nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllRelay;

#[async_trait]
impl MailRelay for DenyAllRelay {
    async fn relay(&self, _request: RelayRequest) -> Result<RelayOutcome, DeliveryError> {
        Ok(RelayOutcome::Permanent {
            status: Status::Error,
            code: EnhancedStatusCode::new(5, 1, 1),
            reason: "relaying to remote domains is not configured on this server".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deny_all_relay_rejects_permanently() {
        let relay = DenyAllRelay;
        let outcome = relay
            .relay(RelayRequest {
                client_id: "client".to_string(),
                sender: Some("a@example.com".to_string()),
                recipient: "b@elsewhere.example".to_string(),
                message_path: "/tmp/does-not-matter".into(),
            })
            .await
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::Permanent { .. }));
    }
}
