//! Routing policy: whether a recipient's domain is served locally (handed to
//! a [`crate::mailbox::LocalMailboxStore`]) or externally (handed to a
//! [`crate::relay::MailRelay`]).

use ahash::AHashSet;
use embermail_common::domain::Domain;

/// Domain-locality decision used by the delivery service to route each
/// recipient.
pub trait RoutingPolicy: Send + Sync {
    /// Returns `true` if `domain` is served by this installation.
    fn is_local(&self, domain: &Domain) -> bool;

    /// The full set of locally-served domains, for diagnostics and VRFY/EXPN.
    fn local_domains(&self) -> &AHashSet<Domain>;
}

/// A fixed set of local domains, configured once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRoutingPolicy {
    domains: AHashSet<Domain>,
}

impl StaticRoutingPolicy {
    #[must_use]
    pub fn new(domains: AHashSet<Domain>) -> Self {
        Self { domains }
    }
}

impl RoutingPolicy for StaticRoutingPolicy {
    fn is_local(&self, domain: &Domain) -> bool {
        self.domains.contains(domain)
    }

    fn local_domains(&self) -> &AHashSet<Domain> {
        &self.domains
    }
}
