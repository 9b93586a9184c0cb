//! The top-level, deserializable configuration tree: one RON document
//! describes every listener plus the process-wide knobs shared across the
//! protocol engine, spool, and delivery service.

use std::{collections::HashMap, path::PathBuf};

use serde::Deserialize;

/// One accepted port and the capabilities it advertises.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub port: u16,
    #[serde(default = "defaults::service_name")]
    pub service_name: String,
    /// TLS is active from the first byte; no STARTTLS upgrade is offered.
    #[serde(default)]
    pub implicit_tls: bool,
    #[serde(default)]
    pub enable_starttls: bool,
    #[serde(default)]
    pub enable_auth: bool,
    #[serde(default)]
    pub require_auth_for_mail: bool,
    #[serde(default)]
    pub proxy_protocol: bool,
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

/// A static username/password table for [`crate::hooks::StaticAuthService`].
/// Passwords are compared verbatim; an embedder with stronger requirements
/// supplies its own `AuthService` instead of this process-wide table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthUserMap {
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Toggles for the optional diagnostic verbs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureToggles {
    #[serde(default)]
    pub vrfy: bool,
    #[serde(default)]
    pub expn: bool,
    #[serde(default = "defaults::etrn_enabled")]
    pub etrn: bool,
}

/// Process-wide configuration: everything shared across every listener plus
/// the spool and delivery subsystems.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    pub listeners: Vec<ListenerConfig>,

    /// Domains this installation delivers to local mailboxes rather than
    /// relaying externally.
    #[serde(default)]
    pub local_domains: Vec<String>,

    /// Root directory local mailbox files are written under.
    #[serde(default = "defaults::mailbox_dir")]
    pub mailbox_dir: PathBuf,

    /// Scratch directory for in-flight DATA bodies before they are spooled.
    #[serde(default = "defaults::temp_dir")]
    pub temp_dir: PathBuf,

    #[serde(default)]
    pub spool: embermail_spool::SpoolConfig,

    /// TLS certificate/key pair shared by every listener that enables TLS.
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    /// Accepted for forward compatibility with deployments that pin a TLS
    /// floor; the underlying rustls server config does not yet expose a
    /// version selector to wire this through to.
    #[serde(default = "defaults::min_tls_version")]
    pub min_tls_version: TlsVersion,
    /// Same caveat as `min_tls_version`: recorded, not yet enforced.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Root directory an embedder-supplied `MailingListHandler` may read
    /// list membership from; this crate's own default handler ignores it.
    #[serde(default = "defaults::lists_dir")]
    pub lists_dir: PathBuf,

    #[serde(default)]
    pub auth: AuthUserMap,

    #[serde(default)]
    pub features: FeatureToggles,

    #[serde(default)]
    pub delivery: embermail_delivery::DeliveryConfig,

    /// CIDR blocks a PROXY protocol header is honoured from.
    #[serde(default)]
    pub trusted_proxies: Vec<ipnet::IpNet>,
}

/// The TLS protocol floor a deployment pins. See the caveat on
/// [`Config::min_tls_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1.2")]
    Tls12,
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

mod defaults {
    use std::path::PathBuf;

    pub fn hostname() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    pub fn service_name() -> String {
        "embermail".to_string()
    }

    pub const fn idle_timeout_secs() -> u64 {
        300
    }

    pub const fn etrn_enabled() -> bool {
        true
    }

    pub fn mailbox_dir() -> PathBuf {
        PathBuf::from("/var/lib/embermail/mailboxes")
    }

    pub fn temp_dir() -> PathBuf {
        std::env::temp_dir().join("embermail")
    }

    pub fn lists_dir() -> PathBuf {
        PathBuf::from("/var/lib/embermail/lists")
    }

    pub const fn min_tls_version() -> super::TlsVersion {
        super::TlsVersion::Tls12
    }
}
