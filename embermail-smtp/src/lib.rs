pub mod auth;
pub mod command;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod framer;
pub mod fsm;
pub mod listener;
pub mod proxy;
pub mod rate_limiter;
pub mod server;
pub mod session;
pub mod session_state;
pub mod spi;
pub mod state;
pub mod transaction_handler;

use std::sync::Arc;

use embermail_common::error::ProtocolError;
use serde::Deserialize;
// Re-export the type-safe state machine from the state module
pub use state::State;

use crate::{
    auth::{AuthRateLimiter, AuthService, DisabledAuthService, LocalAuthRateLimiter},
    extensions::Extension,
    rate_limiter::{ConnectionRateLimiter, LocalConnectionRateLimiter},
    session::{SessionConfig, TlsContext},
    spi::{
        CommandInterceptor, EventHook, MailingListHandler, NoopEventHook, NoopInterceptor,
        NoopMailingListHandler, NoopUserHandler, UserHandler,
    },
    transaction_handler::{NoopTransactionProcessor, TransactionProcessor},
};

/// Default SIZE (RFC 1870) advertised when a listener configures no explicit
/// limit: 10 MiB, a conservative ceiling against unbounded body reads.
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// SMTP server-side timeout configuration
///
/// These timeouts prevent resource exhaustion from slow or malicious clients
/// and follow RFC 5321 Section 4.5.3.2 recommendations.
#[derive(Clone, Debug, Deserialize)]
pub struct SmtpServerTimeouts {
    /// Timeout for regular SMTP commands (EHLO, MAIL FROM, RCPT TO, etc.)
    ///
    /// RFC 5321 recommends: 5 minutes
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    /// Timeout for DATA command response
    ///
    /// RFC 5321 recommends: 2 minutes
    /// Default: 120 seconds (2 minutes)
    #[serde(default = "default_data_init_timeout")]
    pub data_init_secs: u64,

    /// Timeout between data chunks while receiving message body
    ///
    /// RFC 5321 recommends: 3 minutes
    /// Default: 180 seconds (3 minutes)
    #[serde(default = "default_data_block_timeout")]
    pub data_block_secs: u64,

    /// Timeout for processing after final dot terminator
    ///
    /// RFC 5321 recommends: 10 minutes
    /// Default: 600 seconds (10 minutes)
    #[serde(default = "default_data_termination_timeout")]
    pub data_termination_secs: u64,

    /// Maximum total session duration
    ///
    /// Prevents sessions from living indefinitely.
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "default_connection_timeout")]
    pub connection_secs: u64,
}

impl Default for SmtpServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            data_init_secs: default_data_init_timeout(),
            data_block_secs: default_data_block_timeout(),
            data_termination_secs: default_data_termination_timeout(),
            connection_secs: default_connection_timeout(),
        }
    }
}

const fn default_command_timeout() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_data_init_timeout() -> u64 {
    120 // 2 minutes per RFC 5321
}

const fn default_data_block_timeout() -> u64 {
    180 // 3 minutes per RFC 5321
}

const fn default_data_termination_timeout() -> u64 {
    600 // 10 minutes per RFC 5321
}

const fn default_connection_timeout() -> u64 {
    1800 // 30 minutes
}

/// Listener-wide SMTP configuration: the capabilities and SPI collaborators
/// shared by every connection a [`listener::Listener`] accepts. Built once
/// via [`SmtpConfig::builder`] and turned into a fresh [`SessionConfig`] per
/// accepted connection.
#[derive(Clone)]
pub struct SmtpConfig {
    pub extensions: Vec<Extension>,
    pub tls_context: Option<TlsContext>,
    pub banner: String,
    pub timeouts: SmtpServerTimeouts,
    pub interceptor: Arc<dyn CommandInterceptor>,
    pub event_hook: Arc<dyn EventHook>,
    pub processor: Arc<dyn TransactionProcessor>,
    pub auth_service: Arc<dyn AuthService>,
    pub auth_rate_limiter: Arc<dyn AuthRateLimiter>,
    pub connection_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    /// CIDR blocks a PROXY protocol v1 header is honoured from; an
    /// unlisted peer's header is ignored and its raw TCP address used.
    pub trusted_proxies: Vec<ipnet::IpNet>,
    pub vrfy_enabled: bool,
    pub user_handler: Arc<dyn UserHandler>,
    pub expn_enabled: bool,
    pub list_handler: Arc<dyn MailingListHandler>,
    /// The TLS handshake runs immediately on accept rather than via a later
    /// STARTTLS upgrade. Requires `tls_context` to be set; validated by
    /// [`SmtpConfig::validate`].
    pub implicit_tls: bool,
}

impl SmtpConfig {
    #[must_use]
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Builds the per-connection [`SessionConfig`] this listener-wide config
    /// describes, cloning the shared SPI collaborators behind their `Arc`s.
    #[must_use]
    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig::builder()
            .with_extensions(self.extensions.clone())
            .with_tls_context(self.tls_context.clone())
            .with_banner(self.banner.clone())
            .with_timeouts(self.timeouts.clone())
            .with_interceptor(self.interceptor.clone())
            .with_event_hook(self.event_hook.clone())
            .with_transaction_processor(self.processor.clone())
            .with_auth_service(self.auth_service.clone())
            .with_auth_rate_limiter(self.auth_rate_limiter.clone())
            .with_connection_rate_limiter(self.connection_rate_limiter.clone())
            .with_vrfy_enabled(self.vrfy_enabled)
            .with_user_handler(self.user_handler.clone())
            .with_expn_enabled(self.expn_enabled)
            .with_list_handler(self.list_handler.clone())
            .with_implicit_tls(self.implicit_tls)
            .build()
    }

    /// Checks that any configured STARTTLS certificate/key pair actually
    /// exists on disk, and ensures a SIZE extension is always advertised.
    ///
    /// # Errors
    /// Returns `ProtocolError` if TLS material is configured but missing.
    pub fn validate(&mut self) -> Result<(), ProtocolError> {
        if let Some(Extension::Starttls(tls)) = self
            .extensions
            .iter()
            .find(|ext| matches!(ext, Extension::Starttls(_)))
        {
            if !tls.certificate.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Unable to find TLS Certificate {}",
                        tls.certificate.display()
                    ),
                )
                .into());
            }

            if !tls.key.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {}", tls.key.display()),
                )
                .into());
            }
        }

        if self.implicit_tls {
            let Some(tls) = &self.tls_context else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "implicit TLS is enabled but no tls_context is configured",
                )
                .into());
            };

            if !tls.certificate.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!(
                        "Unable to find TLS Certificate {}",
                        tls.certificate.display()
                    ),
                )
                .into());
            }

            if !tls.key.try_exists()? {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Unable to find TLS Key {}", tls.key.display()),
                )
                .into());
            }
        }

        if !self
            .extensions
            .iter()
            .any(|ext| matches!(ext, Extension::Size(_)))
        {
            self.extensions.push(Extension::Size(MAX_MESSAGE_SIZE));
        }

        Ok(())
    }
}

pub struct SmtpConfigBuilder {
    extensions: Vec<Extension>,
    tls_context: Option<TlsContext>,
    banner: String,
    timeouts: SmtpServerTimeouts,
    interceptor: Arc<dyn CommandInterceptor>,
    event_hook: Arc<dyn EventHook>,
    processor: Arc<dyn TransactionProcessor>,
    auth_service: Arc<dyn AuthService>,
    auth_rate_limiter: Arc<dyn AuthRateLimiter>,
    connection_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    trusted_proxies: Vec<ipnet::IpNet>,
    vrfy_enabled: bool,
    user_handler: Arc<dyn UserHandler>,
    expn_enabled: bool,
    list_handler: Arc<dyn MailingListHandler>,
    implicit_tls: bool,
}

impl Default for SmtpConfigBuilder {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            tls_context: None,
            banner: String::new(),
            timeouts: SmtpServerTimeouts::default(),
            interceptor: Arc::new(NoopInterceptor),
            event_hook: Arc::new(NoopEventHook),
            processor: Arc::new(NoopTransactionProcessor),
            auth_service: Arc::new(DisabledAuthService),
            auth_rate_limiter: Arc::new(LocalAuthRateLimiter::default()),
            connection_rate_limiter: Arc::new(LocalConnectionRateLimiter::default()),
            trusted_proxies: Vec::new(),
            vrfy_enabled: false,
            user_handler: Arc::new(NoopUserHandler),
            expn_enabled: false,
            list_handler: Arc::new(NoopMailingListHandler),
            implicit_tls: false,
        }
    }
}

impl SmtpConfigBuilder {
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<Extension>) -> Self {
        self.extensions = extensions;
        self
    }

    #[must_use]
    pub fn with_tls_context(mut self, tls_context: Option<TlsContext>) -> Self {
        self.tls_context = tls_context;
        self
    }

    #[must_use]
    pub fn with_banner(mut self, banner: String) -> Self {
        self.banner = banner;
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: SmtpServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    #[must_use]
    pub fn with_event_hook(mut self, event_hook: Arc<dyn EventHook>) -> Self {
        self.event_hook = event_hook;
        self
    }

    #[must_use]
    pub fn with_transaction_processor(mut self, processor: Arc<dyn TransactionProcessor>) -> Self {
        self.processor = processor;
        self
    }

    #[must_use]
    pub fn with_auth_service(mut self, auth_service: Arc<dyn AuthService>) -> Self {
        self.auth_service = auth_service;
        self
    }

    #[must_use]
    pub fn with_auth_rate_limiter(mut self, auth_rate_limiter: Arc<dyn AuthRateLimiter>) -> Self {
        self.auth_rate_limiter = auth_rate_limiter;
        self
    }

    #[must_use]
    pub fn with_connection_rate_limiter(
        mut self,
        connection_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    ) -> Self {
        self.connection_rate_limiter = connection_rate_limiter;
        self
    }

    #[must_use]
    pub fn with_trusted_proxies(mut self, trusted_proxies: Vec<ipnet::IpNet>) -> Self {
        self.trusted_proxies = trusted_proxies;
        self
    }

    #[must_use]
    pub const fn with_vrfy_enabled(mut self, vrfy_enabled: bool) -> Self {
        self.vrfy_enabled = vrfy_enabled;
        self
    }

    #[must_use]
    pub fn with_user_handler(mut self, user_handler: Arc<dyn UserHandler>) -> Self {
        self.user_handler = user_handler;
        self
    }

    #[must_use]
    pub const fn with_expn_enabled(mut self, expn_enabled: bool) -> Self {
        self.expn_enabled = expn_enabled;
        self
    }

    #[must_use]
    pub fn with_list_handler(mut self, list_handler: Arc<dyn MailingListHandler>) -> Self {
        self.list_handler = list_handler;
        self
    }

    #[must_use]
    pub const fn with_implicit_tls(mut self, implicit_tls: bool) -> Self {
        self.implicit_tls = implicit_tls;
        self
    }

    #[must_use]
    pub fn build(self) -> SmtpConfig {
        SmtpConfig {
            extensions: self.extensions,
            tls_context: self.tls_context,
            banner: self.banner,
            timeouts: self.timeouts,
            interceptor: self.interceptor,
            event_hook: self.event_hook,
            processor: self.processor,
            auth_service: self.auth_service,
            auth_rate_limiter: self.auth_rate_limiter,
            connection_rate_limiter: self.connection_rate_limiter,
            trusted_proxies: self.trusted_proxies,
            vrfy_enabled: self.vrfy_enabled,
            user_handler: self.user_handler,
            expn_enabled: self.expn_enabled,
            list_handler: self.list_handler,
            implicit_tls: self.implicit_tls,
        }
    }
}
