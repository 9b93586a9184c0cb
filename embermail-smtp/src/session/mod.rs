//! The live per-connection session: owns the wire [`Framer`], the protocol
//! [`State`], and the business [`Context`], and drives both against the
//! SPI traits an embedder supplies through [`SessionConfig`].

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};

use embermail_common::{context::Context, internal, tracing, Signal};
use embermail_tracing::traced;
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    auth::{AuthRateLimiter, AuthService, DisabledAuthService, LocalAuthRateLimiter},
    connection::Connection,
    error::CommandError,
    extensions::Extension,
    framer::Framer,
    rate_limiter::{ConnectionRateLimiter, LocalConnectionRateLimiter},
    spi::{
        CommandInterceptor, EventHook, MailingListHandler, NoopEventHook, NoopInterceptor,
        NoopMailingListHandler, NoopUserHandler, UserHandler,
    },
    state::State,
    transaction_handler::{NoopTransactionProcessor, TransactionProcessor},
    SmtpServerTimeouts,
};

mod events;
mod io;
mod response;

/// Certificate/key pair backing a listener's STARTTLS upgrade.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Everything a [`Session`] needs that the embedder controls: advertised
/// capabilities, TLS material, and the SPI collaborators. Anything left
/// unset falls back to a harmless no-op implementation.
pub struct SessionConfig {
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
    /// Whether VRFY resolves through `user_handler` instead of returning the
    /// non-enumerating default response. Either way VRFY requires auth.
    pub vrfy_enabled: bool,
    pub user_handler: Arc<dyn UserHandler>,
    /// Whether EXPN resolves through `list_handler` instead of returning
    /// `502 Not implemented`. Either way EXPN requires auth.
    pub expn_enabled: bool,
    pub list_handler: Arc<dyn MailingListHandler>,
    /// The TLS handshake is performed immediately on accept, before the
    /// greeting, rather than offered as a later STARTTLS upgrade. Requires
    /// `tls_context` to be set.
    pub implicit_tls: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

pub struct SessionConfigBuilder {
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
    vrfy_enabled: bool,
    user_handler: Arc<dyn UserHandler>,
    expn_enabled: bool,
    list_handler: Arc<dyn MailingListHandler>,
    implicit_tls: bool,
}

impl Default for SessionConfigBuilder {
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
            vrfy_enabled: false,
            user_handler: Arc::new(NoopUserHandler),
            expn_enabled: false,
            list_handler: Arc::new(NoopMailingListHandler),
            implicit_tls: false,
        }
    }
}

impl SessionConfigBuilder {
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
    pub fn build(self) -> SessionConfig {
        SessionConfig {
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
            vrfy_enabled: self.vrfy_enabled,
            user_handler: self.user_handler,
            expn_enabled: self.expn_enabled,
            list_handler: self.list_handler,
            implicit_tls: self.implicit_tls,
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    peer: SocketAddr,
    framer: Option<Framer<Stream>>,
    state: State,
    ctx: Context,
    banner: Arc<str>,
    tls_context: Option<TlsContext>,
    /// Maximum message size in bytes as advertised via SIZE (RFC 1870). Zero
    /// means no limit is enforced.
    max_message_size: usize,
    timeouts: SmtpServerTimeouts,
    start_time: Instant,
    /// Set after a successful STARTTLS upgrade; cleared by the next
    /// successful EHLO/HELO. The FSM itself does not forbid resuming a mail
    /// transaction without a fresh greeting post-upgrade, so this is
    /// enforced as an additional session-level policy.
    greet_required: bool,
    extensions: Vec<Extension>,
    interceptor: Arc<dyn CommandInterceptor>,
    event_hook: Arc<dyn EventHook>,
    processor: Arc<dyn TransactionProcessor>,
    auth_service: Arc<dyn AuthService>,
    auth_rate_limiter: Arc<dyn AuthRateLimiter>,
    connection_rate_limiter: Arc<dyn ConnectionRateLimiter>,
    vrfy_enabled: bool,
    user_handler: Arc<dyn UserHandler>,
    expn_enabled: bool,
    list_handler: Arc<dyn MailingListHandler>,
    implicit_tls: bool,
    /// Channel feeding body bytes to the in-flight `TransactionProcessor`
    /// task; lives across multiple BDAT commands until the LAST chunk.
    body_tx: Option<mpsc::Sender<Vec<u8>>>,
    body_task: Option<JoinHandle<Result<(), CommandError>>>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(crate) fn create(stream: Stream, peer: SocketAddr, config: SessionConfig) -> Self {
        let max_message_size = config
            .extensions
            .iter()
            .find_map(|ext| match ext {
                Extension::Size(size) => Some(*size),
                _ => None,
            })
            .unwrap_or(0);

        let tls_context = config.tls_context;

        let connection = Connection::Plain {
            stream,
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
        };

        Self {
            peer,
            framer: Some(Framer::new(connection)),
            state: State::default(),
            ctx: Context {
                peer: Some(peer),
                ..Context::default()
            },
            banner: if config.banner.is_empty() {
                std::env::var("HOSTNAME")
                    .unwrap_or_else(|_| "localhost".to_string())
                    .into()
            } else {
                config.banner.into()
            },
            tls_context,
            max_message_size,
            timeouts: config.timeouts,
            start_time: Instant::now(),
            greet_required: false,
            extensions: config.extensions,
            interceptor: config.interceptor,
            event_hook: config.event_hook,
            processor: config.processor,
            auth_service: config.auth_service,
            auth_rate_limiter: config.auth_rate_limiter,
            connection_rate_limiter: config.connection_rate_limiter,
            vrfy_enabled: config.vrfy_enabled,
            user_handler: config.user_handler,
            expn_enabled: config.expn_enabled,
            list_handler: config.list_handler,
            implicit_tls: config.implicit_tls,
            body_tx: None,
            body_task: None,
        }
    }

    /// The RFC 5321 §4.5.3.2-derived timeout that applies to the current
    /// protocol phase.
    const fn timeout_secs(&self) -> u64 {
        match &self.state {
            State::Reading(_) => self.timeouts.data_block_secs,
            State::Data(_) | State::Bdat(_) => self.timeouts.data_init_secs,
            State::PostDot(_) => self.timeouts.data_termination_secs,
            _ => self.timeouts.command_secs,
        }
    }

    fn framer_mut(&mut self) -> &mut Framer<Stream> {
        self.framer
            .as_mut()
            .expect("framer is only ever taken during a STARTTLS upgrade, which restores it")
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(?peer = self.peer), ret), timing(precision = "us"))]
    pub(crate) async fn run(
        mut self,
        mut signal: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), embermail_common::error::SessionError> {
        use embermail_common::error::SessionError;

        internal!("Connected");

        if self.implicit_tls && !self.perform_implicit_handshake().await? {
            internal!("Connection closed");
            return Ok(());
        }

        self.event_hook.session_started(self.peer).await;

        self.send_greeting().await.map_err(|e| {
            SessionError::Protocol(format!("failed to send greeting: {e}"))
        })?;

        let result = self.run_inner(&mut signal).await;

        internal!("Connection closed");
        self.event_hook.session_ended(self.peer).await;

        result
    }

    /// Performs the accept-time TLS handshake implicit TLS listeners require
    /// before any greeting is sent. Returns `Ok(false)` if the handshake
    /// failed or timed out, in which case the connection is closed silently.
    async fn perform_implicit_handshake(&mut self) -> Result<bool, embermail_common::error::SessionError> {
        let Some(tls_context) = self.tls_context.clone() else {
            return Err(embermail_common::error::SessionError::Protocol(
                "implicit TLS enabled without TLS material configured".to_string(),
            ));
        };

        let connection = self
            .framer
            .take()
            .expect("framer is present before the implicit handshake runs")
            .into_connection();

        let handshake = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeouts.command_secs),
            connection.upgrade(&tls_context),
        )
        .await;

        let (upgraded, tls_info) = match handshake {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                tracing::warn!(peer = ?self.peer, error = %err, "implicit TLS handshake failed");
                return Ok(false);
            }
            Err(_) => {
                tracing::warn!(peer = ?self.peer, "implicit TLS handshake timed out");
                return Ok(false);
            }
        };

        self.framer = Some(Framer::new(upgraded));
        self.ctx.tls_active = true;
        self.ctx
            .metadata
            .insert("tls.protocol".to_string(), tls_info.proto());
        self.ctx.metadata.insert("tls.cipher".to_string(), tls_info.cipher());
        Ok(true)
    }

    async fn run_inner(
        &mut self,
        signal: &mut tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), embermail_common::error::SessionError> {
        use embermail_common::error::SessionError;

        loop {
            let elapsed = self.start_time.elapsed();
            let max_duration = std::time::Duration::from_secs(self.timeouts.connection_secs);
            if elapsed >= max_duration {
                tracing::warn!(peer = ?self.peer, "connection exceeded maximum lifetime");
                let _ = self.send_error(CommandError::new(
                    embermail_common::status::Status::Unavailable,
                    "connection lifetime exceeded",
                )).await;
                return Err(SessionError::Timeout(self.timeouts.connection_secs));
            }

            let timeout_duration = std::time::Duration::from_secs(self.timeout_secs());

            tokio::select! {
                sig = signal.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        let _ = self.send_error(CommandError::new(
                            embermail_common::status::Status::Unavailable,
                            "server shutting down",
                        ).closing()).await;
                    }
                    return Ok(());
                }
                outcome = tokio::time::timeout(timeout_duration, self.step()) => {
                    match outcome {
                        Ok(Ok(true)) => return Ok(()),
                        Ok(Ok(false)) => {}
                        Ok(Err(err)) => return Err(err),
                        Err(_) => {
                            tracing::warn!(peer = ?self.peer, state = ?self.state, "client timed out");
                            return Err(SessionError::Timeout(self.timeout_secs()));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod test {
    use std::io::Cursor;

    use super::{Session, SessionConfig};

    #[tokio::test]
    async fn greets_with_configured_banner() {
        let banner = "testing";
        let cursor = Cursor::<Vec<u8>>::default();

        let mut session = Session::create(
            cursor,
            "127.0.0.1:25".parse().unwrap(),
            SessionConfig::builder().with_banner(banner.to_string()).build(),
        );

        session.send_greeting().await.expect("greeting sends");
        assert_eq!(session.banner.as_ref(), banner);
    }

    #[tokio::test]
    async fn rejects_unknown_verb_without_crashing() {
        let mut cursor = Cursor::<Vec<u8>>::default();
        cursor.get_mut().extend_from_slice(b"FROBNICATE\r\n");

        let mut session = Session::create(
            cursor,
            "127.0.0.1:25".parse().unwrap(),
            SessionConfig::builder().with_banner("testing".to_string()).build(),
        );

        let closed = session.step().await.expect("step succeeds");
        assert!(!closed);
        assert!(matches!(session.state, crate::state::State::Invalid(_)) || matches!(session.state, crate::state::State::Connect(_)));
    }

    #[tokio::test]
    async fn helo_transitions_to_helo_state() {
        let mut cursor = Cursor::<Vec<u8>>::default();
        cursor.get_mut().extend_from_slice(b"HELO client.example.com\r\n");

        let mut session = Session::create(
            cursor,
            "127.0.0.1:25".parse().unwrap(),
            SessionConfig::builder().with_banner("testing".to_string()).build(),
        );

        let closed = session.step().await.expect("step succeeds");
        assert!(!closed);
        assert!(matches!(session.state, crate::state::State::Helo(_)));
    }
}
