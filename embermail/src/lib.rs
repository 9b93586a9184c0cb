#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Wires the protocol engine, spool, and delivery service into a single
//! running service from one [`config::Config`] value.

pub mod config;
pub mod hooks;
pub mod relay;

use std::{net::SocketAddr, sync::Arc};

use ahash::AHashSet;
use embermail_common::{domain::Domain, Signal};
use embermail_delivery::{
    rate_limiter::RateLimiter, routing::StaticRoutingPolicy, DeliveryService, FileMailboxStore,
    NullSentMessageStore, WorkerPool,
};
use embermail_smtp::{
    extensions::Extension,
    listener::Listener,
    rate_limiter::LocalConnectionRateLimiter,
    server::Server,
    session::TlsContext,
    spi::{NoopMailingListHandler, NoopUserHandler},
    transaction_handler::DefaultTransactionProcessor,
    SmtpConfig,
};
use tokio::sync::broadcast;

use crate::{
    config::{Config, ListenerConfig},
    hooks::{DeliveryTriggerHook, StaticAuthService, TableUserHandler},
    relay::DenyAllRelay,
};

/// A fully wired, not-yet-running instance: every listener's `SmtpConfig`
/// has been validated and the delivery worker pool is ready to claim spool
/// entries.
pub struct Embermail {
    server: Server,
    workers: Arc<WorkerPool>,
    shutdown: broadcast::Sender<Signal>,
}

impl Embermail {
    /// Validates `config` and wires every collaborator it describes: the
    /// spool backing store, the delivery service and its worker pool, and
    /// one [`SmtpConfig`]/[`Listener`] pair per configured port.
    ///
    /// # Errors
    /// Returns an error if the spool cannot be opened, a listener's TLS
    /// material is missing, or storage directories cannot be created.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.temp_dir).await?;
        tokio::fs::create_dir_all(&config.mailbox_dir).await?;

        let spool = config.spool.clone().into_backing_store().await?;

        let mut local_domains = AHashSet::default();
        for domain in &config.local_domains {
            local_domains.insert(Domain::new(domain.clone()));
        }
        let routing = Arc::new(StaticRoutingPolicy::new(local_domains));

        let mailboxes = Arc::new(FileMailboxStore::new(config.mailbox_dir.clone()));
        let relay = Arc::new(DenyAllRelay);
        let archive = Arc::new(NullSentMessageStore);
        let rate_limiter = Arc::new(RateLimiter::new(config.delivery.rate_limit.clone()));

        let delivery_service = Arc::new(DeliveryService::new(
            spool.clone(),
            routing,
            mailboxes,
            relay,
            archive,
            rate_limiter,
            config.delivery.retry.clone(),
            config.delivery.dsn.clone(),
        ));

        let workers = Arc::new(WorkerPool::new(
            spool.clone(),
            delivery_service,
            config.delivery.clone(),
        ));

        let event_hook = Arc::new(DeliveryTriggerHook::new(workers.clone()));
        let processor = Arc::new(DefaultTransactionProcessor::new(
            spool,
            config.local_domains.clone(),
            config.temp_dir.clone(),
        ));

        let trusted_proxies = config.trusted_proxies.clone();
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for listener_cfg in &config.listeners {
            let smtp_config = Self::build_listener_config(
                &config,
                listener_cfg,
                event_hook.clone(),
                processor.clone(),
                trusted_proxies.clone(),
            )?;
            let addr = SocketAddr::from(([0, 0, 0, 0], listener_cfg.port));
            listeners.push(Listener::new(addr, smtp_config));
        }

        let (shutdown, _) = broadcast::channel(4);

        Ok(Self {
            server: Server::new(listeners),
            workers,
            shutdown,
        })
    }

    fn build_listener_config(
        config: &Config,
        listener: &ListenerConfig,
        event_hook: Arc<DeliveryTriggerHook>,
        processor: Arc<DefaultTransactionProcessor>,
        trusted_proxies: Vec<ipnet::IpNet>,
    ) -> anyhow::Result<SmtpConfig> {
        let tls_context = match (&config.tls_certificate, &config.tls_key) {
            (Some(certificate), Some(key)) => Some(TlsContext {
                certificate: certificate.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        let mut extensions = Vec::new();
        if listener.enable_starttls {
            let Some(tls) = tls_context.clone() else {
                anyhow::bail!(
                    "listener on port {} enables STARTTLS but no TLS certificate/key is configured",
                    listener.port
                );
            };
            extensions.push(Extension::Starttls(tls));
        }
        if listener.enable_auth {
            extensions.push(Extension::Auth(vec![
                embermail_smtp::command::AuthMechanism::Plain,
                embermail_smtp::command::AuthMechanism::Login,
            ]));
        }
        if config.features.etrn {
            extensions.push(Extension::Etrn);
        }

        let auth_service = Arc::new(StaticAuthService::new(
            config.auth.users.clone(),
            listener.require_auth_for_mail,
        ));

        let user_handler: Arc<dyn embermail_smtp::spi::UserHandler> = if config.features.vrfy {
            Arc::new(TableUserHandler::new(config.auth.users.clone()))
        } else {
            Arc::new(NoopUserHandler)
        };

        let mut smtp_config = SmtpConfig::builder()
            .with_extensions(extensions)
            .with_tls_context(tls_context)
            .with_banner(format!("{} {}", config.hostname, listener.service_name))
            .with_event_hook(event_hook)
            .with_transaction_processor(processor)
            .with_auth_service(auth_service)
            .with_connection_rate_limiter(Arc::new(LocalConnectionRateLimiter::default()))
            .with_trusted_proxies(trusted_proxies)
            .with_implicit_tls(listener.implicit_tls)
            .with_vrfy_enabled(config.features.vrfy)
            .with_expn_enabled(config.features.expn)
            .with_list_handler(Arc::new(NoopMailingListHandler))
            .with_user_handler(user_handler)
            .build();

        smtp_config.validate()?;
        Ok(smtp_config)
    }

    /// Runs every listener and the delivery worker pool until a Ctrl+C (or
    /// SIGTERM on Unix) is observed, then drains in-flight sessions and
    /// in-flight delivery batches before returning.
    pub async fn run(self) -> anyhow::Result<()> {
        let server_shutdown = self.shutdown.subscribe();
        let worker_shutdown = self.shutdown.subscribe();
        let trigger = self.shutdown.clone();

        tokio::spawn(async move {
            let _ = shutdown_signal().await;
            let _ = trigger.send(Signal::Shutdown);
        });

        let (server_result, worker_result) = tokio::join!(
            self.server.serve(server_shutdown),
            self.workers.serve(worker_shutdown)
        );

        let _ = self.shutdown.send(Signal::Finalised);
        server_result?;
        worker_result?;
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
