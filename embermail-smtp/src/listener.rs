//! Accepts connections on a single bound socket, applies connection-level
//! admission control (PROXY protocol unwrapping, per-IP connection caps),
//! and spawns a [`Session`] per accepted stream.

use std::{net::SocketAddr, sync::Arc};

use embermail_common::{internal, tracing, Signal};
use embermail_tracing::traced;
use futures_util::future::join_all;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
};

use crate::{proxy, session::Session, SmtpConfig};

/// The stream type every accepted connection is wrapped in before a
/// [`Session`] takes ownership of it. Buffering lets the listener peek a
/// leading PROXY protocol line without losing any bytes the client pipelined
/// immediately after it.
pub type ListenerStream = BufReader<TcpStream>;

/// A bound SMTP socket serving connections under a single [`SmtpConfig`].
pub struct Listener {
    socket: SocketAddr,
    config: Arc<SmtpConfig>,
}

impl Listener {
    #[must_use]
    pub fn new(socket: SocketAddr, config: SmtpConfig) -> Self {
        Self {
            socket,
            config: Arc::new(config),
        }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err))]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        internal!("Serving {:?}", self.socket);
        let mut sessions = Vec::new();

        let listener = TcpListener::bind(self.socket).await?;

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "SMTP listener {} received shutdown signal, finishing sessions ...", self.socket);
                        join_all(sessions).await;
                        break;
                    }
                }

                accepted = listener.accept() => {
                    let (stream, raw_peer) = accepted?;
                    tracing::debug!(peer = %raw_peer, listener = %self.socket, "connection received");

                    if !self.config.connection_rate_limiter.admit_connection(raw_peer.ip()).await {
                        tracing::warn!(peer = %raw_peer, "connection rejected: per-IP connection cap reached");
                        continue;
                    }

                    let config = self.config.clone();
                    sessions.push(tokio::spawn(async move {
                        let result = Self::run_one(stream, raw_peer, &config, shutdown.resubscribe()).await;
                        config.connection_rate_limiter.release_connection(raw_peer.ip()).await;
                        if let Err(err) = result {
                            internal!(level = ERROR, "session error for {raw_peer}: {err}");
                        }
                    }));
                }
            }
        }

        Ok(())
    }

    async fn run_one(
        stream: TcpStream,
        raw_peer: SocketAddr,
        config: &SmtpConfig,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        let mut buffered = BufReader::new(stream);
        let peer = if proxy::is_trusted(raw_peer.ip(), &config.trusted_proxies) {
            let mut header = String::new();
            buffered.read_line(&mut header).await?;
            let header = header.trim_end_matches(['\r', '\n']);
            match proxy::parse(header) {
                Ok(proxied) => proxied.source,
                Err(err) => {
                    tracing::warn!(peer = %raw_peer, error = %err, "rejecting connection with malformed PROXY header");
                    return Ok(());
                }
            }
        } else {
            raw_peer
        };

        let session = Session::create(buffered, peer, config.session_config());
        session.run(shutdown).await.map_err(Into::into)
    }
}
