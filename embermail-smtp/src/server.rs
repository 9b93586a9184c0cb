//! Runs a fixed set of [`Listener`]s side by side until a shutdown signal
//! arrives.

use embermail_common::Signal;
use embermail_tracing::traced;

use crate::listener::Listener;

#[derive(Default)]
pub struct Server {
    listeners: Vec<Listener>,
}

impl Server {
    #[must_use]
    pub fn new(listeners: Vec<Listener>) -> Self {
        Self { listeners }
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "us"))]
    pub async fn serve(
        &self,
        shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> anyhow::Result<()> {
        futures_util::future::join_all(
            self.listeners
                .iter()
                .map(|l| l.serve(shutdown.resubscribe())),
        )
        .await;

        Ok(())
    }
}
