use embermail_common::{error::SessionError, status::Status, tracing};
use embermail_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{command::AuthMechanism, error::CommandError, extensions::Extension};

use super::Session;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(super) async fn send_line(
        &mut self,
        status: Status,
        message: impl core::fmt::Display,
    ) -> Result<(), SessionError> {
        let line = format!("{status} {message}");
        embermail_common::outgoing!("{line}");
        self.framer_mut()
            .connection_mut()
            .send(&line)
            .await
            .map_err(|e| SessionError::Protocol(format!("failed to send response: {e}")))?;
        Ok(())
    }

    /// Sends a multiline SMTP response, using `-` continuation markers on
    /// every line but the last.
    pub(super) async fn send_multiline(
        &mut self,
        status: Status,
        lines: &[String],
    ) -> Result<(), SessionError> {
        let Some((last, rest)) = lines.split_last() else {
            return self.send_line(status, "").await;
        };
        for line in rest {
            let text = format!("{status}-{line}");
            embermail_common::outgoing!("{text}");
            self.framer_mut()
                .connection_mut()
                .send(&text)
                .await
                .map_err(|e| SessionError::Protocol(format!("failed to send response: {e}")))?;
        }
        self.send_line(status, last).await
    }

    /// Sends the wire response for a `CommandError` and reports whether the
    /// connection must now close.
    pub(super) async fn send_error(&mut self, err: CommandError) -> Result<bool, SessionError> {
        let message = match &err.enhanced {
            Some(enhanced) => format!("{enhanced} {}", err.message),
            None => err.message.clone(),
        };
        self.send_line(err.status, message).await?;
        Ok(err.close)
    }

    pub(super) async fn send_greeting(&mut self) -> Result<(), SessionError> {
        let banner = self.banner.clone();
        self.send_line(Status::ServiceReady, &*banner).await
    }

    /// Renders the EHLO capability response: a greeting line followed by
    /// one line per advertised extension, conditional ones filtered by
    /// current session state (STARTTLS hidden once already active, AUTH
    /// hidden until TLS is active).
    pub(super) async fn send_ehlo_response(&mut self, client_id: &str) -> Result<(), SessionError> {
        let banner = self.banner.clone();
        let mut lines = vec![format!("{banner} Hello {client_id}")];

        for extension in &self.extensions {
            match extension {
                Extension::Starttls(_) if self.ctx.tls_active => {}
                Extension::Auth(_) if !self.ctx.tls_active => {}
                other => lines.push(other.to_string()),
            }
        }

        self.send_multiline(Status::Ok, &lines).await
    }

    pub(super) async fn send_helo_response(&mut self, client_id: &str) -> Result<(), SessionError> {
        let banner = self.banner.clone();
        self.send_line(Status::Ok, format!("{banner} Hello {client_id}"))
            .await
    }

    pub(super) async fn send_auth_challenge(&mut self, text: &str) -> Result<(), SessionError> {
        self.send_line(Status::AuthContinue, text).await
    }

    pub(super) fn advertises_mechanism(&self, mechanism: AuthMechanism) -> bool {
        self.extensions.iter().any(|ext| {
            matches!(ext, Extension::Auth(mechanisms) if mechanisms.contains(&mechanism))
        })
    }
}
