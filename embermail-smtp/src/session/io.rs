use embermail_common::{error::SessionError, incoming, tracing};
use embermail_tracing::traced;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{command::Command, framer::Frame};

use super::Session;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Reads the next command line and dispatches it.
    ///
    /// Returns `Ok(true)` once the connection should close (QUIT, EOF, or a
    /// fatal error response), `Ok(false)` to keep looping.
    ///
    /// # Errors
    /// Returns `SessionError` on a frame-level I/O failure.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, ret), timing)]
    pub(super) async fn step(&mut self) -> Result<bool, SessionError> {
        let frame = self
            .framer_mut()
            .next_frame()
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))?;

        let line = match frame {
            Frame::Eof => return Ok(true),
            Frame::Line(line) => line,
            Frame::Bytes(_) => {
                // The framer only yields byte frames while a BDAT chunk read
                // is in progress, which is driven directly by the BDAT
                // handler rather than through step().
                return Err(SessionError::Protocol(
                    "unexpected byte frame outside chunk read".to_string(),
                ));
            }
        };

        let command = match Command::try_from(line.as_slice()) {
            Ok(command) | Err(command) => command,
        };

        incoming!("{command}");

        self.dispatch(command).await
    }
}
