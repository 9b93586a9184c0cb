//! Byte-stream framer sitting directly on top of [`Connection`].
//!
//! Two modes:
//! - **Line mode**: CRLF-delimited command lines, capped at
//!   [`DEFAULT_MAX_LINE_LEN`] bytes. A line that would exceed the cap is
//!   reported as [`FramerError::LineTooLong`] and the connection must close.
//! - **Byte mode**: exactly `n` bytes, used while consuming a BDAT chunk.
//!   The framer does not interpret chunk content at all — a line that looks
//!   like a command is still just body bytes.
//!
//! The framer never looks past what the mode calls for; switching modes is
//! the caller's job (the session flips to byte mode for the duration of a
//! BDAT chunk and back to line mode once it is consumed).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::Connection;

/// Default cap on a single command line, matching common MTA practice.
pub const DEFAULT_MAX_LINE_LEN: usize = 8192;

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("line exceeded {0} bytes without a terminator")]
    LineTooLong(usize),
    #[error("connection closed mid-frame")]
    Closed,
    #[error(transparent)]
    Connection(#[from] crate::error::ConnectionError),
}

/// A single frame produced by the framer.
#[derive(Debug)]
pub enum Frame {
    /// A complete CRLF-terminated line, without the terminator.
    Line(Vec<u8>),
    /// Exactly the requested number of bytes, for byte mode.
    Bytes(Vec<u8>),
    /// The peer closed the connection.
    Eof,
}

/// Framer operating mode.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Line,
    Bytes(usize),
}

pub struct Framer<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    connection: Connection<Stream>,
    mode: Mode,
    max_line_len: usize,
    pending: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Framer<Stream> {
    #[must_use]
    pub const fn new(connection: Connection<Stream>) -> Self {
        Self {
            connection,
            mode: Mode::Line,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            pending: Vec::new(),
        }
    }

    /// Switches to byte mode for exactly `n` bytes (a BDAT chunk).
    pub fn enter_byte_mode(&mut self, n: usize) {
        self.mode = Mode::Bytes(n);
    }

    /// Returns to line mode, used once a chunk has been fully consumed.
    pub fn enter_line_mode(&mut self) {
        self.mode = Mode::Line;
    }

    pub const fn connection(&self) -> &Connection<Stream> {
        &self.connection
    }

    pub const fn connection_mut(&mut self) -> &mut Connection<Stream> {
        &mut self.connection
    }

    pub fn into_connection(self) -> Connection<Stream> {
        self.connection
    }

    /// Whether bytes past the current frame boundary are already buffered.
    ///
    /// Used to detect command pipelining ahead of a STARTTLS response: a
    /// client that sends bytes before the handshake begins is trying to
    /// smuggle plaintext past the upgrade and must be rejected.
    pub fn has_buffered_input(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Reads and returns the next frame in the current mode.
    ///
    /// # Errors
    /// Returns [`FramerError`] on I/O failure or a line-mode overflow.
    pub async fn next_frame(&mut self) -> Result<Frame, FramerError> {
        match self.mode {
            Mode::Line => self.next_line().await,
            Mode::Bytes(n) => self.next_chunk(n).await,
        }
    }

    async fn fill(&mut self) -> Result<usize, FramerError> {
        let mut buf = [0u8; 8192];
        let n = self
            .connection
            .receive(&mut buf)
            .await
            .map_err(|e| FramerError::Connection(crate::error::ConnectionError::Receive(e.to_string())))?;
        if n > 0 {
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    async fn next_line(&mut self) -> Result<Frame, FramerError> {
        loop {
            if let Some(pos) = find_crlf(&self.pending) {
                let line = self.pending[..pos].to_vec();
                self.pending.drain(..=pos + 1);
                return Ok(Frame::Line(line));
            }

            if self.pending.len() > self.max_line_len {
                return Err(FramerError::LineTooLong(self.max_line_len));
            }

            if self.fill().await? == 0 {
                if self.pending.is_empty() {
                    return Ok(Frame::Eof);
                }
                return Err(FramerError::Closed);
            }
        }
    }

    async fn next_chunk(&mut self, n: usize) -> Result<Frame, FramerError> {
        while self.pending.len() < n {
            if self.fill().await? == 0 {
                return Err(FramerError::Closed);
            }
        }
        let chunk = self.pending[..n].to_vec();
        self.pending.drain(..n);
        Ok(Frame::Bytes(chunk))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
