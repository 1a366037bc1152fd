//! Line oriented I/O on a client connection.

use std::{fmt::Display, io, time::Duration};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use super::status::Status;

/// Longest accepted command line, CRLF included.
pub const MAX_LINE_LENGTH: usize = 1000;

/// Chunk size when reading message data.
const DATA_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("line exceeds {} octets", MAX_LINE_LENGTH)]
    LineTooLong,

    #[error("connection closed")]
    Closed,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

async fn within<T>(
    timeout: Duration,
    operation: impl Future<Output = io::Result<T>>,
) -> Result<T, ConnectionError> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| ConnectionError::Timeout(timeout))?
        .map_err(ConnectionError::from)
}

pub struct Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    stream: BufStream<Stream>,
    timeout: Duration,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    /// Every individual read and write is bounded by `timeout`.
    pub fn new(stream: Stream, timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            timeout,
        }
    }

    pub(crate) async fn send<S: Display + Send + Sync>(&mut self, response: &S) -> Result<(), ConnectionError> {
        self.write(format!("{response}\r\n")).await
    }

    /// `250-first`, `250-second`, ..., `250 last`.
    pub(crate) async fn send_multiline<S: Display>(&mut self, status: Status, lines: &[S]) -> Result<(), ConnectionError> {
        let reply = lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let separator = if index + 1 == lines.len() { ' ' } else { '-' };
                format!("{status}{separator}{line}\r\n")
            })
            .collect::<String>();

        self.write(reply).await
    }

    async fn write(&mut self, data: String) -> Result<(), ConnectionError> {
        let stream = &mut self.stream;

        within(self.timeout, async move {
            stream.write_all(data.as_bytes()).await?;
            stream.flush().await
        })
        .await
    }

    /// Read one command line without its terminator. `None` at end of stream.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::LineTooLong`] once the oversized line has been
    /// discarded, so the connection stays usable.
    pub(crate) async fn receive(&mut self) -> Result<Option<String>, ConnectionError> {
        let mut line = Vec::new();
        let read = within(
            self.timeout,
            (&mut self.stream)
                .take(MAX_LINE_LENGTH as u64)
                .read_until(b'\n', &mut line),
        )
        .await?;

        if read == 0 {
            return Ok(None);
        }

        if !line.ends_with(b"\n") {
            if read < MAX_LINE_LENGTH {
                // The peer went away mid-line
                return Ok(None);
            }

            self.discard_line().await?;
            return Err(ConnectionError::LineTooLong);
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    async fn discard_line(&mut self) -> Result<(), ConnectionError> {
        let stream = &mut self.stream;

        within(self.timeout, async move {
            loop {
                let buffer = stream.fill_buf().await?;
                if buffer.is_empty() {
                    return Ok(());
                }

                if let Some(end) = buffer.iter().position(|byte| *byte == b'\n') {
                    stream.consume(end + 1);
                    return Ok(());
                }

                let length = buffer.len();
                stream.consume(length);
            }
        })
        .await
    }

    /// Read message data up to the lone `.` line, undoing dot-stuffing.
    ///
    /// At most `max + 1` bytes are kept; anything beyond is read and dropped
    /// so the client's next command is still found.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] if the stream ends before the terminator.
    pub(crate) async fn receive_data(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
        let cap = max.saturating_add(1);
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut line_start = true;

        loop {
            line.clear();

            let read = within(
                self.timeout,
                (&mut self.stream).take(DATA_CHUNK).read_until(b'\n', &mut line),
            )
            .await?;
            if read == 0 {
                return Err(ConnectionError::Closed);
            }

            let mut piece = line.as_slice();
            if line_start {
                if piece == b".\r\n" || piece == b".\n" {
                    return Ok(data);
                }
                if piece.first() == Some(&b'.') {
                    piece = &piece[1..];
                }
            }
            line_start = line.ends_with(b"\n");

            let room = cap.saturating_sub(data.len());
            data.extend_from_slice(&piece[..piece.len().min(room)]);
        }
    }
}
