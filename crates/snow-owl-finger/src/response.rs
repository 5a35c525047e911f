//! Per-connection response writer
//!
//! Owns the write half of a connection together with its negotiated line
//! ending, its byte counter and its sticky write-error flag. Once a write
//! fails or times out nothing more is sent on the connection.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    Crlf,
    Lf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Crlf => b"\r\n",
            LineEnding::Lf => b"\n",
        }
    }
}

pub struct ResponseWriter<W> {
    inner: W,
    line_ending: LineEnding,
    write_timeout: Duration,
    written: u64,
    write_error: bool,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub fn new(inner: W, line_ending: LineEnding, write_timeout: Duration) -> Self {
        Self {
            inner,
            line_ending,
            write_timeout,
            written: 0,
            write_error: false,
        }
    }

    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn has_write_error(&self) -> bool {
        self.write_error
    }

    /// Send one terminated line under its own write deadline.
    pub async fn send_line(&mut self, line: &str) -> u64 {
        let eol = self.line_ending.as_bytes();
        let mut buf = BytesMut::with_capacity(line.len() + eol.len());
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(eol);
        let deadline = Instant::now() + self.write_timeout;
        self.write_before(&buf, deadline).await
    }

    /// Deadline for one whole file transfer
    pub fn file_deadline(&self) -> Instant {
        Instant::now() + self.write_timeout
    }

    /// Write `data` completely before `deadline`. Returns the bytes written,
    /// which is 0 once the connection has seen a write error.
    pub async fn write_before(&mut self, data: &[u8], deadline: Instant) -> u64 {
        if self.write_error {
            return 0;
        }
        let result = timeout_at(deadline, async {
            self.inner.write_all(data).await?;
            self.inner.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => {
                let n = data.len() as u64;
                self.written += n;
                n
            }
            Ok(Err(e)) => {
                debug!(error = %e, "write failed");
                self.write_error = true;
                0
            }
            Err(_) => {
                debug!("write deadline exceeded");
                self.write_error = true;
                0
            }
        }
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!(error = %e, "shutdown after response failed");
        }
    }
}
