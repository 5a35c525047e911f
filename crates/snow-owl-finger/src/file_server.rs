//! Serving plan, project and public key files
//!
//! NIST 800-53 Controls:
//! - AC-3: Access Enforcement (ownership must match the account)
//! - SC-5: Denial of Service Protection (size limit, write deadline)
//! - SI-11: Error Handling (failures degrade to absence, never to detail)
//!
//! Every check runs against the opened descriptor, so a file swapped after
//! the caller probed it is still caught. Content is read through a limit of
//! one byte past the size cap even after the size check, since a file may
//! grow after the stat or live on a filesystem that reports sizes wrongly.

use bytes::{BufMut, BytesMut};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::config::DEFAULT_FILE_SIZE_LIMIT;
use crate::response::ResponseWriter;

/// Column budget for putting the caption and content on one line
const INLINE_CAPTION_BUDGET: usize = 75;

#[derive(Debug, Clone, Copy)]
pub struct FileServer {
    size_limit: u64,
}

impl Default for FileServer {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_SIZE_LIMIT)
    }
}

impl FileServer {
    pub fn new(size_limit: u64) -> Self {
        Self { size_limit }
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Send `path` to the client, optionally under a caption.
    ///
    /// Returns the number of bytes written. Zero means the file was treated
    /// as absent: missing, unreadable, empty, oversize, not a regular file,
    /// or (when `expected_uid` is non-zero) owned by someone else.
    pub async fn serve<W: AsyncWrite + Unpin>(
        &self,
        out: &mut ResponseWriter<W>,
        path: &Path,
        caption: Option<&str>,
        expected_uid: u32,
    ) -> u64 {
        // Non-blocking open so a FIFO planted in place of the file cannot
        // stall the worker waiting for a writer.
        let mut file = match tokio::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                info!(file = %path.display(), "permission denied, pretending non-existent");
                return 0;
            }
            // A UNIX domain socket cannot be opened at all.
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                info!(file = %path.display(), "pretending non-existent because not a regular file");
                return 0;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "can't open to send");
                return send_oops(out, caption).await;
            }
        };

        let meta = match file.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "can't stat open file");
                return send_oops(out, caption).await;
            }
        };

        if meta.len() == 0 {
            info!(file = %path.display(), "pretending non-existent because file empty");
            return 0;
        }
        if meta.len() > self.size_limit {
            info!(
                file = %path.display(),
                size = meta.len(),
                limit = self.size_limit,
                "pretending non-existent because file too large"
            );
            AuditLogger::file_size_limit_exceeded(path, meta.len(), self.size_limit);
            return 0;
        }
        if !meta.file_type().is_file() {
            info!(file = %path.display(), "pretending non-existent because not a regular file");
            return 0;
        }
        if expected_uid != 0 && meta.uid() != expected_uid {
            warn!(
                event = "local_user_attack",
                file = %path.display(),
                owner = meta.uid(),
                expected = expected_uid,
                "LOCAL USER ATTACK; pretending non-existent because of file owner"
            );
            AuditLogger::ownership_violation(path, meta.uid(), expected_uid);
            return 0;
        }

        let mut content = Vec::with_capacity(meta.len() as usize);
        if let Err(e) = (&mut file)
            .take(self.size_limit + 1)
            .read_to_end(&mut content)
            .await
        {
            info!(file = %path.display(), error = %e, "error while reading");
            return send_oops(out, caption).await;
        }
        if content.len() as u64 > self.size_limit {
            info!(file = %path.display(), "file grew past the size limit while reading, truncating");
            content.truncate(self.size_limit as usize);
        }

        let eol = out.line_ending().as_bytes();
        let mut buf = BytesMut::with_capacity(content.len() + content.len() / 8 + 96);
        if let Some(caption) = caption {
            buf.put_slice(caption.as_bytes());
            buf.put_u8(b':');
            if fits_inline(caption, &content) {
                buf.put_u8(b' ');
            } else {
                buf.put_slice(eol);
            }
        }
        append_normalized(&mut buf, &content, eol);

        // One deadline covers the whole file.
        let deadline = out.file_deadline();
        let written = out.write_before(&buf, deadline).await;
        if out.has_write_error() {
            info!(file = %path.display(), "error returning file");
        }
        written
    }
}

async fn send_oops<W: AsyncWrite + Unpin>(out: &mut ResponseWriter<W>, caption: Option<&str>) -> u64 {
    match caption {
        Some(caption) => out.send_line(&format!("{caption}: oops")).await,
        None => out.send_line("oops").await,
    }
}

/// Short single-line content shares the caption line.
fn fits_inline(caption: &str, content: &[u8]) -> bool {
    let budget = INLINE_CAPTION_BUDGET.saturating_sub(caption.len() + 1);
    if content.len() >= budget {
        return false;
    }
    match content.iter().position(|&b| b == b'\n') {
        None => true,
        Some(index) => index == content.len() - 1,
    }
}

/// Re-terminate every line with `eol`, supplying a final terminator when
/// the content lacks one.
fn append_normalized(buf: &mut BytesMut, content: &[u8], eol: &[u8]) {
    let mut rest = content;
    while !rest.is_empty() {
        match rest.iter().position(|&b| b == b'\n') {
            Some(index) => {
                let line = &rest[..index];
                buf.put_slice(line.strip_suffix(b"\r").unwrap_or(line));
                rest = &rest[index + 1..];
            }
            None => {
                buf.put_slice(rest);
                rest = &[];
            }
        }
        buf.put_slice(eol);
    }
}
