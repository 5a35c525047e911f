//! Finger protocol handling for one accepted connection
//!
//! NIST 800-53 Controls:
//! - AC-3: Access Enforcement (no enumeration of local users)
//! - SC-5: Denial of Service Protection (request cap, read/write deadlines)
//! - SI-10: Information Input Validation
//!
//! Nothing a remote client does is logged above info level.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tracing::{Instrument, debug, info, info_span};
use uuid::Uuid;

use crate::accounts::SystemAccounts;
use crate::aliases::AliasStore;
use crate::audit::AuditLogger;
use crate::config::FingerConfig;
use crate::file_server::FileServer;
use crate::resolver::{UserRecord, UserResolver};
use crate::response::{LineEnding, ResponseWriter};

/// Hard cap on the request line, terminator included
pub const MAX_REQUEST_OCTETS: usize = 500;

pub const LISTING_DENIED: &str = "Local user listing denied.";
pub const LONG_LISTING_DENIED: &str = "Local user long listing denied.";

const LONG_FLAGS: [&str; 2] = ["/W", "/w"];

/// Shared, read-only state handed to every connection
#[derive(Clone)]
pub struct FingerContext {
    pub resolver: UserResolver,
    pub file_server: FileServer,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl FingerContext {
    pub fn from_config(config: &FingerConfig, aliases: Arc<AliasStore>) -> Self {
        let mut resolver = UserResolver::new(aliases).with_homes_dir(config.homes_dir.clone());
        if config.min_account_uid != 0 {
            resolver = resolver.with_accounts(Arc::new(SystemAccounts), config.min_account_uid);
        }
        Self {
            resolver,
            file_server: FileServer::new(config.file_size_limit_bytes),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub accepted_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            local,
            accepted_at: Utc::now(),
        }
    }
}

/// A parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Unusable input; answered with silence
    Malformed(&'static str),
    /// Empty line: a request to enumerate local users
    ListAll { line_ending: LineEnding },
    Query {
        line_ending: LineEnding,
        long: bool,
        users: Vec<String>,
        /// Request text without its terminator
        text: String,
    },
}

/// Parse the bytes read for one request (at most one line, terminator included).
pub fn parse_request(input: &[u8]) -> Request {
    if input.is_empty() {
        return Request::Malformed("read empty non-line");
    }
    let Some(body) = input.strip_suffix(b"\n") else {
        return Request::Malformed("unterminated request, perhaps over-long line");
    };
    let (body, line_ending) = match body.strip_suffix(b"\r") {
        Some(body) => (body, LineEnding::Crlf),
        None => (body, LineEnding::Lf),
    };
    if body.is_empty() {
        return Request::ListAll { line_ending };
    }

    let text = String::from_utf8_lossy(body).into_owned();
    let mut long = false;
    let mut users = Vec::new();
    for token in text.split_whitespace() {
        if LONG_FLAGS.contains(&token) {
            long = true;
        } else {
            users.push(token.to_string());
        }
    }
    Request::Query {
        line_ending,
        long,
        users,
        text,
    }
}

/// Serve one connection to completion. Returns the bytes written.
pub async fn handle_connection<S>(stream: S, ctx: Arc<FingerContext>, info: ConnectionInfo) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let span = info_span!(
        "connection",
        id = %info.id,
        remote = %info.remote,
        local = %info.local,
        accepted_at = %info.accepted_at.to_rfc3339(),
    );
    async move {
        debug!("accepted connection");
        let written = serve(stream, &ctx, &info).await;
        info!(written, "connection closed");
        written
    }
    .instrument(span)
    .await
}

async fn serve<S>(mut stream: S, ctx: &FingerContext, info: &ConnectionInfo) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut input = Vec::with_capacity(MAX_REQUEST_OCTETS + 1);
    let read = {
        let capped = (&mut stream).take(MAX_REQUEST_OCTETS as u64);
        let mut reader = BufReader::with_capacity(MAX_REQUEST_OCTETS + 1, capped);
        tokio::time::timeout(ctx.read_timeout, reader.read_until(b'\n', &mut input)).await
    };
    match read {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            info!(error = %e, "error reading request, aborting");
            return 0;
        }
        Err(_) => {
            info!("timed out reading request, aborting");
            AuditLogger::protocol_violation(info.remote, "request read timeout");
            return 0;
        }
    }

    let (line_ending, long, users, text) = match parse_request(&input) {
        Request::Malformed(reason) => {
            info!("{}, aborting", reason);
            AuditLogger::protocol_violation(info.remote, reason);
            return 0;
        }
        Request::ListAll { line_ending } => {
            info!("request to list local users, denying");
            AuditLogger::listing_denied(info.remote, false);
            let mut out = ResponseWriter::new(stream, line_ending, ctx.write_timeout);
            out.send_line(LISTING_DENIED).await;
            out.shutdown().await;
            return out.written();
        }
        Request::Query {
            line_ending,
            long,
            users,
            text,
        } => (line_ending, long, users, text),
    };
    info!(request = %text, long, "received");

    let mut out = ResponseWriter::new(stream, line_ending, ctx.write_timeout);
    if users.is_empty() {
        if long {
            info!("request to LONG list local users, denying");
            AuditLogger::listing_denied(info.remote, true);
            out.send_line(LONG_LISTING_DENIED).await;
        } else {
            info!("discarding strange request");
            AuditLogger::protocol_violation(info.remote, "request contains only whitespace");
        }
        out.shutdown().await;
        return out.written();
    }

    for (index, user) in users.iter().enumerate() {
        if index > 0 {
            out.send_line("").await;
        }
        process_user(&mut out, ctx, user, info.remote)
            .instrument(info_span!("user", username = %user))
            .await;
        if out.has_write_error() {
            info!("write error, abandoning remaining users");
            break;
        }
    }
    out.shutdown().await;
    out.written()
}

async fn process_user<W: AsyncWrite + Unpin>(
    out: &mut ResponseWriter<W>,
    ctx: &FingerContext,
    username: &str,
    remote: SocketAddr,
) {
    let no_such_user = format!("{username:?}: no such user");

    let resolver = ctx.resolver.clone();
    let name = username.to_string();
    let record = match tokio::task::spawn_blocking(move || resolver.resolve(&name)).await {
        Ok(record) => record,
        Err(e) => {
            info!(error = %e, "resolver task failed");
            None
        }
    };
    let Some(record) = record else {
        info!("unknown user");
        AuditLogger::unknown_user(remote, username);
        out.send_line(&no_such_user).await;
        return;
    };

    if let Some(ref static_file) = record.static_file {
        ctx.file_server.serve(out, static_file, None, 0).await;
        return;
    }
    let Some(ref home) = record.home_dir else {
        out.send_line(&no_such_user).await;
        return;
    };

    if probe(home, ".nofinger").await.is_some() {
        info!("user denies existence (.nofinger)");
        AuditLogger::unknown_user(remote, username);
        out.send_line(&no_such_user).await;
        return;
    }

    let project = probe(home, ".project").await;
    let plan = probe(home, ".plan").await;
    let pubkey = probe(home, ".pubkey").await;
    if project.is_none() && plan.is_none() && pubkey.is_none() {
        info!("user missing finger files, denying existence");
        AuditLogger::unknown_user(remote, username);
        out.send_line(&no_such_user).await;
        return;
    }

    out.send_line(&format!("User: {username}")).await;
    if out.has_write_error() {
        return;
    }

    if is_servable(project.as_ref(), &record) {
        ctx.file_server
            .serve(out, &home.join(".project"), Some("Project"), record.uid)
            .await;
        if out.has_write_error() {
            return;
        }
    }
    if is_servable(plan.as_ref(), &record) {
        ctx.file_server
            .serve(out, &home.join(".plan"), Some("Plan"), record.uid)
            .await;
    } else {
        out.send_line("No Plan.").await;
    }
    if out.has_write_error() {
        return;
    }
    if is_servable(pubkey.as_ref(), &record) {
        ctx.file_server
            .serve(out, &home.join(".pubkey"), Some("Public key"), record.uid)
            .await;
    }
}

/// Stat a file in the home directory, following symlinks. Any failure reads as absent.
async fn probe(home: &Path, name: &str) -> Option<std::fs::Metadata> {
    match tokio::fs::metadata(home.join(name)).await {
        Ok(meta) => Some(meta),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            None
        }
        Err(e) => {
            info!(filename = name, error = %e, "unusual stat failure");
            None
        }
    }
}

/// Probe-time gate; the file server re-checks all of this on the open file.
fn is_servable(meta: Option<&std::fs::Metadata>, record: &UserRecord) -> bool {
    let Some(meta) = meta else {
        return false;
    };
    meta.len() > 0 && meta.is_file() && (meta.uid() == 0 || meta.uid() == record.uid)
}
