//! Listening sockets, one per address family
//!
//! NIST 800-53 Controls:
//! - SC-7: Boundary Protection (explicit per-family binding, IPV6_V6ONLY)
//! - SC-5: Denial of Service Protection (accept errors never stop a listener)
//!
//! Sockets are created with `socket2` rather than through tokio so they can
//! exist before the runtime does: binding happens as root, the runtime only
//! starts after the identity change.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::FingerConfig;
use crate::connection::{ConnectionInfo, FingerContext, handle_connection};
use crate::error::{FingerError, Result};

const LISTEN_BACKLOG: i32 = 128;

/// Pause after a failed accept so a persistent error (EMFILE) cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Tcp4,
    Tcp6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Tcp4, AddressFamily::Tcp6];

    fn domain(self) -> Domain {
        match self {
            AddressFamily::Tcp4 => Domain::IPV4,
            AddressFamily::Tcp6 => Domain::IPV6,
        }
    }

    fn wildcard(self) -> IpAddr {
        match self {
            AddressFamily::Tcp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn matches(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::Tcp4, IpAddr::V4(_)) | (AddressFamily::Tcp6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Tcp4 => f.write_str("tcp4"),
            AddressFamily::Tcp6 => f.write_str("tcp6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = FingerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp4" => Ok(AddressFamily::Tcp4),
            "tcp6" => Ok(AddressFamily::Tcp6),
            other => Err(FingerError::Manifest(format!(
                "unknown address family {:?}",
                other
            ))),
        }
    }
}

/// A bound, listening TCP socket for one address family
#[derive(Debug)]
pub struct ListenSocket {
    family: AddressFamily,
    local_addr: SocketAddr,
    listener: std::net::TcpListener,
}

impl ListenSocket {
    /// Bind and listen. `addr` of `None` binds the family's wildcard address.
    pub fn bind(family: AddressFamily, addr: Option<IpAddr>, port: u16) -> Result<Self> {
        let ip = addr.unwrap_or_else(|| family.wildcard());
        if !family.matches(&ip) {
            return Err(FingerError::listener(
                family,
                format!("address {} is not in this family", ip),
            ));
        }
        let bind_addr = SocketAddr::new(ip, port);
        let to_listener_error = |e: std::io::Error| FingerError::listener(family, e.to_string());

        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))
            .map_err(to_listener_error)?;
        socket.set_reuse_address(true).map_err(to_listener_error)?;
        if family == AddressFamily::Tcp6 {
            // Linux accepts v4-mapped traffic on v6 sockets by default.
            socket.set_only_v6(true).map_err(to_listener_error)?;
        }
        socket
            .bind(&bind_addr.into())
            .map_err(|e| FingerError::listener(family, format!("bind {}: {}", bind_addr, e)))?;
        socket.listen(LISTEN_BACKLOG).map_err(to_listener_error)?;
        socket.set_nonblocking(true).map_err(to_listener_error)?;

        Self::from_socket(family, socket)
    }

    /// Adopt a listening socket inherited across exec.
    ///
    /// # Safety
    ///
    /// `fd` must not be owned by anything else in this process; ownership
    /// passes to the returned value.
    pub unsafe fn from_inherited(family: AddressFamily, fd: RawFd) -> Result<Self> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(FingerError::Manifest(format!(
                "inherited descriptor {} ({}) is not open",
                fd, family
            )));
        }
        // SAFETY: the descriptor is open and the caller hands us ownership.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let to_manifest_error =
            |e: std::io::Error| FingerError::Manifest(format!("descriptor {} ({}): {}", fd, family, e));

        if socket.r#type().map_err(to_manifest_error)? != Type::STREAM {
            return Err(FingerError::Manifest(format!(
                "descriptor {} is not a stream socket",
                fd
            )));
        }
        if socket.domain().map_err(to_manifest_error)? != family.domain() {
            return Err(FingerError::Manifest(format!(
                "descriptor {} is not a {} socket",
                fd, family
            )));
        }
        socket.set_cloexec(true).map_err(to_manifest_error)?;
        socket.set_nonblocking(true).map_err(to_manifest_error)?;

        Self::from_socket(family, socket)
    }

    fn from_socket(family: AddressFamily, socket: Socket) -> Result<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| FingerError::listener(family, e.to_string()))?
            .as_socket()
            .ok_or_else(|| FingerError::listener(family, "not an internet socket"))?;
        Ok(Self {
            family,
            local_addr,
            listener: socket.into(),
        })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Let the descriptor survive exec and return its number.
    pub fn clear_cloexec_for_exec(&self) -> Result<RawFd> {
        SockRef::from(&self.listener)
            .set_cloexec(false)
            .map_err(|e| FingerError::PrivilegeDrop(format!("clear FD_CLOEXEC ({}): {}", self.family, e)))?;
        Ok(self.listener.as_raw_fd())
    }

    /// Start the accept loop on the current runtime. The loop, and every
    /// connection it accepts, is tracked by `tracker`.
    pub fn spawn(
        self,
        ctx: Arc<FingerContext>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<()> {
        let family = self.family;
        let local_addr = self.local_addr;
        let listener = TcpListener::from_std(self.listener)
            .map_err(|e| FingerError::listener(family, e.to_string()))?;
        info!(family = %family, accept = %local_addr, "listening");
        tracker.spawn(accept_loop(
            listener,
            family,
            local_addr,
            ctx,
            shutdown,
            tracker.clone(),
        ));
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    family: AddressFamily,
    local_addr: SocketAddr,
    ctx: Arc<FingerContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let local = stream.local_addr().unwrap_or(local_addr);
                let ctx = Arc::clone(&ctx);
                tracker.spawn(async move {
                    handle_connection(stream, ctx, ConnectionInfo::new(remote, local)).await;
                });
            }
            Err(e) => {
                error!(family = %family, accept = %local_addr, "accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    drop(listener);
    info!(family = %family, accept = %local_addr, "closed listening socket");
}

/// Bind one socket per address family.
///
/// Losing one family is a warning (hosts without IPv6 exist); losing both
/// is fatal.
pub fn bind_all(config: &FingerConfig) -> Result<Vec<ListenSocket>> {
    let mut sockets = Vec::with_capacity(AddressFamily::ALL.len());
    for family in AddressFamily::ALL {
        if let Some(ip) = config.listen_addr
            && !family.matches(&ip)
        {
            debug!(family = %family, listen_addr = %ip, "listen address not in family, skipping");
            continue;
        }
        match ListenSocket::bind(family, config.listen_addr, config.port) {
            Ok(socket) => sockets.push(socket),
            Err(e) => warn!(family = %family, "failed to listen: {}", e),
        }
    }
    if sockets.is_empty() {
        return Err(FingerError::listener(
            "any",
            format!("no listeners bound on port {}", config.port),
        ));
    }
    Ok(sockets)
}
