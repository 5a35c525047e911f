//! Finger server lifecycle
//!
//! NIST 800-53 Controls:
//! - AU-3: Content of Audit Records (start and shutdown are audited)
//! - SC-5: Denial of Service Protection (bounded, cooperative shutdown)

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::audit::AuditLogger;
use crate::connection::FingerContext;
use crate::error::Result;
use crate::listener::ListenSocket;

/// A set of listening sockets plus the state their connections share
pub struct FingerServer {
    context: Arc<FingerContext>,
    sockets: Vec<ListenSocket>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl FingerServer {
    pub fn new(context: FingerContext, sockets: Vec<ListenSocket>) -> Self {
        Self {
            context: Arc::new(context),
            sockets,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Cancelling this token stops every accept loop. Connections already
    /// accepted run to completion.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().map(ListenSocket::local_addr).collect()
    }

    /// Serve until `signal` resolves (or the shutdown token is cancelled),
    /// then wait for every accept loop and connection to finish.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = String>,
    {
        let addrs = self.local_addrs();
        for socket in self.sockets {
            socket.spawn(
                Arc::clone(&self.context),
                self.shutdown.clone(),
                &self.tracker,
            )?;
        }
        info!(listeners = addrs.len(), version = env!("CARGO_PKG_VERSION"), "running");
        AuditLogger::server_started(&addrs);

        let reason = tokio::select! {
            reason = signal => {
                warn!(signal = %reason, "shutdown signal received");
                reason
            }
            _ = self.shutdown.cancelled() => "shutdown requested".to_string(),
        };

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        info!("all listeners and connections finished");
        AuditLogger::server_shutdown(&reason);
        Ok(())
    }
}
