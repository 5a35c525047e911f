//! Child reaping for when the daemon is the init of a PID namespace
//!
//! Nothing here spawns children, so anything reaped is unexpected. In an
//! isolated environment that is worth a log line.

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// True when this process must reap orphans
pub fn is_namespace_init() -> bool {
    std::process::id() == 1
}

/// Reap children on every SIGCHLD until the process exits.
pub async fn run() {
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(subsystem = "reaper", "unable to watch SIGCHLD: {}", e);
            return;
        }
    };
    info!(subsystem = "reaper", "reaping children");
    // Signals coalesce, so drain everything that is waitable each time.
    while sigchld.recv().await.is_some() {
        reap_all();
    }
}

fn reap_all() {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) => return,
            Ok(status) => log_status(status),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => return,
            Err(e) => {
                debug!(subsystem = "reaper", "waitpid: {}", e);
                return;
            }
        }
    }
}

fn log_status(status: WaitStatus) {
    match status {
        WaitStatus::Exited(pid, code) => {
            info!(subsystem = "reaper", pid = pid.as_raw(), exit_code = code, "child state")
        }
        WaitStatus::Signaled(pid, signal, core_dumped) => info!(
            subsystem = "reaper",
            pid = pid.as_raw(),
            died_signal = %signal,
            core_dumped,
            "child state"
        ),
        WaitStatus::Stopped(pid, signal) => {
            info!(subsystem = "reaper", pid = pid.as_raw(), stopped = %signal, "child state")
        }
        WaitStatus::Continued(pid) => {
            info!(subsystem = "reaper", pid = pid.as_raw(), continued = true, "child state")
        }
        other => debug!(subsystem = "reaper", "child state {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_init_under_test_harness() {
        assert!(!is_namespace_init());
    }

    #[test]
    fn test_reap_all_without_children_returns() {
        reap_all();
    }
}
