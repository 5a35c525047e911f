//! Privilege drop with listening-socket handoff
//!
//! NIST 800-53 Controls:
//! - AC-6: Least Privilege (serve as an unprivileged identity)
//! - AC-6(2): Non-privileged Access for Nonsecurity Functions
//! - CM-7: Least Functionality
//!
//! Port 79 needs root to bind. The sockets are bound first, then the
//! process switches identity and re-executes itself in place, passing the
//! bound descriptors to the next generation through an environment
//! variable. No fork: the daemon may be the init of a PID namespace and
//! must keep its pid.

use nix::unistd::{Gid, Uid, User};
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::fmt::Write as _;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;
use std::path::Path;
use tracing::{error, info, warn};

use crate::audit::AuditLogger;
use crate::error::{FingerError, Result};
use crate::listener::{AddressFamily, ListenSocket};

/// Environment variable carrying the descriptor manifest across exec
pub const MANIFEST_ENV_VAR: &str = "SNOW_OWL_FINGER_LISTEN_FDS";

/// Identity to run as after the drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTarget {
    pub uid: u32,
    pub gid: u32,
}

impl DropTarget {
    /// Parse `uid:gid` or an account name. Root is never an acceptable target.
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(numeric) = Self::parse_numeric(value) {
            return numeric;
        }
        match User::from_name(value) {
            Ok(Some(user)) => Self::checked(i64::from(user.uid.as_raw()), i64::from(user.gid.as_raw())),
            Ok(None) => Err(FingerError::Config(format!(
                "run_as_user {:?}: no such account",
                value
            ))),
            Err(e) => Err(FingerError::Config(format!(
                "run_as_user {:?}: account lookup failed: {}",
                value, e
            ))),
        }
    }

    /// Parse the numeric `uid:gid` form without touching the account
    /// database. `None` when `value` is not in that form.
    pub fn parse_numeric(value: &str) -> Option<Result<Self>> {
        let (uid, gid) = value.split_once(':')?;
        if !is_signed_decimal(uid) || !is_signed_decimal(gid) {
            return None;
        }
        let parsed = match (uid.parse::<i64>(), gid.parse::<i64>()) {
            (Ok(uid), Ok(gid)) => Self::checked(uid, gid),
            _ => Err(FingerError::Config(format!(
                "run_as_user {:?}: id out of range",
                value
            ))),
        };
        Some(parsed)
    }

    fn checked(uid: i64, gid: i64) -> Result<Self> {
        let uid = u32::try_from(uid)
            .map_err(|_| FingerError::Config(format!("run_as_user: invalid uid {}", uid)))?;
        let gid = u32::try_from(gid)
            .map_err(|_| FingerError::Config(format!("run_as_user: invalid gid {}", gid)))?;
        if uid == 0 {
            return Err(FingerError::Config(
                "run_as_user: refusing to drop privileges from root to root".to_string(),
            ));
        }
        Ok(Self { uid, gid })
    }
}

fn is_signed_decimal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `family:descriptor` records handed from one process generation to the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdManifest {
    entries: Vec<(AddressFamily, RawFd)>,
}

impl FdManifest {
    pub fn push(&mut self, family: AddressFamily, fd: RawFd) {
        self.entries.push((family, fd));
    }

    pub fn entries(&self) -> &[(AddressFamily, RawFd)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (family, fd) in &self.entries {
            let _ = writeln!(out, "{}:{}", family, fd);
        }
        out
    }

    /// Any malformed record rejects the whole manifest.
    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Self::default();
        for (index, line) in text.split('\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let (family, fd) = line.split_once(':').ok_or_else(|| {
                FingerError::Manifest(format!("entry {}: expected family:descriptor", index + 1))
            })?;
            let family: AddressFamily = family.parse()?;
            let fd: RawFd = fd
                .parse()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| {
                    FingerError::Manifest(format!("entry {}: bad descriptor {:?}", index + 1, fd))
                })?;
            if manifest.entries.iter().any(|&(_, seen)| seen == fd) {
                return Err(FingerError::Manifest(format!(
                    "entry {}: descriptor {} listed twice",
                    index + 1,
                    fd
                )));
            }
            manifest.push(family, fd);
        }
        Ok(manifest)
    }
}

/// Make `path` writable by the drop target, creating it if needed.
///
/// Files opened while still root (the log file) are reopened by the next
/// generation, which no longer has root's access to them.
pub fn hand_over_file(path: &Path, target: &DropTarget) -> Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FingerError::PrivilegeDrop(format!("opening {}: {}", path.display(), e)))?;
    nix::unistd::chown(
        path,
        Some(Uid::from_raw(target.uid)),
        Some(Gid::from_raw(target.gid)),
    )
    .map_err(|e| {
        FingerError::PrivilegeDrop(format!(
            "chown {} to {}:{}: {}",
            path.display(),
            target.uid,
            target.gid,
            e
        ))
    })
}

/// Read and erase the manifest left by the previous generation.
pub fn take_manifest_from_env() -> Result<Option<FdManifest>> {
    let Some(value) = std::env::var_os(MANIFEST_ENV_VAR) else {
        return Ok(None);
    };
    // SAFETY: called from main before the runtime or any other thread that
    // reads the environment is started.
    unsafe { std::env::remove_var(MANIFEST_ENV_VAR) };
    let text = value
        .into_string()
        .map_err(|_| FingerError::Manifest(format!("{} is not valid UTF-8", MANIFEST_ENV_VAR)))?;
    FdManifest::parse(&text).map(Some)
}

/// Moving from a privileged start to an unprivileged runtime
pub trait PrivilegeSeparation {
    /// Switch identity, keeping `sockets` usable. Never returns on success.
    fn drop_privileges(&self, sockets: &[ListenSocket], target: &DropTarget) -> Result<Infallible>;

    /// Sockets handed over by a previous generation, if any.
    fn recover_inherited_sockets(&self) -> Result<Option<Vec<ListenSocket>>>;
}

/// setgid/setuid followed by execve of the running binary
///
/// Must be used from the main thread before the async runtime exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReexecHandoff;

impl PrivilegeSeparation for ReexecHandoff {
    fn drop_privileges(&self, sockets: &[ListenSocket], target: &DropTarget) -> Result<Infallible> {
        let mut manifest = FdManifest::default();
        for socket in sockets {
            let fd = socket.clear_cloexec_for_exec()?;
            manifest.push(socket.family(), fd);
        }

        let exe = std::env::current_exe()
            .map_err(|e| FingerError::PrivilegeDrop(format!("locating own binary: {}", e)))?;
        let exe = to_cstring(exe.into_os_string())?;
        let args = std::env::args_os()
            .map(to_cstring)
            .collect::<Result<Vec<_>>>()?;
        let mut env = std::env::vars_os()
            .filter(|(key, _)| key != MANIFEST_ENV_VAR)
            .map(|(key, value)| {
                let mut pair = key;
                pair.push("=");
                pair.push(value);
                to_cstring(pair)
            })
            .collect::<Result<Vec<_>>>()?;
        env.push(to_cstring(OsString::from(format!(
            "{}={}",
            MANIFEST_ENV_VAR,
            manifest.encode()
        )))?);

        AuditLogger::privilege_drop(
            &format!("{}:{}", target.uid, target.gid),
            target.uid,
            target.gid,
            sockets.len(),
        );
        info!(uid = target.uid, gid = target.gid, listeners = sockets.len(), "dropping privileges");

        let gid = Gid::from_raw(target.gid);
        #[cfg(not(target_vendor = "apple"))]
        nix::unistd::setgroups(&[gid])
            .map_err(|e| FingerError::PrivilegeDrop(format!("setgroups([{}]): {}", gid, e)))?;
        // Group first: once the uid is gone setgid is no longer permitted.
        nix::unistd::setgid(gid)
            .map_err(|e| FingerError::PrivilegeDrop(format!("setgid({}): {}", gid, e)))?;
        nix::unistd::setuid(Uid::from_raw(target.uid))
            .map_err(|e| FingerError::PrivilegeDrop(format!("setuid({}): {}", target.uid, e)))?;

        let Err(e) = nix::unistd::execve(&exe, &args, &env);
        error!("returned from exec(): {}", e);
        Err(FingerError::PrivilegeDrop(format!("exec: {}", e)))
    }

    fn recover_inherited_sockets(&self) -> Result<Option<Vec<ListenSocket>>> {
        let Some(manifest) = take_manifest_from_env()? else {
            return Ok(None);
        };
        if manifest.is_empty() {
            warn!("inherited socket manifest is empty, binding afresh");
            return Ok(None);
        }
        let mut sockets = Vec::with_capacity(manifest.entries().len());
        for &(family, fd) in manifest.entries() {
            // SAFETY: the descriptor was left open for us by the previous
            // generation and nothing else in this process has claimed it.
            sockets.push(unsafe { ListenSocket::from_inherited(family, fd) }?);
        }
        info!("recovered {} listeners", sockets.len());
        AuditLogger::listeners_recovered(sockets.len());
        Ok(Some(sockets))
    }
}

fn to_cstring(value: OsString) -> Result<CString> {
    CString::new(value.into_vec())
        .map_err(|e| FingerError::PrivilegeDrop(format!("argument contains NUL: {}", e)))
}
