//! System account lookup
//!
//! NIST 800-53: AC-2 (Account Management), IA-2 (Identification and Authentication)
//!
//! The resolver only needs two facts about an account: its uid and its home
//! directory. Lookups go through [`AccountDatabase`] so the resolver can be
//! exercised without touching the host password database.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// The parts of a password database entry the resolver uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: u32,
    pub home_dir: PathBuf,
}

pub trait AccountDatabase: Send + Sync {
    /// Look up an account by login name. Lookup errors read as absent.
    fn lookup(&self, name: &str) -> Option<Account>;
}

/// Host password database (`getpwnam_r`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

impl AccountDatabase for SystemAccounts {
    fn lookup(&self, name: &str) -> Option<Account> {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Some(Account {
                uid: user.uid.as_raw(),
                home_dir: user.dir,
            }),
            Ok(None) => None,
            Err(e) => {
                debug!(username = %name, error = %e, "account lookup failed");
                None
            }
        }
    }
}

/// Fixed account table, for deployments without a usable password database
#[derive(Debug, Default, Clone)]
pub struct StaticAccounts {
    accounts: HashMap<String, Account>,
}

impl StaticAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, name: &str, uid: u32, home_dir: impl Into<PathBuf>) -> Self {
        self.accounts.insert(
            name.to_string(),
            Account {
                uid,
                home_dir: home_dir.into(),
            },
        );
        self
    }
}

impl AccountDatabase for StaticAccounts {
    fn lookup(&self, name: &str) -> Option<Account> {
        self.accounts.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_lookup_finds_root() {
        // Every Unix password database has uid 0 as "root".
        let account = SystemAccounts.lookup("root");
        if let Some(account) = account {
            assert_eq!(account.uid, 0);
        }
    }

    #[test]
    fn test_system_lookup_missing_account() {
        assert!(SystemAccounts.lookup("snow-owl-no-such-account").is_none());
    }

    #[test]
    fn test_static_accounts() {
        let db = StaticAccounts::new().with_account("judy", 1500, "/srv/judy");
        assert_eq!(
            db.lookup("judy"),
            Some(Account {
                uid: 1500,
                home_dir: PathBuf::from("/srv/judy")
            })
        );
        assert!(db.lookup("mallory").is_none());
    }
}
