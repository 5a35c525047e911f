//! Username to account resolution
//!
//! NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
//!
//! Every negative outcome collapses to `None`. Callers must not be able to
//! tell a rejected name from an absent account, or a refused account from a
//! missing home directory.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::accounts::AccountDatabase;
use crate::aliases::{AliasStore, AliasTarget};

/// Result of a successful lookup. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub home_dir: Option<PathBuf>,
    /// Owner every served file must have; 0 leaves ownership unconstrained
    pub uid: u32,
    /// Administrator-chosen file that replaces the whole user block
    pub static_file: Option<PathBuf>,
}

impl UserRecord {
    fn home(home_dir: PathBuf, uid: u32) -> Self {
        Self {
            home_dir: Some(home_dir),
            uid,
            static_file: None,
        }
    }
}

enum Lookup {
    Found(UserRecord),
    /// Authoritative negative answer; later strategies must not run
    Refused,
    Missing,
}

#[derive(Clone)]
pub struct UserResolver {
    aliases: Arc<AliasStore>,
    accounts: Option<Arc<dyn AccountDatabase>>,
    min_account_uid: u32,
    homes_dir: Option<PathBuf>,
}

impl UserResolver {
    pub fn new(aliases: Arc<AliasStore>) -> Self {
        Self {
            aliases,
            accounts: None,
            min_account_uid: 0,
            homes_dir: None,
        }
    }

    pub fn with_homes_dir(mut self, homes_dir: Option<PathBuf>) -> Self {
        self.homes_dir = homes_dir;
        self
    }

    /// Enable system account lookups. A floor of 0 leaves them disabled.
    pub fn with_accounts(mut self, accounts: Arc<dyn AccountDatabase>, min_uid: u32) -> Self {
        self.accounts = Some(accounts);
        self.min_account_uid = min_uid;
        self
    }

    /// Resolve a requested name. Blocking: stats the filesystem and may
    /// query the password database.
    pub fn resolve(&self, requested: &str) -> Option<UserRecord> {
        if !is_acceptable_name(requested) {
            debug!(username = %requested.escape_debug(), "rejecting username");
            return None;
        }
        let mut name = requested.to_lowercase();

        match self.aliases.snapshot().get(&name) {
            Some(AliasTarget::StaticFile(path)) => {
                return Some(UserRecord {
                    home_dir: None,
                    uid: 0,
                    static_file: Some(path.clone()),
                });
            }
            Some(AliasTarget::User(target)) => {
                debug!(alias = %name, target = %target, "alias substituted");
                name = target.clone();
                if !is_acceptable_name(&name) {
                    return None;
                }
            }
            None => {}
        }

        match self.lookup_account(&name) {
            Lookup::Found(record) => return Some(record),
            Lookup::Refused => return None,
            Lookup::Missing => {}
        }

        self.lookup_home_directory(&name)
    }

    fn lookup_account(&self, name: &str) -> Lookup {
        let Some(accounts) = self.accounts.as_ref() else {
            return Lookup::Missing;
        };
        if self.min_account_uid == 0 {
            return Lookup::Missing;
        }
        let Some(account) = accounts.lookup(name) else {
            return Lookup::Missing;
        };
        if account.uid < self.min_account_uid {
            debug!(username = %name, uid = account.uid, "account below uid floor");
            return Lookup::Refused;
        }
        match std::fs::metadata(&account.home_dir) {
            Ok(meta) if meta.is_dir() => Lookup::Found(UserRecord::home(account.home_dir, account.uid)),
            _ => Lookup::Refused,
        }
    }

    fn lookup_home_directory(&self, name: &str) -> Option<UserRecord> {
        let root = self.homes_dir.as_ref()?;
        let home = root.join(name);
        // The entry itself must not be a symlink.
        let meta = std::fs::symlink_metadata(&home).ok()?;
        if !meta.is_dir() {
            return None;
        }
        Some(UserRecord::home(home, meta.uid()))
    }
}

fn is_acceptable_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::StaticAccounts;
    use crate::aliases::AliasMap;
    use std::path::Path;

    fn store_with(aliases: &str) -> Arc<AliasStore> {
        let store = AliasStore::new(None);
        store.replace(AliasMap::parse(aliases));
        Arc::new(store)
    }

    fn homes() -> std::io::Result<tempfile::TempDir> {
        let dir = tempfile::TempDir::new()?;
        std::fs::create_dir(dir.path().join("alice"))?;
        std::fs::create_dir(dir.path().join("carol"))?;
        Ok(dir)
    }

    fn owner(path: &Path) -> std::io::Result<u32> {
        Ok(std::fs::metadata(path)?.uid())
    }

    #[test]
    fn test_home_directory_lookup() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = homes()?;
        let resolver =
            UserResolver::new(store_with("")).with_homes_dir(Some(dir.path().to_path_buf()));

        let record = resolver.resolve("Alice").ok_or("alice should resolve")?;
        assert_eq!(record.home_dir, Some(dir.path().join("alice")));
        assert_eq!(record.uid, owner(&dir.path().join("alice"))?);
        assert!(record.static_file.is_none());
        assert!(resolver.resolve("dave").is_none());
        Ok(())
    }

    #[test]
    fn test_separator_names_look_absent() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = homes()?;
        let resolver =
            UserResolver::new(store_with("")).with_homes_dir(Some(dir.path().to_path_buf()));
        for name in ["../alice", "alice/", "a\\lice", "alice\0", "..", ".", ""] {
            assert!(resolver.resolve(name).is_none(), "{name:?} resolved");
        }
        Ok(())
    }

    #[test]
    fn test_symlinked_home_is_not_followed() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = homes()?;
        std::os::unix::fs::symlink(dir.path().join("alice"), dir.path().join("mallory"))?;
        std::fs::write(dir.path().join("plainfile"), "x")?;
        let resolver =
            UserResolver::new(store_with("")).with_homes_dir(Some(dir.path().to_path_buf()));
        assert!(resolver.resolve("mallory").is_none());
        assert!(resolver.resolve("plainfile").is_none());
        Ok(())
    }

    #[test]
    fn test_alias_chain_matches_direct_lookup() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = homes()?;
        let resolver = UserResolver::new(store_with("a:b\nb:carol\n"))
            .with_homes_dir(Some(dir.path().to_path_buf()));
        assert_eq!(resolver.resolve("A"), resolver.resolve("carol"));
        assert!(resolver.resolve("a").is_some());
        Ok(())
    }

    #[test]
    fn test_static_alias_bypasses_everything() {
        let resolver = UserResolver::new(store_with("alice:/srv/static.txt\nbob:alice\n"));
        let expected = UserRecord {
            home_dir: None,
            uid: 0,
            static_file: Some(PathBuf::from("/srv/static.txt")),
        };
        assert_eq!(resolver.resolve("bob"), Some(expected));
    }

    #[test]
    fn test_account_below_floor_is_authoritative()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = homes()?;
        let accounts = StaticAccounts::new().with_account("alice", 10, dir.path().join("alice"));
        let resolver = UserResolver::new(store_with(""))
            .with_homes_dir(Some(dir.path().to_path_buf()))
            .with_accounts(Arc::new(accounts), 1000);
        // A matching directory under the homes root must not rescue it.
        assert!(resolver.resolve("alice").is_none());
        Ok(())
    }

    #[test]
    fn test_account_home_must_be_directory() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = homes()?;
        let accounts = StaticAccounts::new()
            .with_account("alice", 2000, dir.path().join("gone"))
            .with_account("erin", 2001, dir.path().join("carol"));
        let resolver = UserResolver::new(store_with(""))
            .with_homes_dir(Some(dir.path().to_path_buf()))
            .with_accounts(Arc::new(accounts), 1000);

        assert!(resolver.resolve("alice").is_none());
        let erin = resolver.resolve("erin").ok_or("erin should resolve")?;
        assert_eq!(erin.uid, 2001);
        assert_eq!(erin.home_dir, Some(dir.path().join("carol")));
        Ok(())
    }

    #[test]
    fn test_missing_account_falls_through() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let dir = homes()?;
        let resolver = UserResolver::new(store_with(""))
            .with_homes_dir(Some(dir.path().to_path_buf()))
            .with_accounts(Arc::new(StaticAccounts::new()), 1000);
        assert!(resolver.resolve("carol").is_some());
        Ok(())
    }

    #[test]
    fn test_zero_floor_disables_account_lookup()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = homes()?;
        let accounts = StaticAccounts::new().with_account("alice", 10, "/nonexistent");
        let resolver = UserResolver::new(store_with(""))
            .with_homes_dir(Some(dir.path().to_path_buf()))
            .with_accounts(Arc::new(accounts), 0);
        assert!(resolver.resolve("alice").is_some());
        Ok(())
    }
}
