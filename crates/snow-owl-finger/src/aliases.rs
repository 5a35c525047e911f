//! Alias mapping
//!
//! The alias file follows the BSD `finger.conf` format: one `alias:target`
//! per line, `#` comments, blank lines ignored. A target is either a user
//! name, another alias, or an absolute path to a file served verbatim.
//!
//! Chains are folded when the file is loaded, so a lookup in an [`AliasMap`]
//! never yields another alias. Readers take an immutable snapshot from the
//! [`AliasStore`]; a reload swaps in a completely built map.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::AuditLogger;

/// Final destination of an alias
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasTarget {
    /// Resolve under this (lowercased) user name instead
    User(String),
    /// Serve this administrator-chosen file, bypassing ownership checks
    StaticFile(PathBuf),
}

/// Fully-resolved alias table, keyed by lowercased alias
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    targets: HashMap<String, AliasTarget>,
}

impl AliasMap {
    /// Parse alias file contents. Malformed lines are skipped with a warning.
    pub fn parse(contents: &str) -> Self {
        let mut declared_in_order: Vec<(String, String)> = Vec::new();

        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((alias, target)) = line.split_once(':') else {
                warn!(line = index + 1, "malformed alias line, skipping");
                continue;
            };
            let (alias, target) = (alias.trim(), target.trim());
            if alias.is_empty() || target.is_empty() || alias.contains('/') {
                warn!(line = index + 1, "malformed alias line, skipping");
                continue;
            }
            declared_in_order.push((alias.to_lowercase(), target.to_string()));
        }

        // Walk backwards so the last declaration of a key wins.
        let mut declared: HashMap<String, String> = HashMap::new();
        for (alias, target) in declared_in_order.into_iter().rev() {
            if declared.contains_key(&alias) {
                warn!(alias = %alias, "alias defined more than once, last one wins");
                continue;
            }
            let target = if target.starts_with('/') {
                target
            } else {
                target.to_lowercase()
            };
            declared.insert(alias, target);
        }

        let mut targets = HashMap::with_capacity(declared.len());
        for (alias, target) in &declared {
            match fold_chain(alias, target, &declared) {
                Some(resolved) => {
                    targets.insert(alias.clone(), resolved);
                }
                None => warn!(alias = %alias, "alias chain loops, skipping"),
            }
        }

        Self { targets }
    }

    pub fn get(&self, alias: &str) -> Option<&AliasTarget> {
        self.targets.get(alias)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Follow alias-to-alias edges until a user name or a path is reached.
fn fold_chain(
    alias: &str,
    target: &str,
    declared: &HashMap<String, String>,
) -> Option<AliasTarget> {
    let mut current = target;
    let mut hops = 0;
    loop {
        if current.starts_with('/') {
            return Some(AliasTarget::StaticFile(PathBuf::from(current)));
        }
        let Some(next) = declared.get(current) else {
            return Some(AliasTarget::User(current.to_string()));
        };
        hops += 1;
        if current == alias || hops > declared.len() {
            return None;
        }
        current = next;
    }
}

/// Process-wide alias mapping with lock-free snapshot reads
pub struct AliasStore {
    path: Option<PathBuf>,
    current: ArcSwap<AliasMap>,
}

impl AliasStore {
    /// Create an empty store; call [`AliasStore::reload`] to populate it.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: ArcSwap::from_pointee(AliasMap::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Arc<AliasMap> {
        self.current.load_full()
    }

    pub fn replace(&self, map: AliasMap) {
        self.current.store(Arc::new(map));
    }

    /// Re-read the alias file.
    ///
    /// An unreadable or missing file keeps the current mapping: an editor
    /// replacing the file must not momentarily blank every alias. Write an
    /// empty file to clear the mapping.
    pub fn reload(&self) -> bool {
        let Some(path) = self.path.as_deref() else {
            return false;
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let map = AliasMap::parse(&contents);
                let count = map.len();
                self.replace(map);
                info!(file = %path.display(), alias_count = count, "parsed aliases");
                AuditLogger::aliases_loaded(path, count);
                true
            }
            Err(e) => {
                info!(file = %path.display(), error = %e, "unable to load aliases");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> AliasTarget {
        AliasTarget::User(name.to_string())
    }

    #[test]
    fn test_parse_simple_aliases() {
        let map = AliasMap::parse("postmaster:alice\nwebmaster:Bob\n");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("postmaster"), Some(&user("alice")));
        assert_eq!(map.get("webmaster"), Some(&user("bob")));
    }

    #[test]
    fn test_comments_blank_and_malformed_lines_skipped() {
        let map = AliasMap::parse(
            "# header\n\n   \nnocolon\n:nobody\nempty:\nsub/dir:alice\nok:carol\n",
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("ok"), Some(&user("carol")));
    }

    #[test]
    fn test_alias_keys_are_lowercased() {
        let map = AliasMap::parse("Info:dave\n");
        assert_eq!(map.get("info"), Some(&user("dave")));
        assert!(map.get("Info").is_none());
    }

    #[test]
    fn test_static_file_target_keeps_case() {
        let map = AliasMap::parse("motd:/srv/Finger/MOTD.txt\n");
        assert_eq!(
            map.get("motd"),
            Some(&AliasTarget::StaticFile(PathBuf::from("/srv/Finger/MOTD.txt")))
        );
    }

    #[test]
    fn test_forward_reference_chain_folds() {
        let map = AliasMap::parse("a:b\nb:c\nc:erin\n");
        assert_eq!(map.get("a"), Some(&user("erin")));
        assert_eq!(map.get("b"), Some(&user("erin")));
        assert_eq!(map.get("c"), Some(&user("erin")));
    }

    #[test]
    fn test_backward_reference_to_static_file_folds() {
        let map = AliasMap::parse("alice:/srv/static.txt\nbob:alice\n");
        assert_eq!(
            map.get("bob"),
            Some(&AliasTarget::StaticFile(PathBuf::from("/srv/static.txt")))
        );
    }

    #[test]
    fn test_last_declaration_wins() {
        let map = AliasMap::parse("help:alice\nhelp:bob\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("help"), Some(&user("bob")));
    }

    #[test]
    fn test_no_alias_to_alias_edges_remain() {
        let map = AliasMap::parse("x:y\ny:z\nz:/etc/motd\nw:x\nv:frank\n");
        for alias in ["v", "w", "x", "y", "z"] {
            if let Some(AliasTarget::User(name)) = map.get(alias) {
                assert!(map.get(name).is_none(), "{alias} points at alias {name}");
            }
        }
    }

    #[test]
    fn test_cycles_are_dropped() {
        let map = AliasMap::parse("a:b\nb:a\nself:self\nok:grace\n");
        assert!(map.get("a").is_none());
        assert!(map.get("b").is_none());
        assert!(map.get("self").is_none());
        assert_eq!(map.get("ok"), Some(&user("grace")));
    }

    #[test]
    fn test_store_reload_and_missing_file_keeps_mapping()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("finger.conf");
        std::fs::write(&path, "root:admin\n")?;

        let store = AliasStore::new(Some(path.clone()));
        assert!(store.snapshot().is_empty());
        assert!(store.reload());
        assert_eq!(store.snapshot().get("root"), Some(&user("admin")));

        std::fs::remove_file(&path)?;
        assert!(!store.reload());
        assert_eq!(store.snapshot().get("root"), Some(&user("admin")));

        std::fs::write(&path, "")?;
        assert!(store.reload());
        assert!(store.snapshot().is_empty());
        Ok(())
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = AliasStore::new(None);
        store.replace(AliasMap::parse("old:heidi\n"));
        let before = store.snapshot();
        store.replace(AliasMap::parse("new:ivan\n"));
        assert_eq!(before.get("old"), Some(&user("heidi")));
        assert!(store.snapshot().get("old").is_none());
        assert!(!store.reload());
    }
}
