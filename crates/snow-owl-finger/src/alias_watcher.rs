//! Alias file hot reload

use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::aliases::AliasStore;

/// Watch the alias file's directory and reload the store whenever the file
/// is written, created, renamed into place or has its permissions changed.
///
/// Watching the directory rather than the file means a file that does not
/// exist yet is picked up once it appears. The returned watcher must be
/// kept alive for as long as reloads are wanted. Failure to watch is not
/// fatal: the aliases loaded at startup stay in force.
pub fn watch(store: Arc<AliasStore>) -> Option<RecommendedWatcher> {
    let path = store.path()?.to_path_buf();
    let (Some(dir), Some(basename)) = (path.parent(), path.file_name()) else {
        warn!(subsystem = "fs-watcher", file = %path.display(), "alias file has no parent directory, not watching");
        return None;
    };
    let dir = dir.to_path_buf();
    let basename = basename.to_os_string();
    let watched_dir = dir.clone();

    let handler = move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if event.paths.iter().any(|p| p == &watched_dir) && event.kind.is_remove() {
                warn!(
                    subsystem = "fs-watcher",
                    dir = %watched_dir.display(),
                    "directory of alias file gone, no further reloads"
                );
                return;
            }
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(basename.as_os_str()))
            {
                return;
            }
            match event.kind {
                EventKind::Create(_) => {
                    info!(subsystem = "fs-watcher", "creation detected");
                    store.reload();
                }
                EventKind::Modify(ModifyKind::Metadata(_)) => {
                    info!(subsystem = "fs-watcher", "chmod detected");
                    store.reload();
                }
                EventKind::Modify(_) => {
                    info!(subsystem = "fs-watcher", "modification detected");
                    store.reload();
                }
                EventKind::Remove(_) => {
                    info!(subsystem = "fs-watcher", "alias file gone, keeping current aliases");
                }
                _ => {}
            }
        }
        Err(e) => warn!(subsystem = "fs-watcher", "watch error: {}", e),
    };

    let mut watcher = match RecommendedWatcher::new(handler, Config::default()) {
        Ok(watcher) => watcher,
        Err(e) => {
            error!(subsystem = "fs-watcher", "unable to start watcher, will not detect changes: {}", e);
            return None;
        }
    };
    if let Err(e) = watcher.watch(Path::new(&dir), RecursiveMode::NonRecursive) {
        error!(
            subsystem = "fs-watcher",
            dir = %dir.display(),
            "unable to watch alias directory, will not detect changes: {}", e
        );
        return None;
    }
    info!(subsystem = "fs-watcher", file = %path.display(), "alias watcher started");
    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::AliasTarget;
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        condition()
    }

    #[test]
    fn test_no_path_means_no_watcher() {
        assert!(watch(Arc::new(AliasStore::new(None))).is_none());
    }

    #[test]
    fn test_late_creation_and_rewrite_are_picked_up()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("finger.conf");
        let store = Arc::new(AliasStore::new(Some(path.clone())));
        assert!(!store.reload());

        let _watcher = watch(Arc::clone(&store)).ok_or("watcher did not start")?;

        std::fs::write(&path, "root:judy\n")?;
        assert!(wait_for(|| store.snapshot().get("root").is_some()));

        std::fs::write(&path, "root:kim\n")?;
        assert!(wait_for(|| {
            store.snapshot().get("root") == Some(&AliasTarget::User("kim".to_string()))
        }));

        // Removal keeps what was loaded.
        std::fs::remove_file(&path)?;
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(
            store.snapshot().get("root"),
            Some(&AliasTarget::User("kim".to_string()))
        );
        Ok(())
    }
}
