//! The watched-node registry. The original `inotify.c` threads every
//! watched directory through an intrusive `list_head` recovered with
//! `container_of` against a tagged `watcher_type` enum; here each path
//! owns one `Watcher` value carrying its own payload, kept in a single
//! `path -> Watcher` map so lookup is `HashMap::get` rather than a list
//! walk.

use std::collections::HashSet;
use std::path::PathBuf;

use nix::sys::inotify::WatchDescriptor;

/// Directory and leaf node kinds mirrored from `inotify.c`'s
/// `watcher_type`. `*_DIR` variants watch the containing directory for
/// CREATE/DELETE of its children; the non-`_DIR` variants watch a single
/// entry for MODIFY/DELETE_SELF.
#[derive(Debug)]
pub enum Watcher {
    HostsDir,
    Host { nqn: String },
    PortsDir,
    Port { portid: i64 },
    PortAttr { portid: i64 },
    PortSubsysDir { portid: i64 },
    PortSubsys { portid: i64, subsys_nqn: String },
    SubsysDir,
    Subsys { nqn: String },
    SubsysAttr { nqn: String },
    SubsysHostsDir { nqn: String },
    SubsysHost { nqn: String, host_nqn: String },
}

pub struct WatchEntry {
    pub wd: WatchDescriptor,
    pub watcher: Watcher,
}

/// Keyed collection of active watches, replacing the source's embedded
/// linked list. Re-adding a watch for a path that is already registered
/// is a no-op (idempotent watch semantics, per SPEC_FULL.md §4.B).
#[derive(Default)]
pub struct WatcherSet {
    by_path: std::collections::HashMap<PathBuf, WatchEntry>,
    known_paths: HashSet<PathBuf>,
}

impl WatcherSet {
    pub fn new() -> WatcherSet {
        WatcherSet::default()
    }

    pub fn contains(&self, path: &std::path::Path) -> bool {
        self.known_paths.contains(path)
    }

    pub fn insert(&mut self, path: PathBuf, wd: WatchDescriptor, watcher: Watcher) {
        self.known_paths.insert(path.clone());
        self.by_path.insert(path, WatchEntry { wd, watcher });
    }

    pub fn remove(&mut self, path: &std::path::Path) -> Option<WatchEntry> {
        self.known_paths.remove(path);
        self.by_path.remove(path)
    }

    pub fn get(&self, path: &std::path::Path) -> Option<&WatchEntry> {
        self.by_path.get(path)
    }

    pub fn find_by_wd(&self, wd: &WatchDescriptor) -> Option<(&PathBuf, &WatchEntry)> {
        self.by_path.iter().find(|(_, e)| &e.wd == wd)
    }

    pub fn clear(&mut self) {
        self.by_path.clear();
        self.known_paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_is_unknown() {
        let mut ws = WatcherSet::new();
        let path = PathBuf::from("/sys/kernel/config/nvmet/hosts");
        // WatchDescriptor has no public constructor outside nix; exercised
        // indirectly via the reflector integration tests instead. Here we
        // only check path bookkeeping through contains().
        assert!(!ws.contains(&path));
    }
}
