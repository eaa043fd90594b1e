//! Watch registry: keeps one kernel watch per directory of the protected
//! tree and maps incoming watch handles back to directory paths.

pub mod inotify;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_MAX_WATCHES: usize = 1000;

/// Opaque handle issued by the notification subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub i32);

/// Source of kernel watches.
pub trait WatchBackend {
    fn add_watch(&self, dir: &Path) -> io::Result<WatchHandle>;
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to add watch for {path}: {source}")]
    AddWatch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("watch limit of {limit} reached, not watching {path}")]
    CapacityReached { path: PathBuf, limit: usize },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    pub added: Vec<PathBuf>,
    pub failed: usize,
}

pub struct WatchRegistry {
    entries: HashMap<WatchHandle, PathBuf>,
    capacity: usize,
}

impl WatchRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resolve(&self, handle: WatchHandle) -> Option<&Path> {
        self.entries.get(&handle).map(PathBuf::as_path)
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.entries.values().any(|p| p == dir)
    }

    /// Watch a single directory.
    ///
    /// The kernel hands back the existing handle when the same inode is
    /// watched twice, so re-registration never creates a duplicate entry.
    pub fn register<B: WatchBackend + ?Sized>(
        &mut self,
        backend: &B,
        dir: &Path,
    ) -> Result<WatchHandle, WatchError> {
        if self.entries.len() >= self.capacity && !self.is_watched(dir) {
            return Err(WatchError::CapacityReached {
                path: dir.to_path_buf(),
                limit: self.capacity,
            });
        }
        let handle = backend
            .add_watch(dir)
            .map_err(|source| WatchError::AddWatch {
                path: dir.to_path_buf(),
                source,
            })?;
        self.entries.insert(handle, dir.to_path_buf());
        debug!(path = %dir.display(), handle = handle.0, "watch added");
        Ok(handle)
    }

    /// Depth-first walk of `root`, watching every directory including
    /// `root`. Unreadable entries and failed registrations are logged and
    /// skipped.
    pub fn register_recursive<B: WatchBackend + ?Sized>(
        &mut self,
        backend: &B,
        root: &Path,
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "failed to open directory for watching");
                    report.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match self.register(backend, entry.path()) {
                Ok(_) => report.added.push(entry.path().to_path_buf()),
                Err(err) => {
                    warn!(error = %err, "watch registration skipped");
                    report.failed += 1;
                }
            }
        }
        info!(
            root = %root.display(),
            added = report.added.len(),
            failed = report.failed,
            total = self.entries.len(),
            "directory tree registered"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use tempfile::tempdir;

    /// Hands out sequential handles, reusing them per path like the kernel.
    #[derive(Default)]
    struct FakeBackend {
        next: Cell<i32>,
        issued: RefCell<HashMap<PathBuf, WatchHandle>>,
        refuse: Option<PathBuf>,
    }

    impl WatchBackend for FakeBackend {
        fn add_watch(&self, dir: &Path) -> io::Result<WatchHandle> {
            if self.refuse.as_deref() == Some(dir) {
                return Err(io::Error::from_raw_os_error(libc::EACCES));
            }
            let mut issued = self.issued.borrow_mut();
            if let Some(h) = issued.get(dir) {
                return Ok(*h);
            }
            self.next.set(self.next.get() + 1);
            let handle = WatchHandle(self.next.get());
            issued.insert(dir.to_path_buf(), handle);
            Ok(handle)
        }
    }

    #[test]
    fn recursive_registration_covers_every_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("a/file.lock"), b"").unwrap();

        let backend = FakeBackend::default();
        let mut registry = WatchRegistry::new(DEFAULT_MAX_WATCHES);
        let report = registry.register_recursive(&backend, dir.path());

        assert_eq!(report.added.len(), 5);
        assert_eq!(report.failed, 0);
        assert_eq!(registry.len(), 5);
        assert!(registry.is_watched(&dir.path().join("a/b/c")));
        assert!(!registry.is_watched(&dir.path().join("a/file.lock")));
    }

    #[test]
    fn resolve_maps_handles_back_to_paths() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::default();
        let mut registry = WatchRegistry::new(DEFAULT_MAX_WATCHES);
        let handle = registry.register(&backend, dir.path()).unwrap();

        assert_eq!(registry.resolve(handle), Some(dir.path()));
        assert_eq!(registry.resolve(WatchHandle(9999)), None);
    }

    #[test]
    fn reregistration_keeps_a_single_entry() {
        let dir = tempdir().unwrap();
        let backend = FakeBackend::default();
        let mut registry = WatchRegistry::new(DEFAULT_MAX_WATCHES);
        let first = registry.register(&backend, dir.path()).unwrap();
        let second = registry.register(&backend, dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_drops_new_registrations() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("one")).unwrap();
        fs::create_dir_all(dir.path().join("two")).unwrap();

        let backend = FakeBackend::default();
        let mut registry = WatchRegistry::new(2);
        let report = registry.register_recursive(&backend, dir.path());

        assert_eq!(registry.len(), 2);
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            registry.register(&backend, &dir.path().join("three")),
            Err(WatchError::CapacityReached { limit: 2, .. })
        ));
    }

    #[test]
    fn failed_watch_does_not_abort_walk() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bad/inner")).unwrap();
        fs::create_dir_all(dir.path().join("good")).unwrap();

        let backend = FakeBackend {
            refuse: Some(dir.path().join("bad")),
            ..Default::default()
        };
        let mut registry = WatchRegistry::new(DEFAULT_MAX_WATCHES);
        let report = registry.register_recursive(&backend, dir.path());

        assert_eq!(report.failed, 1);
        assert!(registry.is_watched(&dir.path().join("good")));
        assert!(registry.is_watched(&dir.path().join("bad/inner")));
    }
}
