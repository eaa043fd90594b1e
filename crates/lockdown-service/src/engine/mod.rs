//! Protection engine.
//!
//! Owns every piece of mutable service state (policy, watch registry,
//! protection switch, audit journal) and turns raw change events into
//! enforcement actions. Callers drive it from a single loop; nothing here is
//! shared across threads.
//!
//! **Echo suppression**: unlinking or recreating a protected file produces
//! an inotify event of its own. Each action records the event it expects to
//! cause and that event is discarded once when it arrives, otherwise a
//! create-block would be answered by a restore and so on forever.

pub mod classify;

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use lockdown_core::attributes;
use lockdown_core::error::AttrError;
use lockdown_core::event_log::{EventSeverity, Journal};
use lockdown_core::policy::PolicyStore;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use crate::watch::inotify::RawEvent;
use crate::watch::{RegistrationReport, WatchBackend, WatchRegistry};

pub use classify::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    Enabled,
    Disabled,
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("Enabled"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Unnamed,
    Overflow,
    UnknownHandle,
    SelfArtifact,
    SelfInduced,
}

/// What the engine did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementOutcome {
    Dropped(DropReason),
    Ignored,
    Observed,
    Unprotected(PathBuf),
    WatchExtended {
        dir: PathBuf,
        watched: usize,
        blocked: Vec<PathBuf>,
        locked: Vec<PathBuf>,
    },
    DirectoryGone(PathBuf),
    CreationBlocked(PathBuf),
    BlockFailed {
        path: PathBuf,
        error: String,
    },
    Restored {
        path: PathBuf,
        kind: EventKind,
        locked: bool,
    },
    RestoreFailed {
        path: PathBuf,
        error: String,
    },
    Relocked(PathBuf),
    RelockFailed {
        path: PathBuf,
        error: String,
    },
}

impl EnforcementOutcome {
    /// Terminal line for blocking actions; structural outcomes stay silent.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::CreationBlocked(path) => Some(format!(
                "Blocked creation of protected file: {}",
                path.display()
            )),
            Self::Restored { path, kind, .. } => Some(match kind {
                EventKind::Deleted => {
                    format!("Blocked deletion of protected file: {}", path.display())
                }
                _ => format!(
                    "Blocked move operation on protected file: {}",
                    path.display()
                ),
            }),
            Self::Relocked(path) => Some(format!(
                "Blocked modification of protected file: {}",
                path.display()
            )),
            Self::WatchExtended { blocked, .. } if !blocked.is_empty() => Some(
                blocked
                    .iter()
                    .map(|p| format!("Blocked creation of protected file: {}", p.display()))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub failed: usize,
}

pub struct Engine {
    policy: PolicyStore,
    registry: WatchRegistry,
    state: ProtectionState,
    journal: Option<Journal>,
    echoes: HashMap<(PathBuf, EventKind), usize>,
}

impl Engine {
    pub fn new(policy: PolicyStore, max_watches: usize) -> Self {
        Self {
            policy,
            registry: WatchRegistry::new(max_watches),
            state: ProtectionState::Disabled,
            journal: None,
            echoes: HashMap::new(),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Watch the whole protected tree. Fails only when the root itself
    /// cannot be watched.
    pub fn start<B: WatchBackend + ?Sized>(&mut self, backend: &B) -> Result<RegistrationReport> {
        let root = self.policy.root().to_path_buf();
        let report = self.registry.register_recursive(backend, &root);
        if !self.registry.is_watched(&root) {
            return Err(anyhow!("failed to watch protected root {}", root.display()));
        }
        Ok(report)
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut PolicyStore {
        &mut self.policy
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn state(&self) -> ProtectionState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == ProtectionState::Enabled
    }

    /// Append to the audit journal. Journal failures never stop enforcement.
    pub fn record(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(event_type, severity, data) {
                error!(error = %e, event_type, "failed to append to journal");
            }
        }
    }

    /// Turn enforcement on and lock every protected file already present.
    pub fn enable(&mut self) -> SweepReport {
        self.state = ProtectionState::Enabled;
        let mut report = SweepReport::default();
        for path in self.regular_files(self.policy.root()) {
            if !self.policy.is_match(&path) {
                continue;
            }
            report.processed += 1;
            if attributes::lock(&path).is_err() {
                report.failed += 1;
            }
        }
        info!(locked = report.processed, failed = report.failed, "protection enabled");
        self.record(
            "PROTECTION_ENABLED",
            EventSeverity::Info,
            serde_json::json!({"locked": report.processed, "failed": report.failed}),
        );
        report
    }

    /// Turn enforcement off, clear the immutable flag and restore write
    /// permission on every regular file of the tree.
    pub fn disable(&mut self) -> SweepReport {
        self.state = ProtectionState::Disabled;
        let mut report = SweepReport::default();
        for path in self.regular_files(self.policy.root()) {
            report.processed += 1;
            let unlocked = attributes::unlock(&path);
            let writable = attributes::restore_writable(&path);
            if unlocked.is_err() || writable.is_err() {
                report.failed += 1;
            }
        }
        info!(restored = report.processed, failed = report.failed, "protection disabled");
        self.record(
            "PROTECTION_DISABLED",
            EventSeverity::Warn,
            serde_json::json!({"restored": report.processed, "failed": report.failed}),
        );
        report
    }

    /// Release every lock before the process exits.
    pub fn shutdown(&mut self) {
        if self.is_enabled() {
            self.disable();
        }
        self.record("SERVICE_STOPPED", EventSeverity::Info, serde_json::json!({}));
        info!("file protection system stopped");
    }

    fn regular_files(&self, dir: &Path) -> Vec<PathBuf> {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to read directory during sweep");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| !self.policy.is_self_artifact(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    pub fn handle_event<B: WatchBackend + ?Sized>(
        &mut self,
        backend: &B,
        event: RawEvent,
    ) -> EnforcementOutcome {
        if event.is_overflow() {
            warn!("change notification queue overflowed; events were lost");
            return EnforcementOutcome::Dropped(DropReason::Overflow);
        }
        let Some(name) = event.name.as_deref() else {
            trace!(mask = event.mask, "event without a name dropped");
            return EnforcementOutcome::Dropped(DropReason::Unnamed);
        };
        let Some(dir) = self.registry.resolve(event.handle) else {
            warn!(handle = event.handle.0, "unrecognized watch descriptor");
            return EnforcementOutcome::Dropped(DropReason::UnknownHandle);
        };
        let path = dir.join(name);
        if self.policy.is_self_artifact(&path) {
            return EnforcementOutcome::Dropped(DropReason::SelfArtifact);
        }
        let Some(kind) = EventKind::classify(event.mask) else {
            return EnforcementOutcome::Ignored;
        };
        if self.consume_echo(&path, kind) {
            trace!(path = %path.display(), kind = kind.as_str(), "suppressed self-induced event");
            return EnforcementOutcome::Dropped(DropReason::SelfInduced);
        }

        if event.is_dir() {
            return self.track_directory(backend, kind, path);
        }
        if !self.is_enabled() {
            debug!(path = %path.display(), kind = kind.as_str(), "protection disabled, observing only");
            return EnforcementOutcome::Observed;
        }
        if !self.policy.is_match(&path) {
            return EnforcementOutcome::Unprotected(path);
        }

        match kind {
            EventKind::Created => self.block_creation(path),
            EventKind::Deleted | EventKind::MovedFrom | EventKind::MovedTo => {
                self.reinstate(path, kind)
            }
            EventKind::Modified => self.relock(path),
        }
    }

    fn expect_echo(&mut self, path: &Path, kind: EventKind) {
        *self.echoes.entry((path.to_path_buf(), kind)).or_insert(0) += 1;
    }

    fn consume_echo(&mut self, path: &Path, kind: EventKind) -> bool {
        let key = (path.to_path_buf(), kind);
        match self.echoes.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.echoes.remove(&key);
                }
                true
            }
            None => false,
        }
    }

    fn track_directory<B: WatchBackend + ?Sized>(
        &mut self,
        backend: &B,
        kind: EventKind,
        dir: PathBuf,
    ) -> EnforcementOutcome {
        match kind {
            EventKind::Created | EventKind::MovedTo => {
                if !self.policy.contains_dir(&dir) {
                    return EnforcementOutcome::Unprotected(dir);
                }
                let report = self.registry.register_recursive(backend, &dir);
                let (blocked, locked) = match (self.is_enabled(), kind) {
                    (false, _) => (Vec::new(), Vec::new()),
                    (true, EventKind::Created) => (self.block_existing(&dir), Vec::new()),
                    (true, _) => (Vec::new(), self.lock_existing(&dir)),
                };
                EnforcementOutcome::WatchExtended {
                    dir,
                    watched: report.added.len(),
                    blocked,
                    locked,
                }
            }
            EventKind::Deleted | EventKind::MovedFrom => {
                debug!(path = %dir.display(), "watched directory left the tree");
                EnforcementOutcome::DirectoryGone(dir)
            }
            EventKind::Modified => EnforcementOutcome::Ignored,
        }
    }

    /// Remove protected files that appeared in a new subtree before its
    /// watch existed.
    fn block_existing(&mut self, dir: &Path) -> Vec<PathBuf> {
        let mut blocked = Vec::new();
        for path in self.regular_files(dir) {
            if !self.policy.is_match(&path) {
                continue;
            }
            if let EnforcementOutcome::CreationBlocked(p) = self.block_creation(path) {
                blocked.push(p);
            }
        }
        blocked
    }

    /// Lock protected files carried in by a directory moved into the tree.
    /// Their content is kept, as for a single moved-in file.
    fn lock_existing(&mut self, dir: &Path) -> Vec<PathBuf> {
        let mut locked = Vec::new();
        for path in self.regular_files(dir) {
            if !self.policy.is_match(&path) {
                continue;
            }
            match attributes::lock(&path) {
                Err(AttrError::Open { .. }) => {}
                _ => locked.push(path),
            }
        }
        if !locked.is_empty() {
            info!(dir = %dir.display(), files = locked.len(), "locked protected files in moved directory");
            self.record(
                "SUBTREE_LOCKED",
                EventSeverity::Warn,
                serde_json::json!({
                    "dir": dir.display().to_string(),
                    "files": locked.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                }),
            );
        }
        locked
    }

    fn block_creation(&mut self, path: PathBuf) -> EnforcementOutcome {
        match fs::remove_file(&path) {
            Ok(()) => {
                self.expect_echo(&path, EventKind::Deleted);
                info!(path = %path.display(), "blocked creation of protected file");
                self.record(
                    "CREATE_BLOCKED",
                    EventSeverity::Warn,
                    serde_json::json!({"path": path.display().to_string()}),
                );
                EnforcementOutcome::CreationBlocked(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to block creation of protected file");
                self.record(
                    "CREATE_BLOCK_FAILED",
                    EventSeverity::Error,
                    serde_json::json!({"path": path.display().to_string(), "error": e.to_string()}),
                );
                EnforcementOutcome::BlockFailed {
                    path,
                    error: e.to_string(),
                }
            }
        }
    }

    fn reinstate(&mut self, path: PathBuf, kind: EventKind) -> EnforcementOutcome {
        let result = self.recreate(&path).map_err(|e| e.to_string()).and_then(|()| {
            match attributes::lock(&path) {
                Ok(()) => Ok(true),
                Err(err @ AttrError::Open { .. }) => Err(err.to_string()),
                Err(_) => Ok(false),
            }
        });
        match result {
            Ok(locked) => {
                info!(path = %path.display(), trigger = kind.as_str(), locked, "restored protected file");
                self.record(
                    "FILE_RESTORED",
                    EventSeverity::Warn,
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "trigger": kind.as_str(),
                        "locked": locked,
                    }),
                );
                EnforcementOutcome::Restored { path, kind, locked }
            }
            Err(error) => {
                warn!(path = %path.display(), trigger = kind.as_str(), error = %error, "failed to restore protected file");
                self.record(
                    "RESTORE_FAILED",
                    EventSeverity::Error,
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "trigger": kind.as_str(),
                        "error": error,
                    }),
                );
                EnforcementOutcome::RestoreFailed { path, error }
            }
        }
    }

    /// Create an empty file at `path` unless something already sits there.
    fn recreate(&mut self, path: &Path) -> std::io::Result<()> {
        if fs::symlink_metadata(path).is_ok() {
            return Ok(());
        }
        OpenOptions::new().append(true).create(true).open(path)?;
        self.expect_echo(path, EventKind::Created);
        Ok(())
    }

    fn relock(&mut self, path: PathBuf) -> EnforcementOutcome {
        match attributes::lock(&path) {
            Ok(()) => {
                info!(path = %path.display(), "re-locked modified protected file");
                self.record(
                    "FILE_RELOCKED",
                    EventSeverity::Warn,
                    serde_json::json!({"path": path.display().to_string()}),
                );
                EnforcementOutcome::Relocked(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to re-lock modified protected file");
                self.record(
                    "RELOCK_FAILED",
                    EventSeverity::Error,
                    serde_json::json!({"path": path.display().to_string(), "error": e.to_string()}),
                );
                EnforcementOutcome::RelockFailed {
                    path,
                    error: e.to_string(),
                }
            }
        }
    }
}
