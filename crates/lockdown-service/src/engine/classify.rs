use std::ffi::OsStr;

use crate::watch::inotify::RawEvent;
use crate::watch::WatchHandle;

/// The five event kinds the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Deleted,
    MovedFrom,
    MovedTo,
    Modified,
}

impl EventKind {
    /// Pick a single kind from a combined mask, in the fixed priority order
    /// created, deleted, moved, modified.
    pub fn classify(mask: u32) -> Option<Self> {
        if mask & libc::IN_CREATE != 0 {
            Some(Self::Created)
        } else if mask & libc::IN_DELETE != 0 {
            Some(Self::Deleted)
        } else if mask & libc::IN_MOVED_FROM != 0 {
            Some(Self::MovedFrom)
        } else if mask & libc::IN_MOVED_TO != 0 {
            Some(Self::MovedTo)
        } else if mask & libc::IN_MODIFY != 0 {
            Some(Self::Modified)
        } else {
            None
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            Self::Created => libc::IN_CREATE,
            Self::Deleted => libc::IN_DELETE,
            Self::MovedFrom => libc::IN_MOVED_FROM,
            Self::MovedTo => libc::IN_MOVED_TO,
            Self::Modified => libc::IN_MODIFY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::MovedFrom => "moved_from",
            Self::MovedTo => "moved_to",
            Self::Modified => "modified",
        }
    }
}

impl RawEvent {
    /// Build an event of a single kind, as the kernel would report it.
    pub fn of_kind(handle: WatchHandle, kind: EventKind, name: &str, is_dir: bool) -> Self {
        let mut mask = kind.mask();
        if is_dir {
            mask |= libc::IN_ISDIR;
        }
        RawEvent::new(handle, mask, Some(OsStr::new(name)))
    }
}
