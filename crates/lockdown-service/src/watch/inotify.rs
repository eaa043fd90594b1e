//! Thin inotify binding over `libc`.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use super::{WatchBackend, WatchHandle};

/// Events requested for every watched directory.
pub const WATCH_MASK: u32 =
    libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_MOVED_TO | libc::IN_MODIFY;

const EVENT_HEADER_LEN: usize = std::mem::size_of::<libc::inotify_event>();

/// Room for roughly a thousand events with short names.
pub const EVENT_BUF_LEN: usize = 1024 * (EVENT_HEADER_LEN + 16);

/// One decoded `struct inotify_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub handle: WatchHandle,
    pub mask: u32,
    pub name: Option<OsString>,
}

impl RawEvent {
    pub fn new(handle: WatchHandle, mask: u32, name: Option<&OsStr>) -> Self {
        Self {
            handle,
            mask,
            name: name.map(OsStr::to_os_string),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mask & libc::IN_ISDIR != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.mask & libc::IN_Q_OVERFLOW != 0
    }
}

pub struct Inotify {
    fd: OwnedFd,
}

impl Inotify {
    pub fn init() -> io::Result<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Read one batch of pending events. Returns `WouldBlock` when the queue
    /// is empty.
    pub fn read_events(&self, buf: &mut [u8]) -> io::Result<Vec<RawEvent>> {
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(decode_events(&buf[..n as usize]))
    }
}

impl AsRawFd for Inotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl WatchBackend for Inotify {
    fn add_watch(&self, dir: &Path) -> io::Result<WatchHandle> {
        let c_path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), WATCH_MASK) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WatchHandle(wd))
    }
}

/// Decode a buffer filled by `read(2)` on an inotify descriptor.
pub fn decode_events(buf: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset + EVENT_HEADER_LEN <= buf.len() {
        let header: libc::inotify_event =
            unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const libc::inotify_event) };
        let name_start = offset + EVENT_HEADER_LEN;
        let name_end = (name_start + header.len as usize).min(buf.len());
        let name = buf[name_start..name_end]
            .split(|b| *b == 0)
            .next()
            .filter(|n| !n.is_empty())
            .map(|n| OsString::from_vec(n.to_vec()));
        events.push(RawEvent {
            handle: WatchHandle(header.wd),
            mask: header.mask,
            name,
        });
        offset = name_end;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(wd: i32, mask: u32, name: &str) -> Vec<u8> {
        let mut padded = name.as_bytes().to_vec();
        if !padded.is_empty() {
            padded.push(0);
            while padded.len() % 16 != 0 {
                padded.push(0);
            }
        }
        let header = libc::inotify_event {
            wd,
            mask,
            cookie: 0,
            len: padded.len() as u32,
        };
        let mut out = vec![0u8; EVENT_HEADER_LEN];
        unsafe {
            std::ptr::write_unaligned(out.as_mut_ptr() as *mut libc::inotify_event, header);
        }
        out.extend(padded);
        out
    }

    #[test]
    fn decodes_padded_names_and_nameless_events() {
        let mut buf = encode(3, libc::IN_CREATE, "a.lock");
        buf.extend(encode(4, libc::IN_CREATE | libc::IN_ISDIR, "sub"));
        buf.extend(encode(3, libc::IN_IGNORED, ""));

        let events = decode_events(&buf);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].handle, WatchHandle(3));
        assert_eq!(events[0].name.as_deref(), Some(OsStr::new("a.lock")));
        assert!(!events[0].is_dir());
        assert!(events[1].is_dir());
        assert_eq!(events[2].name, None);
    }

    #[test]
    fn real_descriptor_reports_creation() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::init().unwrap();
        let handle = inotify.add_watch(dir.path()).unwrap();

        let mut buf = vec![0u8; EVENT_BUF_LEN];
        assert_eq!(
            inotify.read_events(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        std::fs::write(dir.path().join("x.lock"), b"").unwrap();
        let events = inotify.read_events(&mut buf).unwrap();
        assert!(events
            .iter()
            .any(|e| e.handle == handle
                && e.mask & libc::IN_CREATE != 0
                && e.name.as_deref() == Some(OsStr::new("x.lock"))));
    }
}
