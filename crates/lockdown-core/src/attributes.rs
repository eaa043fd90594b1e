//! Immutable-attribute and permission management.
//!
//! Two independent protection layers are applied to a protected file: the
//! filesystem immutable flag (`FS_IMMUTABLE_FL`, needs `CAP_LINUX_IMMUTABLE`)
//! and read-only POSIX permission bits. Files are always opened with
//! `O_NOFOLLOW` so a symlink planted at a protected name is never followed.

use std::fs::{File, OpenOptions, Permissions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::AttrError;

pub const FS_IMMUTABLE_FL: libc::c_int = 0x0000_0010;

/// Mode applied by [`lock`]: read-only for owner, group and other.
pub const READ_ONLY_MODE: u32 = 0o444;

const WRITE_BITS: u32 = 0o222;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64
}

// _IOR('f', 1, long) / _IOW('f', 2, long) from <linux/fs.h>
const FS_IOC_GETFLAGS: u64 = ioc(IOC_READ, b'f', 1, std::mem::size_of::<libc::c_long>());
const FS_IOC_SETFLAGS: u64 = ioc(IOC_WRITE, b'f', 2, std::mem::size_of::<libc::c_long>());

fn open_nofollow(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
}

fn get_flags(file: &File) -> std::io::Result<libc::c_int> {
    let mut flags: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_GETFLAGS as _, &mut flags) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags)
}

fn set_flags(file: &File, flags: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_SETFLAGS as _, &flags) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn update_immutable(file: &File, path: &Path, immutable: bool) -> Result<(), AttrError> {
    let flags = get_flags(file).map_err(|source| AttrError::GetFlags {
        path: path.to_path_buf(),
        source,
    })?;
    let wanted = if immutable {
        flags | FS_IMMUTABLE_FL
    } else {
        flags & !FS_IMMUTABLE_FL
    };
    if wanted == flags {
        return Ok(());
    }
    set_flags(file, wanted).map_err(|source| AttrError::SetFlags {
        path: path.to_path_buf(),
        source,
    })
}

/// Set the immutable flag and narrow permissions to read-only.
///
/// The permission layer is applied even when the attribute layer fails;
/// nothing already applied is rolled back. Returns the first failure.
pub fn lock(path: &Path) -> Result<(), AttrError> {
    let file = open_nofollow(path).map_err(|source| {
        warn!(path = %path.display(), error = %source, "failed to open file for protection");
        AttrError::Open {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let attr_result = update_immutable(&file, path, true);
    if let Err(err) = &attr_result {
        warn!(path = %path.display(), error = %err, "failed to set immutable flag");
    }

    let perm_result = file
        .set_permissions(Permissions::from_mode(READ_ONLY_MODE))
        .map_err(|source| AttrError::Permissions {
            path: path.to_path_buf(),
            source,
        });
    if let Err(err) = &perm_result {
        warn!(path = %path.display(), error = %err, "failed to set read-only permissions");
    }

    debug!(path = %path.display(), "lock applied");
    attr_result.and(perm_result)
}

/// Clear the immutable flag. Permission bits are left untouched.
pub fn unlock(path: &Path) -> Result<(), AttrError> {
    let file = open_nofollow(path).map_err(|source| AttrError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    update_immutable(&file, path, false).map_err(|err| {
        warn!(path = %path.display(), error = %err, "failed to clear immutable flag");
        err
    })?;
    debug!(path = %path.display(), "cleared immutable flag");
    Ok(())
}

/// Add write permission for owner, group and other, keeping all other bits.
pub fn restore_writable(path: &Path) -> Result<(), AttrError> {
    let file = open_nofollow(path).map_err(|source| AttrError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = file
        .metadata()
        .map_err(|source| AttrError::Permissions {
            path: path.to_path_buf(),
            source,
        })?
        .permissions()
        .mode();
    file.set_permissions(Permissions::from_mode(mode | WRITE_BITS))
        .map_err(|source| {
            warn!(path = %path.display(), error = %source, "failed to restore permissions");
            AttrError::Permissions {
                path: path.to_path_buf(),
                source,
            }
        })
}

pub fn is_immutable(path: &Path) -> std::io::Result<bool> {
    let file = open_nofollow(path)?;
    Ok(get_flags(&file)? & FS_IMMUTABLE_FL != 0)
}

/// Whether the immutable flag can be toggled on files inside `dir`.
///
/// Creates and removes a scratch file; false on filesystems without
/// attribute support or without `CAP_LINUX_IMMUTABLE`. The flag must read
/// back as set, some filesystems accept the ioctl and ignore it.
pub fn immutable_supported(dir: &Path) -> bool {
    let scratch = dir.join(".lockdown-attr-check");
    if File::create(&scratch).is_err() {
        return false;
    }
    let supported = match open_nofollow(&scratch) {
        Ok(file) => {
            let set = update_immutable(&file, &scratch, true).is_ok();
            let effective = set && is_immutable(&scratch).unwrap_or(false);
            if set {
                let _ = update_immutable(&file, &scratch, false);
            }
            effective
        }
        Err(_) => false,
    };
    let _ = std::fs::remove_file(&scratch);
    supported
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[test]
    fn lock_sets_read_only_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.lock");
        fs::write(&path, b"data").unwrap();
        let supported = immutable_supported(dir.path());

        let result = lock(&path);
        assert_eq!(mode_of(&path), READ_ONLY_MODE);
        if supported {
            assert!(result.is_ok());
            assert!(is_immutable(&path).unwrap());
            unlock(&path).unwrap();
        }
    }

    #[test]
    fn lock_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.lock");
        fs::write(&path, b"").unwrap();
        let supported = immutable_supported(dir.path());

        let _ = lock(&path);
        let first_mode = mode_of(&path);
        let first_attr = is_immutable(&path).unwrap_or(false);

        let _ = unlock(&path);
        let second = lock(&path);
        assert_eq!(mode_of(&path), first_mode);
        assert_eq!(is_immutable(&path).unwrap_or(false), first_attr);
        if supported {
            assert!(second.is_ok());
            unlock(&path).unwrap();
        }
    }

    #[test]
    fn unlock_leaves_permissions_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.lock");
        fs::write(&path, b"").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o400)).unwrap();
        if immutable_supported(dir.path()) {
            unlock(&path).unwrap();
        }
        assert_eq!(mode_of(&path), 0o400);
    }

    #[test]
    fn restore_writable_adds_write_bits_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.lock");
        fs::write(&path, b"").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o550)).unwrap();

        restore_writable(&path).unwrap();
        assert_eq!(mode_of(&path), 0o772);

        restore_writable(&path).unwrap();
        assert_eq!(mode_of(&path), 0o772);
    }

    #[test]
    fn symlinks_are_never_followed() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        fs::write(&target, b"keep me writable").unwrap();
        fs::set_permissions(&target, Permissions::from_mode(0o644)).unwrap();
        let link = dir.path().join("evil.lock");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(lock(&link), Err(AttrError::Open { .. })));
        assert_eq!(mode_of(&target), 0o644);
    }

    #[test]
    fn support_check_leaves_no_scratch_file() {
        let dir = tempdir().unwrap();
        let _ = immutable_supported(dir.path());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!immutable_supported(&dir.path().join("absent")));
    }

    #[test]
    fn missing_file_reports_open_failure() {
        let dir = tempdir().unwrap();
        let err = lock(&dir.path().join("absent.lock")).unwrap_err();
        assert!(matches!(err, AttrError::Open { .. }));
    }
}
