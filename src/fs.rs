use std::{
    collections::HashMap,
    ffi::CString,
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::{
        chownat, fchown, mkdirat, openat, statat, unlinkat, AtFlags, FileType, Gid, Mode, OFlags,
        Uid,
    },
    io::Errno,
};

/// LRU cache of file descriptors for directories.
///
/// Paths are resolved from the current working directory, and missing
/// directories are created on demand.
pub(crate) struct DirFdCache {
    cache: lru::LruCache<PathBuf, OwnedFd>,
}

/// Number of entries in a file descriptor cache.
const FDS_CACHE: usize = 16;

impl DirFdCache {
    pub fn new() -> Self {
        let cache = lru::LruCache::new(NonZeroUsize::new(FDS_CACHE).unwrap());
        DirFdCache { cache }
    }

    /// Get a file descriptor for a directory.
    pub fn get<P>(&mut self, path: P, create: bool) -> Result<BorrowedFd, Errno>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();

        self.cache
            .try_get_or_insert_ref(path, || open_directory(path, create))
            .map(|fd| fd.as_fd())
    }

    /// Drop the descriptors for `path` and any directory below it.
    pub fn forget(&mut self, path: &Path) {
        let stale: Vec<_> = self
            .cache
            .iter()
            .map(|(p, _)| p)
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();

        for p in stale {
            self.cache.pop(&p);
        }
    }
}

/// Return a file descriptor for a directory.
///
/// If `create` is `true`, the directory (and its parents) are created
/// if they don't exist.
fn open_directory(path: &Path, create: bool) -> Result<OwnedFd, Errno> {
    loop {
        let result = openat(
            rustix::fs::CWD,
            path,
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        );

        match result {
            Err(e) if create && e == Errno::NOENT => (),
            r => return r,
        }

        // At this point, the directory does not exist, and we want
        // to create it.

        let file_name = match path.file_name() {
            Some(f) => f,
            None => return Err(Errno::NOENT),
        };

        let owned_slot;
        let parent = match path.parent() {
            Some(p) if p != Path::new("") => {
                owned_slot = open_directory(p, create)?;
                owned_slot.as_fd()
            }

            _ => rustix::fs::CWD,
        };

        match mkdirat(parent, file_name, Mode::from_raw_mode(0o755)) {
            Ok(()) => (),

            // Created by someone else since the `openat` call.
            Err(e) if e == Errno::EXIST => (),

            Err(e) => return Err(e),
        }
    }
}

/// Split `path` in a `(parent, file_name)` pair.
///
/// Returns `None` if the path has no final component, like `/`.
pub(crate) fn split_path(path: &Path) -> Option<(&Path, &Path)> {
    let file_name = path.file_name()?;

    let parent = match path.parent() {
        Some(p) if p != Path::new("") => p,
        _ => Path::new("."),
    };

    Some((parent, Path::new(file_name)))
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum RemovedEntry {
    Directory,
    Other,
}

/// Remove an entry that is in the way of a new one.
///
/// Directories are removed only if they are empty.
pub(crate) fn remove_entry(parent_fd: BorrowedFd, file_name: &Path) -> io::Result<RemovedEntry> {
    let stat = statat(parent_fd, file_name, AtFlags::SYMLINK_NOFOLLOW)?;

    if FileType::from_raw_mode(stat.st_mode) == FileType::Directory {
        unlinkat(parent_fd, file_name, AtFlags::REMOVEDIR)?;
        Ok(RemovedEntry::Directory)
    } else {
        unlinkat(parent_fd, file_name, AtFlags::empty())?;
        Ok(RemovedEntry::Other)
    }
}

/// Open the regular file `file_name` to write it again from the start.
///
/// Returns `None` if there is no regular file (symlinks are not
/// followed), or if it can't be opened.
pub(crate) fn open_existing_file(parent_fd: BorrowedFd, file_name: &Path) -> Option<OwnedFd> {
    let stat = statat(parent_fd, file_name, AtFlags::SYMLINK_NOFOLLOW).ok()?;

    if FileType::from_raw_mode(stat.st_mode) != FileType::RegularFile {
        return None;
    }

    openat(
        parent_fd,
        file_name,
        OFlags::WRONLY | OFlags::TRUNC | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .ok()
}

/// Check if `file_name` is a directory. Symlinks are followed.
pub(crate) fn is_directory(parent_fd: BorrowedFd, file_name: &Path) -> io::Result<bool> {
    let stat = statat(parent_fd, file_name, AtFlags::empty())?;
    Ok(FileType::from_raw_mode(stat.st_mode) == FileType::Directory)
}

pub(crate) fn make_timestamps(mtime: u64) -> rustix::fs::Timestamps {
    let mtime = rustix::fs::Timespec {
        tv_sec: i64::try_from(mtime).unwrap_or_default(),
        tv_nsec: 0,
    };

    rustix::fs::Timestamps {
        last_access: mtime,
        last_modification: mtime,
    }
}

/// Change the owner of an entry. Symlinks are not followed.
pub(crate) fn change_owner(
    parent_fd: BorrowedFd,
    file_name: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<(), Errno> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    chownat(
        parent_fd,
        file_name,
        uid.map(|id| unsafe { Uid::from_raw(id) }),
        gid.map(|id| unsafe { Gid::from_raw(id) }),
        AtFlags::SYMLINK_NOFOLLOW,
    )
}

/// Change the owner of an open file.
pub(crate) fn change_owner_fd(fd: impl AsFd, uid: Option<u32>, gid: Option<u32>) -> Result<(), Errno> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }

    fchown(
        fd,
        uid.map(|id| unsafe { Uid::from_raw(id) }),
        gid.map(|id| unsafe { Gid::from_raw(id) }),
    )
}

/// Check if `file_name` is a directory, without following symlinks.
pub(crate) fn is_real_directory(parent_fd: BorrowedFd, file_name: &Path) -> io::Result<bool> {
    let stat = statat(parent_fd, file_name, AtFlags::SYMLINK_NOFOLLOW)?;
    Ok(FileType::from_raw_mode(stat.st_mode) == FileType::Directory)
}

/// Resolve user and group names to ids, using the system database.
///
/// Results are cached, including failed lookups.
#[derive(Default)]
pub(crate) struct OwnerLookup {
    users: HashMap<String, Option<u32>>,
    groups: HashMap<String, Option<u32>>,
}

/// Upper limit for the buffer used by `getpwnam_r`/`getgrnam_r`.
const MAX_LOOKUP_BUFFER: usize = 1 << 20;

impl OwnerLookup {
    pub fn user(&mut self, name: &str) -> Option<u32> {
        *self
            .users
            .entry(name.to_owned())
            .or_insert_with(|| lookup_user(name))
    }

    pub fn group(&mut self, name: &str) -> Option<u32> {
        *self
            .groups
            .entry(name.to_owned())
            .or_insert_with(|| lookup_group(name))
    }
}

fn lookup_user(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;

    // SAFETY: `passwd` is only read if `getpwnam_r` reports a match, and
    // its strings point into `buffer`, which outlives it.
    with_lookup_buffer(|buffer| unsafe {
        let mut passwd: libc::passwd = std::mem::zeroed();
        let mut result = std::ptr::null_mut();

        let rc = libc::getpwnam_r(
            name.as_ptr(),
            &mut passwd,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut result,
        );

        (rc, (!result.is_null()).then_some(passwd.pw_uid))
    })
}

fn lookup_group(name: &str) -> Option<u32> {
    let name = CString::new(name).ok()?;

    // SAFETY: see `lookup_user`.
    with_lookup_buffer(|buffer| unsafe {
        let mut group: libc::group = std::mem::zeroed();
        let mut result = std::ptr::null_mut();

        let rc = libc::getgrnam_r(
            name.as_ptr(),
            &mut group,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut result,
        );

        (rc, (!result.is_null()).then_some(group.gr_gid))
    })
}

/// Call `f` with a buffer for the `get*nam_r` functions, growing it
/// while they return `ERANGE`.
fn with_lookup_buffer<F>(mut f: F) -> Option<u32>
where
    F: FnMut(&mut [libc::c_char]) -> (libc::c_int, Option<u32>),
{
    let mut buffer = vec![0 as libc::c_char; 1024];

    loop {
        match f(&mut buffer) {
            (libc::ERANGE, _) if buffer.len() < MAX_LOOKUP_BUFFER => {
                buffer.resize(buffer.len() * 2, 0);
            }

            (0, id) => return id,

            _ => return None,
        }
    }
}

/// Name of the user running the process, if it can be resolved.
#[cfg(test)]
pub(crate) fn current_user_name() -> Option<String> {
    let uid = rustix::process::getuid().as_raw();

    let mut buffer = vec![0 as libc::c_char; 4096];

    // SAFETY: `pw_name` points into `buffer`, and it is copied before
    // the buffer is dropped.
    unsafe {
        let mut passwd: libc::passwd = std::mem::zeroed();
        let mut result = std::ptr::null_mut();

        let rc = libc::getpwuid_r(
            uid,
            &mut passwd,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut result,
        );

        if rc != 0 || result.is_null() {
            return None;
        }

        Some(std::ffi::CStr::from_ptr(passwd.pw_name).to_string_lossy().into_owned())
    }
}

#[test]
fn split_paths() {
    assert_eq!(
        split_path(Path::new("/tmp/x/a.txt")),
        Some((Path::new("/tmp/x"), Path::new("a.txt")))
    );

    assert_eq!(
        split_path(Path::new("/tmp/x/")),
        Some((Path::new("/tmp"), Path::new("x")))
    );

    assert_eq!(
        split_path(Path::new("a.txt")),
        Some((Path::new("."), Path::new("a.txt")))
    );

    assert_eq!(split_path(Path::new("/")), None);
}

#[test]
fn create_missing_directories() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("a/b/c");

    let mut cache = DirFdCache::new();
    assert_eq!(cache.get(&path, false).err(), Some(Errno::NOENT));

    cache.get(&path, true).unwrap();
    assert!(path.is_dir());

    cache.forget(root.path());
    assert_eq!(cache.cache.len(), 0);
}

#[test]
fn unknown_owner_names() {
    let mut lookup = OwnerLookup::default();
    assert_eq!(lookup.user("no-such-user-for-ipk-unpack"), None);
    assert_eq!(lookup.group("no-such-group-for-ipk-unpack"), None);
    assert_eq!(lookup.user("nul\0byte"), None);

    if let Some(name) = current_user_name() {
        let uid = rustix::process::getuid().as_raw();
        assert_eq!(lookup.user(&name), Some(uid));
    }
}
