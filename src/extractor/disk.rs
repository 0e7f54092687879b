use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{self, ErrorKind::NotFound, Read},
    path::{Path, PathBuf},
};

use rustix::{
    fd::BorrowedFd,
    fs::{self, AtFlags, Mode, OFlags},
    io::Errno,
};

use crate::fs::{
    change_owner, change_owner_fd, is_directory, is_real_directory, make_timestamps,
    open_existing_file, remove_entry, split_path, DirFdCache, OwnerLookup, RemovedEntry,
};

use super::{EventHandler, ExtractError};

/// Metadata to restore when files are extracted to the filesystem.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractFlags {
    /// Set the user and group of the files.
    pub owner: bool,

    /// Set the permission bits, including the SUID, SGID and sticky bits.
    ///
    /// If `false`, files are created with the permissions in the archive,
    /// restricted by the umask.
    pub permissions: bool,

    /// Set the modification time of the files.
    pub timestamps: bool,

    /// Remove existing files before writing the new ones.
    pub unlink: bool,
}

impl ExtractFlags {
    /// Flags to extract the metadata archive.
    pub const CONTROL: ExtractFlags = ExtractFlags {
        owner: true,
        permissions: true,
        timestamps: true,
        unlink: false,
    };

    /// Flags to extract the data archive.
    pub const DATA: ExtractFlags = ExtractFlags {
        unlink: true,
        ..ExtractFlags::CONTROL
    };
}

struct InvalidEntryType(tar::EntryType);

impl fmt::Display for InvalidEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid entry type: {:?}", self.0)
    }
}

/// Metadata of an entry, filtered by the [`ExtractFlags`].
#[derive(Copy, Clone, Debug)]
struct EntryMetadata {
    mode: u32,
    mtime: u64,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl EntryMetadata {
    fn mode(&self) -> Mode {
        Mode::from_raw_mode(self.mode & 0o7777)
    }
}

/// Write archive entries to the filesystem.
///
/// The metadata of the directories is applied when [`finish`] is called,
/// or when the instance is dropped. It can't be done before because
/// extracting new files updates the mtime of the parent directory.
///
/// [`finish`]: DiskWriter::finish
pub(crate) struct DiskWriter<'a, E> {
    flags: ExtractFlags,
    event_handler: &'a E,
    dirs_cache: DirFdCache,
    dirs_metadata: BTreeMap<PathBuf, EntryMetadata>,
    owners: OwnerLookup,
}

impl<'a, E: EventHandler> DiskWriter<'a, E> {
    pub fn new(flags: ExtractFlags, event_handler: &'a E) -> Self {
        DiskWriter {
            flags,
            event_handler,
            dirs_cache: DirFdCache::new(),
            dirs_metadata: BTreeMap::new(),
            owners: OwnerLookup::default(),
        }
    }

    /// Write `entry` to `path`.
    ///
    /// `hardlink` is the path of the file to link to, if `entry` is a
    /// hard link.
    pub fn write<R: Read>(
        &mut self,
        path: &Path,
        hardlink: Option<&Path>,
        entry: &mut tar::Entry<R>,
    ) -> Result<(), ExtractError> {
        let (parent, file_name) = match split_path(path) {
            Some(p) => p,
            None => {
                self.event_handler
                    .entry_skipped(path, &"The path has no file name.");
                return Ok(());
            }
        };

        let result = match entry.header().entry_type() {
            tar::EntryType::Directory => self.write_dir(path, parent, file_name, entry.header()),

            tar::EntryType::Regular | tar::EntryType::Continuous => {
                self.write_regular(path, parent, file_name, entry)
            }

            tar::EntryType::Symlink => self.write_symlink(path, parent, file_name, entry),

            tar::EntryType::Link => match hardlink {
                Some(target) => self.write_hardlink(path, parent, file_name, target),
                None => Err(io::Error::new(NotFound, "Missing link")),
            },

            other => {
                self.event_handler
                    .entry_skipped(path, &InvalidEntryType(other));
                Ok(())
            }
        };

        result.map_err(|e| ExtractError::Extract(e, path.to_owned()))
    }

    /// Apply the metadata of the directories, and release the writer.
    pub fn finish(mut self) -> Result<(), ExtractError> {
        self.update_directories()
    }

    fn write_dir(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &Path,
        header: &tar::Header,
    ) -> io::Result<()> {
        let metadata = self.entry_metadata(header);

        // Permissions are restored after all files are written.
        let mode = if self.flags.permissions {
            Mode::RWXU
        } else {
            Mode::from_raw_mode(metadata.mode & 0o777)
        };

        let parent_fd = self.dirs_cache.get(parent, true)?;

        loop {
            match fs::mkdirat(parent_fd, file_name, mode) {
                Ok(()) => break,

                Err(e) if e == Errno::EXIST => {
                    if is_real_directory(parent_fd, file_name)? {
                        break;
                    }

                    // Symlinks to directories are kept, and their targets
                    // are not modified.
                    if is_directory(parent_fd, file_name).unwrap_or(false) {
                        return Ok(());
                    }

                    remove_entry(parent_fd, file_name)?;
                }

                Err(e) => return Err(e.into()),
            }
        }

        self.dirs_metadata.insert(path.to_owned(), metadata);

        Ok(())
    }

    fn write_regular(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &Path,
        entry: &mut tar::Entry<impl Read>,
    ) -> io::Result<()> {
        let metadata = self.entry_metadata(entry.header());

        let mode = if self.flags.permissions {
            Mode::RUSR | Mode::WUSR
        } else {
            Mode::from_raw_mode(metadata.mode & 0o777)
        };

        let flags = self.flags;
        let parent_fd = self.dirs_cache.get(parent, true)?;

        if flags.unlink {
            let _ = fs::unlinkat(parent_fd, file_name, AtFlags::empty());
        }

        // Without `unlink`, existing files are rewritten in place, so
        // other hard links to them see the new data.
        let existing = if flags.unlink {
            None
        } else {
            open_existing_file(parent_fd, file_name)
        };

        let (output, removed) = match existing {
            Some(fd) => (fd, None),
            None => create_entry(parent_fd, file_name, || {
                fs::openat(
                    parent_fd,
                    file_name,
                    OFlags::CREATE | OFlags::EXCL | OFlags::WRONLY | OFlags::CLOEXEC,
                    mode,
                )
            })?,
        };

        let mut output = File::from(output);
        io::copy(entry, &mut output)?;

        if let Err(e) = change_owner_fd(&output, metadata.uid, metadata.gid) {
            self.event_handler.owner_not_changed(path, &e.into());
        }

        if flags.permissions {
            fs::fchmod(&output, metadata.mode())?;
        }

        if flags.timestamps {
            fs::futimens(&output, &make_timestamps(metadata.mtime))?;
        }

        drop(output);

        if removed == Some(RemovedEntry::Directory) {
            self.forget_directory(path);
        }

        Ok(())
    }

    /// Create a symbolic link. The target is written as it appears in
    /// the archive.
    fn write_symlink(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &Path,
        entry: &mut tar::Entry<impl Read>,
    ) -> io::Result<()> {
        let target = match entry.link_name()? {
            Some(target) => target.into_owned(),
            None => return Err(io::Error::new(NotFound, "Missing link")),
        };

        let metadata = self.entry_metadata(entry.header());

        let flags = self.flags;
        let parent_fd = self.dirs_cache.get(parent, true)?;

        if flags.unlink {
            let _ = fs::unlinkat(parent_fd, file_name, AtFlags::empty());
        }

        let ((), removed) = create_entry(parent_fd, file_name, || {
            fs::symlinkat(target.as_path(), parent_fd, file_name)
        })?;

        if let Err(e) = change_owner(parent_fd, file_name, metadata.uid, metadata.gid) {
            self.event_handler.owner_not_changed(path, &e.into());
        }

        if flags.timestamps {
            let mtime = make_timestamps(metadata.mtime);
            fs::utimensat(parent_fd, file_name, &mtime, AtFlags::SYMLINK_NOFOLLOW)?;
        }

        if removed == Some(RemovedEntry::Directory) {
            self.forget_directory(path);
        }

        Ok(())
    }

    /// Create a hard link to `target`, which is already transformed to
    /// a path in the filesystem.
    fn write_hardlink(
        &mut self,
        path: &Path,
        parent: &Path,
        file_name: &Path,
        target: &Path,
    ) -> io::Result<()> {
        let flags = self.flags;
        let parent_fd = self.dirs_cache.get(parent, true)?;

        if flags.unlink {
            let _ = fs::unlinkat(parent_fd, file_name, AtFlags::empty());
        }

        let ((), removed) = create_entry(parent_fd, file_name, || {
            fs::linkat(
                rustix::fs::CWD,
                target,
                parent_fd,
                file_name,
                AtFlags::empty(),
            )
        })?;

        if removed == Some(RemovedEntry::Directory) {
            self.forget_directory(path);
        }

        Ok(())
    }

    /// Return the metadata of the entry that has to be restored.
    ///
    /// Numeric fields that can't be parsed (usually, blank fields) are
    /// read as `0`.
    fn entry_metadata(&mut self, header: &tar::Header) -> EntryMetadata {
        let (uid, gid) = if self.flags.owner {
            self.entry_owner(header)
        } else {
            (None, None)
        };

        EntryMetadata {
            mode: header.mode().unwrap_or(0),
            mtime: header.mtime().unwrap_or(0),
            uid,
            gid,
        }
    }

    /// Return the `uid, gid` of the entry.
    ///
    /// User and group names are resolved in the system database. If they
    /// are not found, the numeric ids are used. Ids that can't be parsed
    /// are ignored.
    fn entry_owner(&mut self, header: &tar::Header) -> (Option<u32>, Option<u32>) {
        let uid = match header.username() {
            Ok(Some(name)) if !name.is_empty() => self.owners.user(name),
            _ => None,
        };

        let gid = match header.groupname() {
            Ok(Some(name)) if !name.is_empty() => self.owners.group(name),
            _ => None,
        };

        let uid = uid.or_else(|| header.uid().ok().and_then(|id| id.try_into().ok()));
        let gid = gid.or_else(|| header.gid().ok().and_then(|id| id.try_into().ok()));

        (uid.filter(|&id| id > 0), gid.filter(|&id| id > 0))
    }

    /// Discard the pending metadata (and cached descriptors) of a
    /// directory that was removed.
    fn forget_directory(&mut self, path: &Path) {
        self.dirs_metadata.retain(|p, _| !p.starts_with(path));
        self.dirs_cache.forget(path);
    }

    /// Update the owner, mode, and mtime of the extracted directories.
    ///
    /// Directories are updated before their parents.
    fn update_directories(&mut self) -> Result<(), ExtractError> {
        let flags = self.flags;
        let dirs_metadata = std::mem::take(&mut self.dirs_metadata);

        for (path, metadata) in dirs_metadata.into_iter().rev() {
            let (parent_path, file_name) = match split_path(&path) {
                Some(p) => p,
                None => continue,
            };

            let mut update = || -> io::Result<()> {
                let parent = self.dirs_cache.get(parent_path, false)?;

                if let Err(e) = change_owner(parent, file_name, metadata.uid, metadata.gid) {
                    self.event_handler.owner_not_changed(&path, &e.into());
                }

                if flags.permissions {
                    fs::chmodat(parent, file_name, metadata.mode(), AtFlags::empty())?;
                }

                if flags.timestamps {
                    let mtime = make_timestamps(metadata.mtime);
                    fs::utimensat(parent, file_name, &mtime, AtFlags::SYMLINK_NOFOLLOW)?;
                }

                Ok(())
            };

            // Ignore NotFound errors. Those may happen if the directory
            // was replaced by a later entry.
            if let Err(e) = update() {
                if e.kind() != NotFound {
                    return Err(ExtractError::Extract(e, path));
                }
            }
        }

        Ok(())
    }
}

impl<E> Drop for DiskWriter<'_, E> {
    fn drop(&mut self) {
        if self.dirs_metadata.is_empty() {
            return;
        }

        // Extraction was interrupted. Restore what we can.
        let pending = std::mem::take(&mut self.dirs_metadata);
        let flags = self.flags;

        for (path, metadata) in pending.into_iter().rev() {
            if let Some((parent, file_name)) = split_path(&path) {
                if let Ok(parent) = self.dirs_cache.get(parent, false) {
                    let _ = change_owner(parent, file_name, metadata.uid, metadata.gid);

                    if flags.permissions {
                        let _ = fs::chmodat(parent, file_name, metadata.mode(), AtFlags::empty());
                    }
                }
            }
        }
    }
}

/// Create a new entry with `create`.
///
/// If there is something in the way, it is removed and `create` is called
/// again. Returns the kind of the removed entry, if any.
fn create_entry<T, F>(
    parent_fd: BorrowedFd,
    file_name: &Path,
    mut create: F,
) -> io::Result<(T, Option<RemovedEntry>)>
where
    F: FnMut() -> Result<T, Errno>,
{
    let mut removed = None;

    loop {
        match create() {
            Ok(t) => return Ok((t, removed)),

            Err(e) if e == Errno::EXIST => {
                removed = Some(remove_entry(parent_fd, file_name)?);
            }

            Err(e) => return Err(e.into()),
        }
    }
}
