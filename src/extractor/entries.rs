use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::paths::{strip_leading, transform_path};

use super::{disk::DiskWriter, outer::EXTRACT_BUFFER_LEN, EventHandler, ExtractError, ExtractFlags};

/// Copy the data of the entry `name` to `output`.
///
/// Entries are compared with `name` after removing the leading `./`
/// pairs, so `./control` matches `control`.
pub(crate) fn copy_entry_to_stream<R, W>(
    archive: &mut tar::Archive<R>,
    name: &str,
    output: &mut W,
) -> Result<(), ExtractError>
where
    R: Read,
    W: Write + ?Sized,
{
    let entries = archive.entries().map_err(ExtractError::HeaderRead)?;

    for entry in entries {
        let mut entry = entry.map_err(ExtractError::HeaderRead)?;

        if entry_matches(&entry.path_bytes(), name) {
            return copy_data(&mut entry, output).map(drop);
        }

        // The data of this entry is skipped when the next header is read.
    }

    Err(ExtractError::EntryNotFound(name.to_owned()))
}

fn entry_matches(path: &[u8], name: &str) -> bool {
    path == name.as_bytes() || strip_leading(path) == name.as_bytes()
}

/// Copy all data from `input` to `output`.
///
/// Returns the number of bytes copied.
pub(crate) fn copy_data<R, W>(input: &mut R, output: &mut W) -> Result<u64, ExtractError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; EXTRACT_BUFFER_LEN];
    let mut copied = 0;

    loop {
        let n = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractError::DataRead(e)),
        };

        output
            .write_all(&buffer[..n])
            .map_err(ExtractError::Write)?;

        copied += n as u64;
    }

    output.flush().map_err(ExtractError::Write)?;

    Ok(copied)
}

/// Write the path of every entry to `output`, one per line.
pub(crate) fn list_paths_to_stream<R, W>(
    archive: &mut tar::Archive<R>,
    output: &mut W,
) -> Result<(), ExtractError>
where
    R: Read,
    W: Write + ?Sized,
{
    let entries = archive.entries().map_err(ExtractError::HeaderRead)?;

    for entry in entries {
        let entry = entry.map_err(ExtractError::HeaderRead)?;

        output
            .write_all(&entry.path_bytes())
            .and_then(|_| output.write_all(b"\n"))
            .map_err(ExtractError::Write)?;
    }

    output.flush().map_err(ExtractError::Write)
}

/// Extract every entry to the filesystem.
///
/// The path of every entry (and the target of hard links) is computed
/// with [`transform_path`].
pub(crate) fn extract_all<R, E>(
    archive: &mut tar::Archive<R>,
    destination: &OsStr,
    flags: ExtractFlags,
    event_handler: &E,
) -> Result<(), ExtractError>
where
    R: Read,
    E: EventHandler,
{
    let mut disk = DiskWriter::new(flags, event_handler);

    let entries = archive.entries().map_err(ExtractError::HeaderRead)?;

    for entry in entries {
        let mut entry = entry.map_err(ExtractError::HeaderRead)?;

        let path = match transform(destination, &entry.path_bytes())? {
            Some(path) => path,
            None => continue,
        };

        event_handler.entry_extracting(&path);

        let hardlink = if entry.header().entry_type().is_hard_link() {
            let target = match entry.link_name_bytes() {
                Some(target) => transform(destination, &target)?,
                None => None,
            };

            // Links without a target, or to the destination itself,
            // can't be created.
            let target = target.ok_or_else(|| {
                ExtractError::Extract(
                    io::Error::new(io::ErrorKind::InvalidData, "Invalid hard link target."),
                    path.clone(),
                )
            })?;

            event_handler.entry_hardlink(&path, &target);
            Some(target)
        } else {
            None
        };

        if let Some(target) = entry.link_name_bytes() {
            if entry.header().entry_type().is_symlink() {
                event_handler.entry_symlink(&path, &bytes_to_path(&target));
            }
        }

        disk.write(&path, hardlink.as_deref(), &mut entry)?;
    }

    disk.finish()
}

fn transform(destination: &OsStr, name: &[u8]) -> Result<Option<PathBuf>, ExtractError> {
    transform_path(destination, OsStr::from_bytes(name))
        .map_err(|e| ExtractError::PathTransform(bytes_to_path(name), e))
}

fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    Path::new(OsStr::from_bytes(bytes)).to_owned()
}
