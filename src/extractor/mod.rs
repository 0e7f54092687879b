mod disk;
mod entries;
mod event_handler;
mod outer;

#[cfg(test)]
mod tests;

use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    io::Write,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::paths::PathError;

pub use disk::ExtractFlags;
pub use event_handler::{EventHandler, LogEventHandler, NoEventHandler};

/// Member of the package with the metadata archive.
pub const CONTROL_MEMBER: &str = "control.tar.gz";

/// Member of the package with the files to install.
pub const DATA_MEMBER: &str = "data.tar.gz";

/// File in the metadata archive with the package description.
pub const CONTROL_FILE: &str = "control";

/// A package file in the local filesystem.
pub trait PackageFile {
    /// Path to the package file.
    fn local_filename(&self) -> &Path;
}

impl PackageFile for Path {
    fn local_filename(&self) -> &Path {
        self
    }
}

impl PackageFile for PathBuf {
    fn local_filename(&self) -> &Path {
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Failed to open package '{1}': {0}")]
    OuterOpen(io::Error, PathBuf),

    #[error("Could not find the inner archive '{0}' in package '{1}'.")]
    MemberNotFound(String, PathBuf),

    #[error("Failed to open inner archive '{1}': {0}")]
    InnerOpen(io::Error, String),

    #[error("Failed to read header from archive: {0}")]
    HeaderRead(io::Error),

    #[error("Failed to read data from archive: {0}")]
    DataRead(io::Error),

    #[error("Could not find the file '{0}' in archive.")]
    EntryNotFound(String),

    #[error("Failed to transform path '{}': {1}", .0.display())]
    PathTransform(PathBuf, PathError),

    #[error("Failed to write data to stream: {0}")]
    Write(io::Error),

    #[error("Failed to extract file '{}' to disk: {0}", .1.display())]
    Extract(io::Error, PathBuf),
}

macro_rules! try_io {
    ($variant:ident, $context:expr, $e:expr $(,)?) => {
        $e.map_err(|e| ExtractError::$variant(io::Error::from(e), $context.into()))?
    };
}

// Make visible to mods.
use try_io;

/// Public operation that failed.
///
/// Sent to [`EventHandler::failed`].
#[derive(Copy, Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Operation {
    ControlFile,
    ControlFiles,
    DataFiles,
    DataFileNames,
    MemberFile,
    MemberFiles,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::ControlFile => "control file",
            Operation::ControlFiles => "all control files",
            Operation::DataFiles => "data files",
            Operation::DataFileNames => "data file names",
            Operation::MemberFile => "member file",
            Operation::MemberFiles => "member files",
        })
    }
}

/// Extract files from a package.
///
/// # Examples
///
/// ```no_run
/// # use std::path::Path;
/// # use ipk_unpack::*;
/// let package = Path::new("foo_1.0_all.ipk");
///
/// Extractor::new(package)
///     .event_handler(LogEventHandler)
///     .control_files_to_dir_with_prefix(Path::new("/var/lib/opkg/info"), "foo.")?;
/// # Ok::<(), ExtractError>(())
/// ```
pub struct Extractor<'a, E = NoEventHandler> {
    package: &'a Path,
    event_handler: E,
}

impl<'a> Extractor<'a> {
    pub fn new<P: PackageFile + ?Sized>(package: &'a P) -> Self {
        Extractor {
            package: package.local_filename(),
            event_handler: NoEventHandler,
        }
    }
}

impl<'a, E: EventHandler> Extractor<'a, E> {
    /// Set the handler to receive notifications during the extraction.
    pub fn event_handler<H: EventHandler>(self, event_handler: H) -> Extractor<'a, H> {
        Extractor {
            package: self.package,
            event_handler,
        }
    }

    /// Write the `control` file of the package to `output`.
    pub fn control_file_to_stream<W>(&self, output: &mut W) -> Result<(), ExtractError>
    where
        W: Write + ?Sized,
    {
        self.report(Operation::ControlFile, || {
            self.copy_member_file(CONTROL_MEMBER, CONTROL_FILE, output)
        })
    }

    /// Extract all files of the metadata archive to `dir`.
    pub fn control_files_to_dir(&self, dir: &Path) -> Result<(), ExtractError> {
        self.control_files_to_dir_with_prefix(dir, "")
    }

    /// Extract all files of the metadata archive to `dir`.
    ///
    /// `prefix` is prepended to the name of every extracted file. For
    /// example, with the prefix `foo.` the `control` file is written
    /// to `dir/foo.control`.
    pub fn control_files_to_dir_with_prefix(
        &self,
        dir: &Path,
        prefix: impl AsRef<OsStr>,
    ) -> Result<(), ExtractError> {
        let mut destination = OsString::from(dir);
        destination.push("/");
        destination.push(prefix);

        self.report(Operation::ControlFiles, || {
            self.extract_member(CONTROL_MEMBER, &destination, ExtractFlags::CONTROL)
        })
    }

    /// Extract all files of the data archive to `dir`.
    ///
    /// A `/` is added to `dir` if it does not end with one. An empty
    /// `dir` is kept empty, so files are extracted relative to the
    /// current directory.
    ///
    /// Existing files are replaced.
    pub fn data_files_to_dir(&self, dir: &Path) -> Result<(), ExtractError> {
        let destination = with_trailing_slash(dir);

        self.report(Operation::DataFiles, || {
            self.extract_member(DATA_MEMBER, &destination, ExtractFlags::DATA)
        })
    }

    /// Write the paths of the files in the data archive to `output`,
    /// one per line.
    pub fn data_file_names_to_stream<W>(&self, output: &mut W) -> Result<(), ExtractError>
    where
        W: Write + ?Sized,
    {
        self.report(Operation::DataFileNames, || {
            outer::with_inner_archive(self.package, DATA_MEMBER, &self.event_handler, |archive| {
                entries::list_paths_to_stream(archive, output)
            })
        })
    }

    /// Write the file `name` from the archive in `member` to `output`.
    pub fn member_file_to_stream<W>(
        &self,
        member: &str,
        name: &str,
        output: &mut W,
    ) -> Result<(), ExtractError>
    where
        W: Write + ?Sized,
    {
        self.report(Operation::MemberFile, || {
            self.copy_member_file(member, name, output)
        })
    }

    /// Extract all files from the archive in `member`.
    ///
    /// The path of every file is computed with
    /// [`transform_path`](crate::transform_path), so `destination` is
    /// used as a prefix, without adding a separator.
    pub fn member_to_dir(
        &self,
        member: &str,
        destination: &OsStr,
        flags: ExtractFlags,
    ) -> Result<(), ExtractError> {
        self.report(Operation::MemberFiles, || {
            self.extract_member(member, destination, flags)
        })
    }

    fn copy_member_file<W>(&self, member: &str, name: &str, output: &mut W) -> Result<(), ExtractError>
    where
        W: Write + ?Sized,
    {
        outer::with_inner_archive(self.package, member, &self.event_handler, |archive| {
            entries::copy_entry_to_stream(archive, name, output)
        })
    }

    fn extract_member(
        &self,
        member: &str,
        destination: &OsStr,
        flags: ExtractFlags,
    ) -> Result<(), ExtractError> {
        outer::with_inner_archive(self.package, member, &self.event_handler, |archive| {
            entries::extract_all(archive, destination, flags, &self.event_handler)
        })
    }

    /// Send a failure of `operation` to the event handler.
    fn report<F>(&self, operation: Operation, f: F) -> Result<(), ExtractError>
    where
        F: FnOnce() -> Result<(), ExtractError>,
    {
        let result = f();

        if let Err(e) = &result {
            self.event_handler.failed(self.package, operation, e);
        }

        result
    }
}

/// Append a `/` to `dir` if it is not empty and does not end with one.
fn with_trailing_slash(dir: &Path) -> OsString {
    let mut destination = OsString::from(dir);
    let bytes = dir.as_os_str().as_bytes();

    if !bytes.is_empty() && !bytes.ends_with(b"/") {
        destination.push("/");
    }

    destination
}
