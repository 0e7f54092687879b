use std::{fmt::Display, io, path::Path};

use super::{ExtractError, Operation};

/// Handler to receive notifications for events during the extraction.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler {
    /// The member `member` was found in the package, and its archive is
    /// going to be read.
    fn member_found(&self, package: &Path, member: &str) {}

    /// An entry of the archive is going to be written to `path`.
    fn entry_extracting(&self, path: &Path) {}

    /// The entry in `path` is a hard link to `target`.
    ///
    /// `target` is transformed in the same way as the entry path.
    fn entry_hardlink(&self, path: &Path, target: &Path) {}

    /// The entry in `path` is a symbolic link to `target`.
    ///
    /// `target` is written as it appears in the archive.
    fn entry_symlink(&self, path: &Path, target: &Path) {}

    /// An entry in the archive is skipped.
    ///
    /// For example, if it is an unsupported entry type, like a block device.
    fn entry_skipped(&self, path: &Path, cause: &dyn Display) {}

    /// The owner of `path` could not be changed. The extraction continues.
    fn owner_not_changed(&self, path: &Path, error: &io::Error) {}

    /// `operation` failed for `package`.
    ///
    /// Invoked once, before the error is returned to the caller.
    fn failed(&self, package: &Path, operation: Operation, error: &ExtractError) {}
}

impl<T: EventHandler + ?Sized> EventHandler for &T {
    fn member_found(&self, package: &Path, member: &str) {
        (**self).member_found(package, member)
    }

    fn entry_extracting(&self, path: &Path) {
        (**self).entry_extracting(path)
    }

    fn entry_hardlink(&self, path: &Path, target: &Path) {
        (**self).entry_hardlink(path, target)
    }

    fn entry_symlink(&self, path: &Path, target: &Path) {
        (**self).entry_symlink(path, target)
    }

    fn entry_skipped(&self, path: &Path, cause: &dyn Display) {
        (**self).entry_skipped(path, cause)
    }

    fn owner_not_changed(&self, path: &Path, error: &io::Error) {
        (**self).owner_not_changed(path, error)
    }

    fn failed(&self, package: &Path, operation: Operation, error: &ExtractError) {
        (**self).failed(package, operation, error)
    }
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}

/// [`EventHandler`] instance to send events to the [`log`] crate.
///
/// Failures are logged with the `ERROR` level, and everything else with
/// the `DEBUG` level.
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn member_found(&self, package: &Path, member: &str) {
        log::debug!("Found '{member}' in package '{}'.", package.display());
    }

    fn entry_extracting(&self, path: &Path) {
        log::debug!("Extracting '{}'.", path.display());
    }

    fn entry_hardlink(&self, _: &Path, target: &Path) {
        log::debug!("... hardlink to '{}'.", target.display());
    }

    fn entry_symlink(&self, _: &Path, target: &Path) {
        log::debug!("... symlink to '{}'.", target.display());
    }

    fn entry_skipped(&self, path: &Path, cause: &dyn Display) {
        log::debug!("Skipped '{}': {cause}", path.display());
    }

    fn owner_not_changed(&self, path: &Path, error: &io::Error) {
        log::debug!("Can't change owner of '{}': {error}", path.display());
    }

    fn failed(&self, package: &Path, operation: Operation, error: &ExtractError) {
        log::error!(
            "Failed to extract {operation} from package '{}': {error}",
            package.display()
        );
    }
}
