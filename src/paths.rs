use std::{
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Component, Path, PathBuf},
};

/// Errors from [`transform_path`].
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PathError {
    #[error("Empty path.")]
    Empty,

    #[error("Found '..' in the path.")]
    ParentDir,
}

/// Strip the leading `./` pairs, and then the leading `/` characters.
pub(crate) fn strip_leading(name: &[u8]) -> &[u8] {
    let mut name = name;

    while let Some(rest) = name.strip_prefix(b"./") {
        name = rest;
    }

    while let Some(rest) = name.strip_prefix(b"/") {
        name = rest;
    }

    name
}

/// Compute the path to write an archive entry named `name`.
///
/// The leading `./` and `/` are removed from `name`, and the result is
/// appended to `destination`. No separator is added between them, so
/// `destination` can end with a prefix for the file names (like
/// `/var/lib/opkg/info/foo.`).
///
/// Returns `None` if the entry is the destination itself (`.`), and
/// must not be extracted.
///
/// ```
/// # use std::{ffi::OsStr, path::PathBuf};
/// # use ipk_unpack::transform_path;
/// let path = transform_path(OsStr::new("/tmp/pkg."), OsStr::new("././control"));
/// assert_eq!(path, Ok(Some(PathBuf::from("/tmp/pkg.control"))));
///
/// assert_eq!(transform_path(OsStr::new("/tmp/"), OsStr::new("./.")), Ok(None));
/// ```
pub fn transform_path(destination: &OsStr, name: &OsStr) -> Result<Option<PathBuf>, PathError> {
    let name = strip_leading(name.as_bytes());

    if name == b"." {
        return Ok(None);
    }

    // Don't trust entries with `..` in the path.
    if Path::new(OsStr::from_bytes(name))
        .components()
        .any(|c| c == Component::ParentDir)
    {
        return Err(PathError::ParentDir);
    }

    let mut path = Vec::with_capacity(destination.len() + name.len());
    path.extend_from_slice(destination.as_bytes());
    path.extend_from_slice(name);

    if path.is_empty() {
        return Err(PathError::Empty);
    }

    Ok(Some(OsString::from_vec(path).into()))
}
