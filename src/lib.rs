//! Extract the contents of ipk packages.
//!
//! An ipk package is an `ar` archive with a few members. The members
//! `control.tar.gz` and `data.tar.gz` are gzip-compressed tarballs with
//! the package metadata and the files to install.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use ipk_unpack::{Extractor, LogEventHandler};
//!
//! let package = Path::new("/tmp/foo_1.0_all.ipk");
//! let extractor = Extractor::new(package).event_handler(LogEventHandler);
//!
//! let mut control = Vec::new();
//! extractor.control_file_to_stream(&mut control)?;
//!
//! extractor.data_files_to_dir(Path::new("/tmp/rootfs"))?;
//! # Ok::<(), ipk_unpack::ExtractError>(())
//! ```

mod extractor;
mod fs;
mod paths;

#[cfg(test)]
mod testutil;

pub use extractor::{
    EventHandler, ExtractError, ExtractFlags, Extractor, LogEventHandler, NoEventHandler,
    Operation, PackageFile, CONTROL_FILE, CONTROL_MEMBER, DATA_MEMBER,
};

pub use paths::{transform_path, PathError};
