use std::{
    io::Write,
    path::{Path, PathBuf},
};

use flate2::{write::GzEncoder, Compression};

/// Build tarballs with names written as-is in the headers.
pub(crate) struct TarBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl TarBuilder {
    pub fn new() -> Self {
        TarBuilder {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn directory(self, name: &str) -> Self {
        self.append(name, tar::EntryType::Directory, 0o755, b"")
    }

    pub fn regular(self, name: &str, data: impl AsRef<[u8]>) -> Self {
        self.append(name, tar::EntryType::Regular, 0o644, data.as_ref())
    }

    fn append(mut self, name: &str, kind: tar::EntryType, mode: u32, data: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(kind);
        header.set_mode(mode);
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.builder.append(&header, data).unwrap();
        self
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.tar()).unwrap();
        encoder.finish().unwrap()
    }
}

/// Write an `ar` archive with `members` to `dir/name`.
pub(crate) fn write_package(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let mut builder = ar::Builder::new(std::fs::File::create(&path).unwrap());

    for (identifier, data) in members {
        let header = ar::Header::new(identifier.as_bytes().to_vec(), data.len() as u64);
        builder.append(&header, *data).unwrap();
    }

    path
}
