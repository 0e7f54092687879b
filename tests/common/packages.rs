use std::{
    cell::RefCell,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use flate2::write::GzEncoder;

/// Builder for `ar` packages.
#[derive(Default)]
pub struct Package {
    members: Vec<(String, Vec<u8>)>,
}

impl Package {
    pub fn new() -> Self {
        Package::default()
    }

    /// Add the usual `debian-binary` member.
    pub fn debian_binary(self) -> Self {
        self.member("debian-binary", b"2.0\n".to_vec())
    }

    pub fn member(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.members.push((name.to_owned(), data.into()));
        self
    }

    pub fn control(self, archive: Tarball) -> Self {
        self.member("control.tar.gz", archive.build())
    }

    pub fn data(self, archive: Tarball) -> Self {
        self.member("data.tar.gz", archive.build())
    }

    /// Write the package to `dir/name`.
    pub fn write(self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut builder = ar::Builder::new(File::create(&path).unwrap());

        for (identifier, data) in &self.members {
            let header = ar::Header::new(identifier.as_bytes().to_vec(), data.len() as u64);
            builder.append(&header, &data[..]).unwrap();
        }

        path
    }
}

/// Builder for gzip tarballs.
pub struct Tarball {
    buffer: SharedBuffer,
    archive: tar::Builder<GzEncoder<SharedBuffer>>,
    mtime: u64,
    blank_numeric_fields: bool,
}

#[derive(Clone)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Tarball {
    pub fn new() -> Self {
        let buffer = SharedBuffer(Rc::new(Vec::with_capacity(4096).into()));

        Tarball {
            archive: tar::Builder::new(GzEncoder::new(buffer.clone(), Default::default())),
            buffer,
            mtime: 0,
            blank_numeric_fields: false,
        }
    }

    pub fn build(mut self) -> Vec<u8> {
        self.archive.finish().unwrap();
        self.archive.into_inner().unwrap().finish().unwrap();

        self.buffer.0.take()
    }

    /// Modification time for the next entries.
    pub fn mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    /// Leave the uid, gid and mtime fields of the next entries blank.
    pub fn blank_numeric_fields(mut self) -> Self {
        self.blank_numeric_fields = true;
        self
    }

    pub fn directory(self, path: &str) -> Self {
        self.directory_with_mode(path, 0o755)
    }

    pub fn directory_with_mode(mut self, path: &str, mode: u32) -> Self {
        let mut header = self.header(tar::EntryType::dir(), mode);
        set_raw_path(&mut header, path);
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    pub fn regular(self, path: &str, data: impl AsRef<[u8]>) -> Self {
        self.regular_with_mode(path, 0o644, data)
    }

    pub fn regular_with_mode(mut self, path: &str, mode: u32, data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut header = self.header(tar::EntryType::file(), mode);
        set_raw_path(&mut header, path);
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.archive.append(&header, data).unwrap();
        self
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.link(tar::EntryType::symlink(), path, target)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        self.link(tar::EntryType::hard_link(), path, target)
    }

    pub fn fifo(mut self, path: &str) -> Self {
        let mut header = self.header(tar::EntryType::fifo(), 0o644);
        set_raw_path(&mut header, path);
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    fn link(mut self, kind: tar::EntryType, path: &str, target: &str) -> Self {
        let mut header = self.header(kind, 0o777);
        set_raw_path(&mut header, path);
        set_raw(&mut header.as_old_mut().linkname, target);
        header.set_size(0);
        header.set_cksum();
        self.archive.append(&header, &b""[..]).unwrap();
        self
    }

    fn header(&self, kind: tar::EntryType, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(mode);

        if !self.blank_numeric_fields {
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(self.mtime);
        }

        header
    }
}

/// Write `path` as-is in the header.
///
/// `Header::set_path` normalizes the path (`./a` is stored as `a`), and
/// rejects paths with `..`.
fn set_raw_path(header: &mut tar::Header, path: &str) {
    set_raw(&mut header.as_old_mut().name, path);
}

fn set_raw(field: &mut [u8], value: &str) {
    field.fill(0);
    field[..value.len()].copy_from_slice(value.as_bytes());
}
