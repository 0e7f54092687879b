use std::{
    ffi::OsStr,
    io::{self, Cursor, Read, Write},
};

use crate::testutil::{write_package, TarBuilder};

use super::{
    entries, outer::live, with_trailing_slash, ExtractError, ExtractFlags, Extractor,
    NoEventHandler,
};

fn archive(data: Vec<u8>) -> tar::Archive<Cursor<Vec<u8>>> {
    tar::Archive::new(Cursor::new(data))
}

#[test]
fn copy_named_entry() {
    let data = TarBuilder::new()
        .directory("./")
        .regular("./conffiles", "/etc/foo.conf\n")
        .regular("./control", "Package: foo\n")
        .regular("./postinst", "#!/bin/sh\n")
        .tar();

    let mut output = Vec::new();
    entries::copy_entry_to_stream(&mut archive(data), "control", &mut output).unwrap();

    assert_eq!(output, b"Package: foo\n");
}

#[test]
fn copy_missing_entry() {
    let data = TarBuilder::new()
        .regular("conffiles", "/etc/foo.conf\n")
        .regular("postinst", "#!/bin/sh\n")
        .tar();

    let mut output = Vec::new();
    let result = entries::copy_entry_to_stream(&mut archive(data), "control", &mut output);

    assert!(matches!(result, Err(ExtractError::EntryNotFound(name)) if name == "control"));
    assert!(output.is_empty());
}

#[test]
fn list_paths_in_order() {
    let data = TarBuilder::new()
        .directory("./")
        .directory("./usr/")
        .regular("./usr/a", "0123456789")
        .regular("./usr/b", "")
        .tar();

    let mut output = Vec::new();
    entries::list_paths_to_stream(&mut archive(data), &mut output).unwrap();

    assert_eq!(output, b"./\n./usr/\n./usr/a\n./usr/b\n");
}

#[test]
fn retry_interrupted_reads() {
    /// Return `Interrupted` before every successful read.
    struct Flaky<R> {
        reader: R,
        interrupt: bool,
    }

    impl<R: Read> Read for Flaky<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }

            let n = buf.len().min(3);
            self.reader.read(&mut buf[..n])
        }
    }

    let mut input = Flaky {
        reader: &b"abcdefgh"[..],
        interrupt: false,
    };

    let mut output = Vec::new();
    let copied = entries::copy_data(&mut input, &mut output).unwrap();

    assert_eq!(copied, 8);
    assert_eq!(output, b"abcdefgh");
}

#[test]
fn skip_destination_entry() {
    let root = tempfile::tempdir().unwrap();

    let data = TarBuilder::new()
        .directory(".")
        .regular("./a.txt", "A")
        .tar();

    let mut destination = root.path().as_os_str().to_owned();
    destination.push("/x-");

    let flags = ExtractFlags::default();
    entries::extract_all(&mut archive(data), &destination, flags, &NoEventHandler).unwrap();

    let files: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();

    assert_eq!(files, [OsStr::new("x-a.txt")]);
}

#[test]
fn extract_with_blank_numeric_fields() {
    let root = tempfile::tempdir().unwrap();

    // `TarBuilder` leaves uid, gid and mtime blank.
    let data = TarBuilder::new()
        .directory("./etc/")
        .regular("./etc/a.conf", "A")
        .tar();

    let mut destination = root.path().as_os_str().to_owned();
    destination.push("/");

    entries::extract_all(&mut archive(data), &destination, ExtractFlags::DATA, &NoEventHandler)
        .unwrap();

    assert_eq!(std::fs::read(root.path().join("etc/a.conf")).unwrap(), b"A");
}

#[test]
fn add_trailing_slash() {
    use std::path::Path;

    assert_eq!(with_trailing_slash(Path::new("/tmp/rootfs")), "/tmp/rootfs/");
    assert_eq!(with_trailing_slash(Path::new("/tmp/rootfs/")), "/tmp/rootfs/");
    assert_eq!(with_trailing_slash(Path::new("/")), "/");
    assert_eq!(with_trailing_slash(Path::new("")), "");
}

/// Writer that fails after the first write.
#[derive(Default)]
struct FailingWriter {
    writes: usize,
    live_during_write: Option<(isize, isize)>,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.live_during_write = Some((live::outer(), live::bridges()));
        self.writes += 1;

        if self.writes > 1 {
            return Err(io::Error::other("disk full"));
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn release_archives_after_write_failure() {
    let dir = tempfile::tempdir().unwrap();

    let control: Vec<u8> = (0..200_000).map(|n| (n % 251) as u8).collect();
    let member = TarBuilder::new().regular("./control", &control).gzip();
    let package = write_package(dir.path(), "foo.ipk", &[("control.tar.gz", &member)]);

    let mut output = FailingWriter::default();
    let result = Extractor::new(&package).control_file_to_stream(&mut output);

    assert!(matches!(result, Err(ExtractError::Write(_))));
    assert_eq!(output.writes, 2);

    // Both readers were alive while the data was copied, and released
    // before returning.
    assert_eq!(output.live_during_write, Some((1, 1)));
    assert_eq!((live::outer(), live::bridges()), (0, 0));
}

#[test]
fn release_archives_on_every_path() {
    let dir = tempfile::tempdir().unwrap();

    let member = TarBuilder::new().regular("control", "Package: foo\n").gzip();
    let package = write_package(
        dir.path(),
        "foo.ipk",
        &[("debian-binary", b"2.0\n"), ("control.tar.gz", &member)],
    );

    let extractor = Extractor::new(&package);

    // Success.
    let mut output = Vec::new();
    extractor.control_file_to_stream(&mut output).unwrap();
    assert_eq!(output, b"Package: foo\n");
    assert_eq!((live::outer(), live::bridges()), (0, 0));

    // Missing member.
    let result = extractor.data_file_names_to_stream(&mut output);
    assert!(matches!(result, Err(ExtractError::MemberNotFound(..))));
    assert_eq!((live::outer(), live::bridges()), (0, 0));

    // Missing entry.
    let result = extractor.member_file_to_stream("control.tar.gz", "postinst", &mut output);
    assert!(matches!(result, Err(ExtractError::EntryNotFound(_))));
    assert_eq!((live::outer(), live::bridges()), (0, 0));

    // Invalid inner archive.
    let result = extractor.member_file_to_stream("debian-binary", "control", &mut output);
    assert!(matches!(result, Err(ExtractError::InnerOpen(..))));
    assert_eq!((live::outer(), live::bridges()), (0, 0));
}
