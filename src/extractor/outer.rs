use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read},
    path::Path,
};

use flate2::bufread::GzDecoder;

use super::{try_io, EventHandler, ExtractError};

/// Size of the buffers to move data between archives and streams.
pub(crate) const EXTRACT_BUFFER_LEN: usize = 32 * 1024;

/// Tarball stored in a member of the package.
pub(crate) type InnerArchive<'a> = tar::Archive<Box<dyn Read + 'a>>;

/// Open the package in `package`, and call `f` with the archive stored
/// in its member `member`.
///
/// The package is closed before returning, even if `f` fails.
pub(crate) fn with_inner_archive<T, F>(
    package: &Path,
    member: &str,
    event_handler: &impl EventHandler,
    f: F,
) -> Result<T, ExtractError>
where
    F: FnOnce(&mut InnerArchive<'_>) -> Result<T, ExtractError>,
{
    let mut outer = OuterArchive::open(package)?;

    outer.with_member(member, |reader| {
        event_handler.member_found(package, member);

        let decoder = GzDecoder::new(reader);

        // The gzip header is parsed when the decoder is created.
        if decoder.header().is_none() {
            return Err(ExtractError::InnerOpen(
                io::Error::new(io::ErrorKind::InvalidData, "Invalid gzip header."),
                member.to_owned(),
            ));
        }

        let reader: Box<dyn Read + '_> = Box::new(decoder);
        f(&mut tar::Archive::new(reader))
    })
}

/// `ar` archive of a package.
struct OuterArchive<'a> {
    path: &'a Path,
    archive: ar::Archive<BufReader<File>>,
}

impl<'a> OuterArchive<'a> {
    fn open(path: &'a Path) -> Result<Self, ExtractError> {
        let file = try_io!(OuterOpen, path, File::open(path));

        #[cfg(test)]
        live::OUTER.with(|c| c.set(c.get() + 1));

        Ok(OuterArchive {
            path,
            archive: ar::Archive::new(BufReader::with_capacity(EXTRACT_BUFFER_LEN, file)),
        })
    }

    /// Find the first member with the identifier `member`, and call `f`
    /// with a reader for its data.
    ///
    /// Members are scanned in the order they appear in the archive.
    /// Packages contain only a few members, so there is no index.
    fn with_member<T, F>(&mut self, member: &str, f: F) -> Result<T, ExtractError>
    where
        F: FnOnce(MemberReader<'_>) -> Result<T, ExtractError>,
    {
        while let Some(entry) = self.archive.next_entry() {
            let entry = try_io!(OuterOpen, self.path, entry);

            if entry.header().identifier() == member.as_bytes() {
                return f(MemberReader::new(entry));
            }
        }

        Err(ExtractError::MemberNotFound(
            member.to_owned(),
            self.path.to_owned(),
        ))
    }
}

#[cfg(test)]
impl Drop for OuterArchive<'_> {
    fn drop(&mut self) {
        live::OUTER.with(|c| c.set(c.get() - 1));
    }
}

/// Reader for the data of a member in the package.
///
/// Data is read in chunks of [`EXTRACT_BUFFER_LEN`] bytes.
pub(crate) struct MemberReader<'a> {
    entry: ar::Entry<'a, BufReader<File>>,
    buffer: Box<[u8]>,
    position: usize,
    filled: usize,
}

impl<'a> MemberReader<'a> {
    fn new(entry: ar::Entry<'a, BufReader<File>>) -> Self {
        #[cfg(test)]
        live::BRIDGES.with(|c| c.set(c.get() + 1));

        MemberReader {
            entry,
            buffer: vec![0; EXTRACT_BUFFER_LEN].into_boxed_slice(),
            position: 0,
            filled: 0,
        }
    }
}

#[cfg(test)]
impl Drop for MemberReader<'_> {
    fn drop(&mut self) {
        live::BRIDGES.with(|c| c.set(c.get() - 1));
    }
}

impl Read for MemberReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for MemberReader<'_> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.position >= self.filled {
            self.filled = loop {
                match self.entry.read(&mut self.buffer) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    r => break r?,
                }
            };

            self.position = 0;
        }

        Ok(&self.buffer[self.position..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.position = (self.position + amt).min(self.filled);
    }
}
