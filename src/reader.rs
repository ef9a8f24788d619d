//! Forward-only decoding of a tar stream into [`Entry`] values.
//!
//! GNU long-name records and pax extended headers are folded into the
//! member they describe, so callers only ever see the four entry kinds
//! that matter for laying a tree out on disk.
//!
//! ```rust
//! use std::io::Read;
//! use tar_unarchive::reader::{EntryKind, EntryReader};
//!
//! let file = std::fs::File::open("testdata/gnu-hardlinks.tar").unwrap();
//! let mut reader = EntryReader::new(file);
//! while let Some(entry) = reader.next_entry().unwrap() {
//!     if entry.kind == EntryKind::RegularFile {
//!         let mut text = String::new();
//!         reader.content().read_to_string(&mut text).unwrap();
//!         println!("{}: {}", entry.path, text);
//!     }
//! }
//! ```

use std::io::{self, Read};

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::tar::{
    BLOCK_SIZE, TYPE_CONTIGUOUS, TYPE_DIRECTORY, TYPE_GNU_LONGLINK, TYPE_GNU_LONGNAME,
    TYPE_HARDLINK, TYPE_PAX_EXTENDED, TYPE_PAX_GLOBAL, TYPE_REGULAR, TYPE_REGULAR_OLD,
    TYPE_SYMLINK, TarHeader, is_empty_block, padding_for,
};

/// Upper bound for GNU long-name and pax payloads.
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    Directory,
    /// Target is a filesystem path, kept exactly as archived.
    Symlink { target: String },
    /// Target is the archive path of an earlier member.
    Hardlink { target: String },
}

/// One member of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Archive-relative, slash-separated, never absolute. Empty for the
    /// archive root (`./`).
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// Content length; zero for everything but regular files.
    pub size: u64,
    pub mtime: u64,
}

impl Entry {
    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink { target } | EntryKind::Hardlink { target } => Some(target),
            EntryKind::RegularFile | EntryKind::Directory => None,
        }
    }
}

// Overrides collected from extension records for the next real member.
#[derive(Debug, Default)]
struct Extensions {
    path: Option<String>,
    linkpath: Option<String>,
    size: Option<u64>,
    mtime: Option<u64>,
}

/// Sequential tar decoder.
///
/// Content of the current member is exposed through [`EntryReader::content`].
/// Whatever the caller leaves unread, along with the block padding, is
/// discarded by the next call to [`EntryReader::next_entry`].
pub struct EntryReader<R> {
    inner: R,
    remaining: u64,
    padding: u64,
    offset: u64,
    finished: bool,
}

impl<R: Read> EntryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            offset: 0,
            finished: false,
        }
    }

    /// Bytes consumed from the underlying stream so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Advance to the next member, or `None` at the end of the archive.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_rest()?;

        let mut ext = Extensions::default();
        loop {
            let Some(block) = self.read_block()? else {
                trace!("archive ends without trailer at offset {}", self.offset);
                self.finished = true;
                return Ok(None);
            };
            if is_empty_block(&block) {
                self.finished = true;
                return Ok(None);
            }
            let header = TarHeader::from_bytes(&block)?;

            match header.typeflag {
                TYPE_GNU_LONGNAME => {
                    let data = self.read_extension(&header)?;
                    ext.path = Some(gnu_long_value(&data));
                    trace!("long name record: {:?}", ext.path);
                }
                TYPE_GNU_LONGLINK => {
                    let data = self.read_extension(&header)?;
                    ext.linkpath = Some(gnu_long_value(&data));
                    trace!("long link record: {:?}", ext.linkpath);
                }
                TYPE_PAX_EXTENDED => {
                    let data = self.read_extension(&header)?;
                    parse_pax_records(&data, &mut ext)?;
                }
                TYPE_PAX_GLOBAL => {
                    self.read_extension(&header)?;
                    trace!("ignoring pax global header '{}'", header.full_name());
                }
                typeflag => {
                    let size = ext.size.take().unwrap_or(header.size);
                    self.remaining = size;
                    self.padding = padding_for(size);

                    let path = normalize_path(&ext.path.take().unwrap_or_else(|| header.full_name()));
                    let linkname = ext.linkpath.take().unwrap_or_else(|| header.linkname.clone());
                    let kind = match typeflag {
                        TYPE_REGULAR | TYPE_REGULAR_OLD | TYPE_CONTIGUOUS => EntryKind::RegularFile,
                        TYPE_DIRECTORY => EntryKind::Directory,
                        TYPE_SYMLINK => EntryKind::Symlink { target: linkname },
                        TYPE_HARDLINK => EntryKind::Hardlink {
                            target: normalize_path(&linkname),
                        },
                        other => {
                            warn!(
                                "skipping '{}': unsupported entry type {:?}",
                                path,
                                char::from(other)
                            );
                            ext = Extensions::default();
                            self.skip_rest()?;
                            continue;
                        }
                    };

                    let size = if kind == EntryKind::RegularFile { size } else { 0 };
                    return Ok(Some(Entry {
                        path,
                        kind,
                        mode: header.mode,
                        size,
                        mtime: ext.mtime.unwrap_or(header.mtime),
                    }));
                }
            }
        }
    }

    /// Reader over the unread content of the current member.
    pub fn content(&mut self) -> Content<'_, R> {
        Content { reader: self }
    }

    fn read_block(&mut self) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Read(e)),
            }
        }
        self.offset += filled as u64;
        match filled {
            0 => Ok(None),
            BLOCK_SIZE => Ok(Some(block)),
            _ => Err(Error::corrupt(format!(
                "truncated header block at offset {}",
                self.offset - filled as u64
            ))),
        }
    }

    fn read_extension(&mut self, header: &TarHeader) -> Result<Vec<u8>> {
        if header.size > MAX_EXTENSION_SIZE {
            return Err(Error::corrupt(format!(
                "extension record of {} bytes exceeds limit",
                header.size
            )));
        }
        let mut data = Vec::with_capacity(header.size as usize);
        (&mut self.inner)
            .take(header.size)
            .read_to_end(&mut data)
            .map_err(Error::Read)?;
        self.offset += data.len() as u64;
        if data.len() as u64 != header.size {
            return Err(Error::corrupt("truncated extension record"));
        }
        self.padding = padding_for(header.size);
        self.skip_rest()?;
        Ok(data)
    }

    fn skip_rest(&mut self) -> Result<()> {
        let pending = self.remaining + self.padding;
        if pending == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.inner).take(pending), &mut io::sink())
            .map_err(Error::Read)?;
        self.offset += skipped;
        if skipped != pending {
            return Err(Error::corrupt(format!(
                "archive truncated: {} bytes missing at offset {}",
                pending - skipped,
                self.offset
            )));
        }
        self.remaining = 0;
        self.padding = 0;
        Ok(())
    }
}

/// Content of the current member, bounded to its declared size.
///
/// Yields `Ok(0)` early if the archive ends before the declared size; the
/// shortfall is reported as corruption by the next `next_entry` call.
pub struct Content<'a, R> {
    reader: &'a mut EntryReader<R>,
}

impl<R: Read> Read for Content<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.reader.remaining;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = remaining.min(buf.len() as u64) as usize;
        let n = self.reader.inner.read(&mut buf[..max])?;
        self.reader.remaining -= n as u64;
        self.reader.offset += n as u64;
        Ok(n)
    }
}

/// Strip leading `/`, `.` components, empty components and trailing `/`.
pub(crate) fn normalize_path(raw: &str) -> String {
    raw.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn gnu_long_value(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

// Records are "<len> <key>=<value>\n", len counting the whole record.
fn parse_pax_records(data: &[u8], ext: &mut Extensions) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() && rest[0] != 0 {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt("pax record without length"))?;
        let len = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| Error::corrupt("pax record with invalid length"))?;
        if len <= space + 1 || len > rest.len() {
            return Err(Error::corrupt("pax record length out of bounds"));
        }
        let record = rest[space + 1..len]
            .strip_suffix(b"\n")
            .ok_or_else(|| Error::corrupt("pax record not newline-terminated"))?;
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::corrupt("pax record without '='"))?;
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();

        match &record[..eq] {
            b"path" => ext.path = Some(value),
            b"linkpath" => ext.linkpath = Some(value),
            b"size" => {
                let size = value
                    .parse()
                    .map_err(|_| Error::corrupt(format!("invalid pax size {value:?}")))?;
                ext.size = Some(size);
            }
            // Fractional seconds are dropped; negative times fall back to the header.
            b"mtime" => ext.mtime = value.split('.').next().and_then(|s| s.parse().ok()),
            key => trace!("ignoring pax key {:?}", String::from_utf8_lossy(key)),
        }
        rest = &rest[len..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar::calc_checksum;

    const HARDLINKS: &[u8] = include_bytes!("../testdata/gnu-hardlinks.tar");
    const SYMLINKS: &[u8] = include_bytes!("../testdata/gnu-symlinks.tar");
    const LONG_DIR: &str = "long-directory-name-long-directory-name-long-directory-name-\
                            long-directory-name-long-directory-name-long-directory-name-";

    fn collect(data: &[u8]) -> Vec<Entry> {
        let mut reader = EntryReader::new(data);
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn reads_hardlink_archive_in_order() {
        let entries = collect(HARDLINKS);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["dir-1", "dir-1/dir-2", "dir-1/dir-2/file-a", "dir-1/dir-2/file-b"]
        );
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].mode, 0o755);
        assert_eq!(entries[2].kind, EntryKind::RegularFile);
        assert_eq!(entries[2].size, 19);
        assert_eq!(entries[2].mode, 0o644);
        assert_eq!(
            entries[3].kind,
            EntryKind::Hardlink {
                target: "dir-1/dir-2/file-a".to_string()
            }
        );
        assert_eq!(entries[3].link_target(), Some("dir-1/dir-2/file-a"));
        assert_eq!(entries[3].size, 0);
    }

    #[test]
    fn content_is_bounded_to_entry() {
        let mut reader = EntryReader::new(HARDLINKS);
        reader.next_entry().unwrap();
        reader.next_entry().unwrap();
        let file = reader.next_entry().unwrap().unwrap();
        assert_eq!(file.path, "dir-1/dir-2/file-a");

        let mut content = Vec::new();
        reader.content().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hardlinked content\n");

        let link = reader.next_entry().unwrap().unwrap();
        assert_eq!(link.path, "dir-1/dir-2/file-b");
        assert!(reader.next_entry().unwrap().is_none());
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn unread_and_partially_read_content_is_skipped() {
        let mut reader = EntryReader::new(HARDLINKS);
        for _ in 0..3 {
            reader.next_entry().unwrap();
        }
        let mut head = [0u8; 4];
        reader.content().read_exact(&mut head).unwrap();
        assert_eq!(&head, b"hard");

        let link = reader.next_entry().unwrap().unwrap();
        assert_eq!(link.path, "dir-1/dir-2/file-b");
        assert_eq!(reader.offset(), (BLOCK_SIZE * 5) as u64);
    }

    #[test]
    fn symlink_targets_are_verbatim() {
        let entries = collect(SYMLINKS);
        let c = entries.iter().find(|e| e.path == "dir-1/dir-2/file-c").unwrap();
        let d = entries.iter().find(|e| e.path == "dir-1/dir-2/file-d").unwrap();
        assert_eq!(c.kind, EntryKind::Symlink { target: "file-a".to_string() });
        assert_eq!(d.kind, EntryKind::Symlink { target: "file-b".to_string() });
    }

    #[test]
    fn gnu_long_names_are_folded_into_entries() {
        let entries = collect(include_bytes!("../testdata/gnu-longnames.tar"));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, LONG_DIR);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[1].path, format!("{LONG_DIR}/file-with-a-rather-long-name.txt"));
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[2].path, format!("{LONG_DIR}/second-name-for-the-long-file.txt"));
        assert_eq!(
            entries[2].link_target(),
            Some(format!("{LONG_DIR}/file-with-a-rather-long-name.txt").as_str())
        );
    }

    #[test]
    fn pax_long_names_are_folded_into_entries() {
        let gnu = collect(include_bytes!("../testdata/gnu-longnames.tar"));
        let pax = collect(include_bytes!("../testdata/pax-longnames.tar"));
        let strip = |entries: Vec<Entry>| {
            entries
                .into_iter()
                .map(|e| (e.path, e.kind, e.size, e.mtime))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(gnu), strip(pax));
    }

    #[test]
    fn clean_eof_without_trailer_ends_stream() {
        let entries = collect(&HARDLINKS[..BLOCK_SIZE * 2]);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let mut reader = EntryReader::new(&HARDLINKS[..BLOCK_SIZE + 100]);
        reader.next_entry().unwrap().unwrap();
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(err, Error::CorruptArchive { .. }), "{err}");
    }

    #[test]
    fn truncated_content_is_corrupt() {
        let mut reader = EntryReader::new(&HARDLINKS[..BLOCK_SIZE * 3 + 5]);
        for _ in 0..3 {
            reader.next_entry().unwrap().unwrap();
        }
        let mut content = Vec::new();
        reader.content().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hardl");
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(err, Error::CorruptArchive { .. }), "{err}");
    }

    #[test]
    fn missing_padding_is_corrupt() {
        let mut reader = EntryReader::new(&HARDLINKS[..BLOCK_SIZE * 3 + 19]);
        for _ in 0..3 {
            reader.next_entry().unwrap().unwrap();
        }
        assert!(reader.next_entry().is_err());
    }

    #[test]
    fn unsupported_kinds_are_skipped() {
        let data = include_bytes!("../testdata/test.tar");
        let mut archive = data.to_vec();
        archive[156] = b'6';
        let checksum = format!("{:06o}\0 ", calc_checksum(&archive[..BLOCK_SIZE]));
        archive[148..156].copy_from_slice(checksum.as_bytes());

        let mut reader = EntryReader::new(archive.as_slice());
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn normalizes_archive_paths() {
        assert_eq!(normalize_path("./dir-1/dir-2/"), "dir-1/dir-2");
        assert_eq!(normalize_path("/etc//passwd"), "etc/passwd");
        assert_eq!(normalize_path("./"), "");
        assert_eq!(normalize_path("a/./b/../c"), "a/b/../c");
    }

    #[test]
    fn pax_records() {
        let mut ext = Extensions::default();
        let data = b"20 path=some/path/x\n16 linkpath=abc\n17 size=12345678\n27 mtime=1577836800.123456\n";
        parse_pax_records(data, &mut ext).unwrap();
        assert_eq!(ext.path.as_deref(), Some("some/path/x"));
        assert_eq!(ext.linkpath.as_deref(), Some("abc"));
        assert_eq!(ext.size, Some(12345678));
        assert_eq!(ext.mtime, Some(1577836800));
    }

    #[test]
    fn malformed_pax_records_are_corrupt() {
        let mut ext = Extensions::default();
        assert!(parse_pax_records(b"99 path=x\n", &mut ext).is_err());
        assert!(parse_pax_records(b"nonsense", &mut ext).is_err());
        assert!(parse_pax_records(b"9 pathx\n", &mut ext).is_err());
        assert!(parse_pax_records(b"11 size=zz\n", &mut ext).is_err());
    }
}
