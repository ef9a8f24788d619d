//! Streaming tar extraction that keeps hardlinks and symlinks intact.
//!
//! # Usage
//!
//! ## Unarchiving a whole archive
//!
//! ```rust
//! let out = tempfile::tempdir().unwrap();
//! tar_unarchive::unarchive("testdata/gnu-hardlinks.tar", out.path()).unwrap();
//! assert!(out.path().join("dir-1/dir-2/file-b").is_file());
//! ```
//!
//! ## Extracting a sub-path
//!
//! The sub-path itself maps onto the destination directory:
//!
//! ```rust
//! let out = tempfile::tempdir().unwrap();
//! tar_unarchive::extract("testdata/gnu-hardlinks.tar", "dir-1/dir-2", out.path()).unwrap();
//! assert!(out.path().join("file-a").is_file());
//! assert!(out.path().join("file-b").is_file());
//! ```
//!
//! ## Listing entries
//!
//! ```rust
//! use tar_unarchive::list;
//!
//! match list("testdata/gnu-symlinks.tar") {
//!     Ok(entries) => {
//!         for entry in entries {
//!             println!("{} ({:?})", entry.path, entry.kind);
//!         }
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```
//!
//! ## Options and arbitrary streams
//!
//! ```rust
//! use tar_unarchive::{ExtractOptions, SymlinkPolicy, unarchive_reader};
//!
//! let out = tempfile::tempdir().unwrap();
//! let options = ExtractOptions::new()
//!     .preserve_mtime(false)
//!     .symlink_policy(SymlinkPolicy::RejectEscaping);
//! let data = std::fs::read("testdata/gnu-symlinks.tar").unwrap();
//! let summary = unarchive_reader(data.as_slice(), out.path(), &options).unwrap();
//! assert_eq!(summary.symlinks, 2);
//! ```
//!
//! Symlink targets are written verbatim by default, exactly like `tar`.
//! When extracting untrusted archives, use [`SymlinkPolicy::RejectEscaping`]
//! or sandbox the destination yourself.
//!
//! Hardlinks can only point at members written earlier by the same call.
//! Extracting a sub-path therefore fails with [`Error::DanglingHardlink`]
//! when a link inside the sub-path aliases a file outside of it, even if
//! the archive extracts fine as a whole.

pub mod extract;
pub mod options;
pub mod reader;
pub mod tar;

mod error;

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub use error::{Error, Result};
pub use extract::{Materializer, Summary, destination_path};
pub use options::{ExtractOptions, SymlinkPolicy};
pub use reader::{Entry, EntryKind, EntryReader};

/// Materializes the whole archive at `source` under `destination`.
pub fn unarchive(source: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<Summary> {
    unarchive_with(source, destination, &ExtractOptions::default())
}

pub fn unarchive_with(
    source: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    options: &ExtractOptions,
) -> Result<Summary> {
    unarchive_reader(open_archive(source.as_ref())?, destination, options)
}

/// Materializes the archive read from `reader`, positioned at its first header.
pub fn unarchive_reader<R: Read>(
    reader: R,
    destination: impl AsRef<Path>,
    options: &ExtractOptions,
) -> Result<Summary> {
    let mut entries = EntryReader::new(reader);
    Materializer::new(destination.as_ref(), options).run(&mut entries)
}

/// Materializes only `sub_path` and its descendants, with `sub_path`
/// itself mapped onto `destination`.
pub fn extract(
    source: impl AsRef<Path>,
    sub_path: &str,
    destination: impl AsRef<Path>,
) -> Result<Summary> {
    extract_with(source, sub_path, destination, &ExtractOptions::default())
}

pub fn extract_with(
    source: impl AsRef<Path>,
    sub_path: &str,
    destination: impl AsRef<Path>,
    options: &ExtractOptions,
) -> Result<Summary> {
    extract_reader(open_archive(source.as_ref())?, sub_path, destination, options)
}

pub fn extract_reader<R: Read>(
    reader: R,
    sub_path: &str,
    destination: impl AsRef<Path>,
    options: &ExtractOptions,
) -> Result<Summary> {
    let mut entries = EntryReader::new(reader);
    Materializer::new(destination.as_ref(), options)
        .with_root(sub_path)
        .run(&mut entries)
}

/// Lists the entries of a tar archive without extracting anything.
pub fn list(source: impl AsRef<Path>) -> Result<Vec<Entry>> {
    list_reader(open_archive(source.as_ref())?)
}

pub fn list_reader<R: Read>(reader: R) -> Result<Vec<Entry>> {
    let mut entries = EntryReader::new(reader);
    let mut listed = Vec::new();
    while let Some(entry) = entries.next_entry()? {
        listed.push(entry);
    }
    Ok(listed)
}

fn open_archive(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list() {
        let entries = list("testdata/gnu-symlinks.tar").unwrap();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[2].path, "dir-1/dir-2/file-a");
        assert_eq!(entries[2].size, 18);
        assert_eq!(entries[5].link_target(), Some("file-b"));
    }

    #[test]
    fn test_list_missing_archive() {
        let err = list("testdata/no-such-archive.tar").unwrap_err();
        match err {
            Error::Open { path, source } => {
                assert!(path.ends_with("no-such-archive.tar"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unarchive_creates_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("not/yet/there");
        let summary = unarchive("testdata/gnu-no-dirs.tar", &dest).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(
            std::fs::read_to_string(dest.join("a/b/c.txt")).unwrap(),
            "no parents\n"
        );
    }

    #[test]
    fn test_extract_reader() {
        let dir = tempfile::tempdir().unwrap();
        let data: &[u8] = include_bytes!("../testdata/gnu-split-hardlinks.tar");
        let summary = extract_reader(data, "src", dir.path(), &ExtractOptions::default()).unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(std::fs::read_to_string(dir.path().join("original")).unwrap(), "shared\n");
    }
}
