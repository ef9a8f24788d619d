//! Materializes decoded entries on the filesystem.
//!
//! Entries are applied one at a time in archive order. Hardlinks are
//! resolved through a table from archive path to the path already written
//! for it, so a link can only point at something this call has created.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::options::{ExtractOptions, SymlinkPolicy};
use crate::reader::{Entry, EntryKind, EntryReader, normalize_path};

/// Counts of what one extraction call created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub hardlinks: usize,
    /// Entries outside the requested sub-path.
    pub skipped: usize,
    /// Content bytes written to regular files.
    pub bytes: u64,
}

/// Map an archive path to its location under `destination`.
///
/// With a `root`, only the root itself and paths below it map anywhere;
/// the root is re-rooted onto `destination`. Returns `Ok(None)` for paths
/// outside the root and fails for paths that would climb out of
/// `destination`.
pub fn destination_path(
    entry_path: &str,
    root: Option<&str>,
    destination: &Path,
) -> Result<Option<PathBuf>> {
    let entry_path = normalize_path(entry_path);
    let root = root.map(normalize_path).unwrap_or_default();

    let relative = if root.is_empty() {
        entry_path.as_str()
    } else if entry_path == root {
        ""
    } else {
        match entry_path
            .strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(rest) => rest,
            None => return Ok(None),
        }
    };

    let mut path = destination.to_path_buf();
    for component in relative.split('/').filter(|c| !c.is_empty()) {
        if component == ".." {
            return Err(Error::PathEscapesDestination {
                path: entry_path.clone(),
            });
        }
        path.push(component);
    }
    Ok(Some(path))
}

struct PendingDirectory {
    entry_path: String,
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

/// Applies one archive's entries to a destination directory.
///
/// A `Materializer` lives for exactly one extraction call.
pub struct Materializer<'a> {
    destination: PathBuf,
    root: Option<String>,
    options: &'a ExtractOptions,
    links: HashMap<String, PathBuf>,
    directories: Vec<PendingDirectory>,
    summary: Summary,
}

impl<'a> Materializer<'a> {
    pub fn new(destination: impl Into<PathBuf>, options: &'a ExtractOptions) -> Self {
        Self {
            destination: destination.into(),
            root: None,
            options,
            links: HashMap::new(),
            directories: Vec::new(),
            summary: Summary::default(),
        }
    }

    /// Restrict extraction to `sub_path` and everything below it.
    pub fn with_root(mut self, sub_path: &str) -> Self {
        let root = normalize_path(sub_path);
        self.root = if root.is_empty() { None } else { Some(root) };
        self
    }

    pub fn run<R: Read>(mut self, reader: &mut EntryReader<R>) -> Result<Summary> {
        fs::create_dir_all(&self.destination)
            .map_err(|e| Error::io(&self.destination.display().to_string(), e))?;

        while let Some(entry) = reader.next_entry()? {
            let Some(target) = self.target_for(&entry)? else {
                debug!("skipping '{}'", entry.path);
                self.summary.skipped += 1;
                continue;
            };

            match &entry.kind {
                EntryKind::Directory => self.create_directory(&entry, &target)?,
                EntryKind::RegularFile => self.create_file(&entry, &target, &mut reader.content())?,
                EntryKind::Hardlink { target: link } => self.create_hardlink(&entry, link, &target)?,
                EntryKind::Symlink { target: link } => self.create_symlink(&entry, link, &target)?,
            }
            self.links.insert(entry.path, target);
        }

        self.finish_directories()?;
        let s = &self.summary;
        info!(
            "extracted {} files, {} directories, {} symlinks, {} hardlinks ({} bytes) into '{}'",
            s.files,
            s.directories,
            s.symlinks,
            s.hardlinks,
            s.bytes,
            self.destination.display()
        );
        Ok(self.summary)
    }

    fn target_for(&self, entry: &Entry) -> Result<Option<PathBuf>> {
        let Some(target) = destination_path(&entry.path, self.root.as_deref(), &self.destination)?
        else {
            return Ok(None);
        };
        if target != self.destination || entry.kind == EntryKind::Directory {
            return Ok(Some(target));
        }
        // A sub-path naming a single file lands inside the destination.
        match entry.path.rsplit('/').next().filter(|name| !name.is_empty()) {
            Some(name) => Ok(Some(self.destination.join(name))),
            None => Err(Error::corrupt(format!(
                "non-directory entry at the archive root ({:?})",
                entry.kind
            ))),
        }
    }

    fn create_directory(&mut self, entry: &Entry, target: &Path) -> Result<()> {
        debug!("creating directory '{}' with mode {:o}", target.display(), entry.mode);
        self.check_no_symlinks(entry, target, true)?;
        fs::create_dir_all(target).map_err(|e| Error::io(&entry.path, e))?;
        self.directories.push(PendingDirectory {
            entry_path: entry.path.clone(),
            path: target.to_path_buf(),
            mode: entry.mode,
            mtime: entry.mtime,
        });
        self.summary.directories += 1;
        Ok(())
    }

    fn create_file(&mut self, entry: &Entry, target: &Path, content: &mut impl Read) -> Result<()> {
        debug!(
            "creating file '{}' with mode {:o} and {} bytes",
            target.display(),
            entry.mode,
            entry.size
        );
        self.prepare_target(entry, target)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .map_err(|e| Error::io(&entry.path, e))?;

        let copied = match io::copy(content, &mut file) {
            Ok(copied) => copied,
            Err(e) => {
                drop(file);
                remove_partial(target);
                return Err(Error::io(&entry.path, e));
            }
        };
        if copied != entry.size {
            drop(file);
            remove_partial(target);
            return Err(Error::corrupt(format!(
                "content of '{}' is truncated: expected {} bytes, found {}",
                entry.path, entry.size, copied
            )));
        }

        self.apply_file_metadata(entry, &file)
            .map_err(|e| Error::io(&entry.path, e))?;
        self.summary.files += 1;
        self.summary.bytes += copied;
        Ok(())
    }

    fn create_hardlink(&mut self, entry: &Entry, link: &str, target: &Path) -> Result<()> {
        let Some(source) = self.links.get(link).cloned() else {
            return Err(Error::DanglingHardlink {
                path: entry.path.clone(),
                target: link.to_string(),
            });
        };
        debug!("creating hardlink '{}' -> '{}'", target.display(), source.display());
        if source == target {
            return Ok(());
        }
        self.prepare_target(entry, target)?;
        fs::hard_link(&source, target).map_err(|e| Error::io(&entry.path, e))?;
        self.summary.hardlinks += 1;
        Ok(())
    }

    fn create_symlink(&mut self, entry: &Entry, link: &str, target: &Path) -> Result<()> {
        if self.options.symlink_policy == SymlinkPolicy::RejectEscaping {
            let location = target.strip_prefix(&self.destination).unwrap_or(target);
            if symlink_escapes(location, link) {
                return Err(Error::SymlinkEscape {
                    path: entry.path.clone(),
                    target: link.to_string(),
                });
            }
        }
        debug!("creating symlink '{}' -> '{}'", target.display(), link);
        self.prepare_target(entry, target)?;
        symlink(link, target).map_err(|e| Error::io(&entry.path, e))?;
        if self.options.preserve_mtime {
            let mtime = file_time(entry.mtime);
            filetime::set_symlink_file_times(target, mtime, mtime)
                .map_err(|e| Error::io(&entry.path, e))?;
        }
        self.summary.symlinks += 1;
        Ok(())
    }

    // Creates missing ancestors and clears whatever non-directory sits at
    // `target`. No ancestor below the destination may be a symlink, so
    // nothing is ever written through an existing link.
    fn prepare_target(&self, entry: &Entry, target: &Path) -> Result<()> {
        self.check_no_symlinks(entry, target, false)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(&entry.path, e))?;
        }
        match fs::symlink_metadata(target) {
            Ok(meta) if meta.is_dir() => Err(Error::io(
                &entry.path,
                io::Error::new(io::ErrorKind::AlreadyExists, "a directory exists at this path"),
            )),
            Ok(_) if self.options.overwrite => {
                fs::remove_file(target).map_err(|e| Error::io(&entry.path, e))
            }
            Ok(_) => Err(Error::io(
                &entry.path,
                io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&entry.path, e)),
        }
    }

    // Walks the existing components between the destination and `target`
    // (including `target` itself when `inclusive`) and fails on the first
    // symlink. An earlier entry may have planted one to redirect later
    // entries outside the destination.
    fn check_no_symlinks(&self, entry: &Entry, target: &Path, inclusive: bool) -> Result<()> {
        let Ok(relative) = target.strip_prefix(&self.destination) else {
            return Err(Error::PathEscapesDestination {
                path: entry.path.clone(),
            });
        };
        let components: Vec<_> = relative.components().collect();
        let checked = if inclusive {
            components.len()
        } else {
            components.len().saturating_sub(1)
        };

        let mut current = self.destination.clone();
        for component in &components[..checked] {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!(
                        "refusing '{}': '{}' is a symlink",
                        entry.path,
                        current.display()
                    );
                    return Err(Error::PathEscapesDestination {
                        path: entry.path.clone(),
                    });
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(Error::io(&entry.path, e)),
            }
        }
        Ok(())
    }

    fn apply_file_metadata(&self, entry: &Entry, file: &File) -> io::Result<()> {
        if self.options.preserve_permissions {
            if let Some(permissions) = permissions_from_mode(entry.mode) {
                file.set_permissions(permissions)?;
            }
        }
        if self.options.preserve_mtime {
            let mtime = file_time(entry.mtime);
            filetime::set_file_handle_times(file, None, Some(mtime))?;
        }
        Ok(())
    }

    // Deepest first; a read-only directory only becomes read-only once
    // everything inside it exists.
    fn finish_directories(&mut self) -> Result<()> {
        for dir in self.directories.drain(..).rev() {
            let name = &dir.entry_path;
            if self.options.preserve_permissions {
                if let Some(permissions) = permissions_from_mode(dir.mode) {
                    fs::set_permissions(&dir.path, permissions).map_err(|e| Error::io(name, e))?;
                }
            }
            if self.options.preserve_mtime {
                let mtime = file_time(dir.mtime);
                filetime::set_file_mtime(&dir.path, mtime).map_err(|e| Error::io(name, e))?;
            }
        }
        Ok(())
    }
}

/// Whether `link_target`, placed at `location` (relative to the
/// destination), is absolute or climbs above the destination.
pub fn symlink_escapes(location: &Path, link_target: &str) -> bool {
    if link_target.starts_with('/') || Path::new(link_target).is_absolute() {
        return true;
    }
    let mut depth = location
        .parent()
        .map(|parent| parent.components().count())
        .unwrap_or(0) as isize;
    for component in link_target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

fn file_time(mtime: u64) -> FileTime {
    FileTime::from_unix_time(i64::try_from(mtime).unwrap_or(i64::MAX), 0)
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to clean up partial file '{}': {}", path.display(), e);
    }
}

#[cfg(unix)]
fn permissions_from_mode(mode: u32) -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn permissions_from_mode(_mode: u32) -> Option<fs::Permissions> {
    None
}

#[cfg(unix)]
fn symlink(link: &str, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(windows)]
fn symlink(link: &str, target: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(link, target)
}
