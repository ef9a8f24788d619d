use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::DateTime;
use clap::{Args, Parser, Subcommand};
use flate2::read::GzDecoder;
use tar_unarchive::{
    Entry, EntryKind, Error, ExtractOptions, Result, Summary, SymlinkPolicy, extract_reader,
    list_reader, unarchive_reader,
};

/// Extract tar archives, keeping hardlinks and symlinks intact
#[derive(Parser)]
#[command(name = "tar_unarchive", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract the whole archive into a directory
    Unarchive {
        archive: PathBuf,
        directory: PathBuf,
        #[command(flatten)]
        flags: ExtractFlags,
    },
    /// Extract one directory of the archive; its contents land directly in <DIRECTORY>
    Extract {
        archive: PathBuf,
        sub_path: String,
        directory: PathBuf,
        #[command(flatten)]
        flags: ExtractFlags,
    },
    /// List the entries of an archive
    List { archive: PathBuf },
}

#[derive(Args)]
struct ExtractFlags {
    /// Leave file modes to the umask
    #[arg(long)]
    no_preserve_permissions: bool,

    /// Leave modification times at the time of extraction
    #[arg(long)]
    no_preserve_mtime: bool,

    /// Fail instead of replacing files that already exist
    #[arg(long)]
    keep_existing: bool,

    /// Refuse symlinks that point outside the destination
    #[arg(long)]
    reject_escaping_symlinks: bool,
}

impl ExtractFlags {
    fn options(&self) -> ExtractOptions {
        let policy = if self.reject_escaping_symlinks {
            SymlinkPolicy::RejectEscaping
        } else {
            SymlinkPolicy::Verbatim
        };
        ExtractOptions::new()
            .preserve_permissions(!self.no_preserve_permissions)
            .preserve_mtime(!self.no_preserve_mtime)
            .overwrite(!self.keep_existing)
            .symlink_policy(policy)
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Unarchive {
            archive,
            directory,
            flags,
        } => {
            let summary = unarchive_reader(open(&archive)?, &directory, &flags.options())?;
            print_summary(&summary, &directory);
        }
        Command::Extract {
            archive,
            sub_path,
            directory,
            flags,
        } => {
            let summary = extract_reader(open(&archive)?, &sub_path, &directory, &flags.options())?;
            print_summary(&summary, &directory);
        }
        Command::List { archive } => {
            let entries = list_reader(open(&archive)?)?;
            println!("Entries in {}:", archive.display());
            println!("{:>10}  {:>6}  {:<19}  {}", "Size", "Mode", "Modified", "Name");
            println!("{}", "-".repeat(60));
            for entry in &entries {
                println!("{}", format_entry(entry));
            }
            println!("\nTotal: {} entries", entries.len());
        }
    }
    Ok(())
}

// Gzip is unwrapped here so the library only ever sees plain tar.
fn open(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let name = path.to_string_lossy();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn format_entry(entry: &Entry) -> String {
    let modified = i64::try_from(entry.mtime)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let name = match &entry.kind {
        EntryKind::RegularFile => entry.path.clone(),
        EntryKind::Directory => format!("{}/", entry.path),
        EntryKind::Symlink { target } => format!("{} -> {}", entry.path, target),
        EntryKind::Hardlink { target } => format!("{} link to {}", entry.path, target),
    };
    format!("{:>10}  {:>6o}  {:<19}  {}", entry.size, entry.mode, modified, name)
}

fn print_summary(summary: &Summary, directory: &Path) {
    println!(
        "Extracted {} files, {} directories, {} symlinks, {} hardlinks to: {}",
        summary.files,
        summary.directories,
        summary.symlinks,
        summary.hardlinks,
        directory.display()
    );
    if summary.skipped > 0 {
        println!("Skipped {} entries outside the requested path", summary.skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_extract_command_flags() {
        let cli = Cli::parse_from([
            "tar_unarchive",
            "extract",
            "a.tar",
            "dir-1/dir-2",
            "out",
            "--keep-existing",
            "--reject-escaping-symlinks",
        ]);
        let Command::Extract { sub_path, flags, .. } = cli.command else {
            panic!("expected extract command");
        };
        assert_eq!(sub_path, "dir-1/dir-2");
        let options = flags.options();
        assert!(!options.overwrite);
        assert!(options.preserve_permissions);
        assert_eq!(options.symlink_policy, SymlinkPolicy::RejectEscaping);
    }

    #[test]
    fn test_format_entry() {
        let entry = Entry {
            path: "dir-1/dir-2/file-b".to_string(),
            kind: EntryKind::Hardlink {
                target: "dir-1/dir-2/file-a".to_string(),
            },
            mode: 0o644,
            size: 0,
            mtime: 1577836800,
        };
        assert_eq!(
            format_entry(&entry),
            "         0     644  2020-01-01 00:00:00  dir-1/dir-2/file-b link to dir-1/dir-2/file-a"
        );
    }

    #[test]
    fn test_unarchive_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("hardlinks.tar.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::default());
        encoder
            .write_all(include_bytes!("../testdata/gnu-hardlinks.tar"))
            .unwrap();
        encoder.finish().unwrap();

        let out = dir.path().join("out");
        let summary =
            unarchive_reader(open(&archive).unwrap(), &out, &ExtractOptions::default()).unwrap();
        assert_eq!(summary.hardlinks, 1);
        assert!(out.join("dir-1/dir-2/file-b").is_file());
    }
}
