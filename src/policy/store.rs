//! Policy file IO — fresh reads, locked atomic appends.
//!
//! Readers re-open the file on every verification; nothing is cached
//! across invocations. Writers serialize on an advisory lock next to the
//! policy file and replace it with a temp-file-then-rename, so a reader
//! never observes a partial row.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use tracing::warn;

use crate::access::{self, ExpectedOwner};
use crate::{Error, Result};

use super::rows::{parse_rows, PolicyRow};

/// Read and parse a policy file after enforcing its ownership.
///
/// Malformed rows are logged and skipped; the rest still load.
pub fn load_rows(path: &Path, owner: &ExpectedOwner) -> Result<Vec<PolicyRow>> {
    access::enforce(path, owner)?;
    let text = fs::read_to_string(path)?;
    let (rows, bad) = parse_rows(&text);
    for (line, error) in bad {
        warn!(file = %path.display(), line, error = %error, "Skipping malformed policy row");
    }
    Ok(rows)
}

/// Append one row, deduplicating and serializing against concurrent
/// writers. Returns `false` when an identical row already exists.
///
/// When the file is created, it gets `create_mode`; when it exists, its
/// mode and ownership are preserved across the rename.
pub fn append_row(path: &Path, row: &PolicyRow, create_mode: u32) -> Result<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let _lock = acquire_lock(path)?;

    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let (rows, _) = parse_rows(&existing);
    if rows.iter().any(|r| r == row) {
        return Ok(false);
    }

    let mut next = existing;
    if !next.is_empty() && !next.ends_with('\n') {
        next.push('\n');
    }
    next.push_str(&row.to_string());
    next.push('\n');

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(next.as_bytes())?;
    tmp.flush()?;

    match fs::metadata(path) {
        Ok(meta) => {
            // Keep the original mode and ownership across the rename.
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(meta.mode() & 0o777))?;
            nix::unistd::chown(
                tmp.path(),
                Some(nix::unistd::Uid::from_raw(meta.uid())),
                Some(nix::unistd::Gid::from_raw(meta.gid())),
            )
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        }
        Err(_) => {
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(create_mode))?;
        }
    }

    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(true)
}

/// Exclusive advisory lock on `<path>.lock` in the same directory.
fn acquire_lock(path: &Path) -> Result<Flock<File>> {
    let mut lock_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    lock_name.push_str(".lock");
    let lock_path = path.with_file_name(lock_name);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))
}
