//! Ownership and permission enforcement for trusted files.
//!
//! Policy files, the provider registry, and the server configuration are
//! only honored when their owner, group, and mode match what the installer
//! set up. A file that deviates is ignored with an error; its contents are
//! never partially trusted.
//!
//! The mode check is a ceiling: permission bits outside the allowed mask
//! reject the file, tighter-than-required bits do not. `/etc/opk/auth_id`
//! at `600` is fine; at `644` it is refused.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::Group;

use crate::{Error, Result};

/// Group expected to own the system-wide opkssh files.
pub const OPKSSH_GROUP: &str = "opksshuser";

/// Expected ownership and permission ceiling for a trusted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedOwner {
    /// Required owner uid.
    pub uid: u32,
    /// Required group gid, when the group matters.
    pub gid: Option<u32>,
    /// Most permissive acceptable mode bits.
    pub max_mode: u32,
}

impl ExpectedOwner {
    /// Expectation for root-owned configuration: `root:opksshuser`, mode
    /// at most `640`. Falls back to gid 0 when the group does not exist.
    #[must_use]
    pub fn system() -> Self {
        let gid = Group::from_name(OPKSSH_GROUP)
            .ok()
            .flatten()
            .map_or(0, |g| g.gid.as_raw());
        Self {
            uid: 0,
            gid: Some(gid),
            max_mode: 0o640,
        }
    }

    /// Expectation for a user-owned policy file: `<u>:<u>`, mode at most
    /// `600`.
    #[must_use]
    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid: Some(gid),
            max_mode: 0o600,
        }
    }
}

/// Verify that `path` matches the expected ownership and mode ceiling.
///
/// # Errors
///
/// Returns [`Error::FileAccess`] naming the deviation. Stat failures
/// surface as [`Error::Io`].
pub fn enforce(path: &Path, expected: &ExpectedOwner) -> Result<()> {
    let meta = std::fs::metadata(path)?;

    if meta.uid() != expected.uid {
        return Err(Error::FileAccess {
            path: path.to_path_buf(),
            detail: format!("owned by uid {}, expected uid {}", meta.uid(), expected.uid),
        });
    }

    if let Some(gid) = expected.gid {
        if meta.gid() != gid {
            return Err(Error::FileAccess {
                path: path.to_path_buf(),
                detail: format!("group is gid {}, expected gid {gid}", meta.gid()),
            });
        }
    }

    let mode = meta.mode() & 0o777;
    if mode & !expected.max_mode != 0 {
        return Err(Error::FileAccess {
            path: path.to_path_buf(),
            detail: format!(
                "mode {mode:03o} is more permissive than {:03o}",
                expected.max_mode
            ),
        });
    }

    Ok(())
}

/// The caller's real uid/gid as an expectation (test and user-file paths).
#[must_use]
pub fn current_user(max_mode: u32) -> ExpectedOwner {
    ExpectedOwner {
        uid: nix::unistd::getuid().as_raw(),
        gid: Some(nix::unistd::getgid().as_raw()),
        max_mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_with_mode(dir: &tempfile::TempDir, mode: u32) -> std::path::PathBuf {
        let path = dir.path().join("auth_id");
        fs::write(&path, "test alice@example.com https://op.example\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn exact_mode_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_with_mode(&dir, 0o640);
        enforce(&path, &current_user(0o640)).unwrap();
    }

    #[test]
    fn tighter_mode_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_with_mode(&dir, 0o600);
        enforce(&path, &current_user(0o640)).unwrap();
    }

    #[test]
    fn world_readable_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_with_mode(&dir, 0o644);
        let err = enforce(&path, &current_user(0o640)).unwrap_err();
        assert!(matches!(err, Error::FileAccess { .. }));
    }

    #[test]
    fn mode_677_is_refused_even_with_correct_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_with_mode(&dir, 0o677);
        assert!(enforce(&path, &current_user(0o640)).is_err());
    }

    #[test]
    fn wrong_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_with_mode(&dir, 0o600);
        let expected = ExpectedOwner {
            uid: nix::unistd::getuid().as_raw().wrapping_add(1),
            gid: None,
            max_mode: 0o640,
        };
        assert!(enforce(&path, &expected).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = enforce(&dir.path().join("absent"), &current_user(0o640)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
