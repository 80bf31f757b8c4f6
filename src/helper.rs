//! The privileged helper — root/non-root boundary by re-execution.
//!
//! `opkssh add` writes the caller's own `~/.opk/auth_id` directly. For the
//! system policy it re-executes the same binary under `sudo -n`; a sudoers
//! drop-in permits exactly that invocation. The helper never trusts the
//! pre-exec state: arguments are validated again and the target file's
//! ownership is verified immediately before writing.
//!
//! `opkssh readhome <user>` prints a user's policy file for a verifier
//! running without root privileges; it refuses any non-root caller.

use std::path::PathBuf;
use std::process::Command;

use nix::unistd::{Group, User};
use tracing::{info, warn};

use crate::access::{self, ExpectedOwner};
use crate::policy::rows::PolicyRow;
use crate::policy::{store, SYSTEM_POLICY_PATH};
use crate::{Error, Result};

/// Outcome of an `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// One row appended.
    Added,
    /// An identical row already existed; nothing written.
    AlreadyPresent,
    /// Handed off to the sudo re-exec, which reported its own outcome.
    Delegated,
}

/// Arguments of an `add`, validated before any write.
#[derive(Debug, Clone)]
pub struct AddRequest {
    /// Local username to grant.
    pub principal: String,
    /// Email or subject column.
    pub identity: String,
    /// Issuer URL.
    pub issuer: String,
    /// Optional group constraint.
    pub group: Option<String>,
}

impl AddRequest {
    /// Reject arguments that could not have come from a well-formed row:
    /// embedded whitespace would change the file's column structure.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("principal", &self.principal),
            ("identity", &self.identity),
            ("issuer", &self.issuer),
        ] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(Error::Malformed(format!(
                    "{name} must be non-empty and contain no whitespace"
                )));
            }
        }
        if !valid_username(&self.principal) {
            return Err(Error::Malformed(format!(
                "{:?} is not a valid local username",
                self.principal
            )));
        }
        if let Some(group) = &self.group {
            if group.is_empty() || group.chars().any(char::is_whitespace) {
                return Err(Error::Malformed("group must contain no whitespace".into()));
            }
        }
        Ok(())
    }

    fn row(&self) -> PolicyRow {
        PolicyRow {
            principal: self.principal.clone(),
            identity: self.identity.clone(),
            issuer: self.issuer.clone(),
            group: self.group.clone(),
        }
    }
}

/// Add a policy row, choosing the user file, the system file (as root),
/// or a `sudo` re-exec depending on who we are.
pub fn add(request: &AddRequest) -> Result<AddOutcome> {
    request.validate()?;

    if nix::unistd::geteuid().is_root() {
        return add_system(request);
    }

    let me = User::from_uid(nix::unistd::getuid())
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?
        .ok_or_else(|| Error::Internal("calling uid has no passwd entry".into()))?;

    if me.name == request.principal {
        return add_user_policy(request, &me);
    }

    reexec_under_sudo(request)
}

/// Append to the invoker's own `~/.opk/auth_id`.
fn add_user_policy(request: &AddRequest, me: &User) -> Result<AddOutcome> {
    let dir = me.dir.join(".opk");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("auth_id");

    if path.exists() {
        access::enforce(
            &path,
            &ExpectedOwner::user(me.uid.as_raw(), me.gid.as_raw()),
        )?;
    }

    let appended = store::append_row(&path, &request.row(), 0o600)?;
    Ok(if appended {
        info!(event = "policy.added", file = %path.display(), principal = %request.principal, "Added policy row");
        AddOutcome::Added
    } else {
        AddOutcome::AlreadyPresent
    })
}

/// The root side: verify ownership of the system file, then append.
fn add_system(request: &AddRequest) -> Result<AddOutcome> {
    // Re-validated above; also insist the file (when present) is still the
    // one the installer laid down before writing through it.
    let path = PathBuf::from(SYSTEM_POLICY_PATH);
    if path.exists() {
        access::enforce(&path, &ExpectedOwner::system())?;
    }

    let appended = store::append_row(&path, &request.row(), 0o640)?;
    if appended {
        // A file created by the append gets root:opksshuser when the group
        // exists.
        if let Ok(Some(group)) = Group::from_name(access::OPKSSH_GROUP) {
            let _ = nix::unistd::chown(&path, None, Some(group.gid));
        }
        let sudo_uid = std::env::var("SUDO_UID").unwrap_or_default();
        info!(
            event = "policy.added",
            file = %path.display(),
            principal = %request.principal,
            sudo_uid = %sudo_uid,
            "Added policy row"
        );
        return Ok(AddOutcome::Added);
    }
    Ok(AddOutcome::AlreadyPresent)
}

/// Re-invoke this binary as `sudo -n opkssh add …`.
fn reexec_under_sudo(request: &AddRequest) -> Result<AddOutcome> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new("sudo");
    cmd.arg("-n")
        .arg(exe)
        .arg("add")
        .arg(&request.principal)
        .arg(&request.identity)
        .arg(&request.issuer);
    if let Some(group) = &request.group {
        cmd.arg("--group").arg(group);
    }

    let status = cmd.status()?;
    if status.success() {
        Ok(AddOutcome::Delegated)
    } else {
        warn!(status = ?status.code(), "sudo re-exec refused");
        Err(Error::HelperRefused)
    }
}

/// Print the contents of `/home/<user>/.opk/auth_id`. Root only.
pub fn read_home(username: &str) -> Result<String> {
    if !nix::unistd::geteuid().is_root() {
        return Err(Error::HelperRefused);
    }
    if !valid_username(username) {
        return Err(Error::Malformed(format!(
            "{username:?} is not a valid local username"
        )));
    }

    let user = User::from_name(username)
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?
        .ok_or_else(|| Error::Internal(format!("no such user: {username}")))?;

    let path = user.dir.join(".opk").join("auth_id");
    if !path.exists() {
        return Ok(String::new());
    }
    access::enforce(
        &path,
        &ExpectedOwner::user(user.uid.as_raw(), user.gid.as_raw()),
    )?;
    Ok(std::fs::read_to_string(path)?)
}

/// POSIX-ish username shape: no separators, no traversal.
fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('-')
        && name != "."
        && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(principal: &str) -> AddRequest {
        AddRequest {
            principal: principal.to_string(),
            identity: "alice@example.com".to_string(),
            issuer: "http://oidc.local:9998/".to_string(),
            group: None,
        }
    }

    #[test]
    fn validation_accepts_a_plain_request() {
        request("test").validate().unwrap();
    }

    #[test]
    fn validation_rejects_whitespace_smuggling() {
        let mut bad = request("test");
        bad.identity = "alice@example.com evil".to_string();
        assert!(bad.validate().is_err());

        let mut bad = request("test");
        bad.issuer = "https://op\nroot pwned https://op".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn validation_rejects_path_like_principals() {
        for name in ["../root", "a/b", "", "-flag", "..", "x y"] {
            let mut bad = request("test");
            bad.principal = (*name).to_string();
            assert!(bad.validate().is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn readhome_refuses_non_root_callers() {
        if nix::unistd::geteuid().is_root() {
            return; // exercised in privileged CI only
        }
        assert!(matches!(read_home("test"), Err(Error::HelperRefused)));
    }

    #[test]
    fn usernames_are_validated_strictly() {
        assert!(valid_username("alice"));
        assert!(valid_username("svc-deploy_1"));
        assert!(!valid_username("../etc"));
        assert!(!valid_username("a b"));
    }
}
