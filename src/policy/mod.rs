//! The policy engine — who may log in as whom.
//!
//! Two tiers of `auth_id` files feed one decision:
//!
//! 1. **System policy** `/etc/opk/auth_id`, `root:opksshuser` mode ≤ `640`.
//!    An ownership or mode deviation fails the verification outright.
//! 2. **User policy** `~/.opk/auth_id`, owned by the user, mode ≤ `600`,
//!    authoritative only for that user's own principal. A deviating user
//!    file is ignored with an error; rows claiming other principals are
//!    dropped with an error.
//!
//! Rows merge and *any* match allows; row order never changes a decision.
//! Files are re-opened on every evaluation, never cached across
//! verifications.

pub mod rows;
pub mod store;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::access::ExpectedOwner;
use crate::pktoken::Identity;
use crate::{Error, Result};

pub use rows::PolicyRow;

/// Default system policy path.
pub const SYSTEM_POLICY_PATH: &str = "/etc/opk/auth_id";

/// Location and expected ownership of one user's policy file.
pub struct UserPolicy {
    /// `<home>/.opk/auth_id`
    pub path: PathBuf,
    /// `<user>:<user>`, mode ≤ 600
    pub owner: ExpectedOwner,
}

/// Maps a principal to its user policy file. Only the principal's own
/// home directory is consulted.
pub type HomeResolver = Box<dyn Fn(&str) -> Option<UserPolicy> + Send + Sync>;

/// The two-tier policy engine.
pub struct PolicyEngine {
    system_path: PathBuf,
    system_owner: ExpectedOwner,
    homes: HomeResolver,
}

impl PolicyEngine {
    /// Engine over the real system paths and passwd database.
    #[must_use]
    pub fn system() -> Self {
        Self {
            system_path: PathBuf::from(SYSTEM_POLICY_PATH),
            system_owner: ExpectedOwner::system(),
            homes: Box::new(passwd_home_resolver),
        }
    }

    /// Engine over explicit paths. Test seam, and how the verifier wires
    /// overrides in.
    #[must_use]
    pub fn with_paths(
        system_path: PathBuf,
        system_owner: ExpectedOwner,
        homes: HomeResolver,
    ) -> Self {
        Self {
            system_path,
            system_owner,
            homes,
        }
    }

    /// Decide whether `identity` may become `principal`.
    ///
    /// # Errors
    ///
    /// [`Error::PolicyDeny`] when no row matches; [`Error::FileAccess`]
    /// when the system policy file deviates from its required ownership.
    pub fn authorize(&self, principal: &str, identity: &Identity) -> Result<()> {
        let mut rows = self.system_rows()?;
        rows.extend(self.user_rows(principal));

        debug!(
            principal = %principal,
            issuer = %identity.issuer,
            rows = rows.len(),
            "Evaluating policy"
        );

        if rows.iter().any(|row| row.matches(principal, identity)) {
            return Ok(());
        }
        Err(Error::PolicyDeny {
            principal: principal.to_string(),
        })
    }

    /// System rows. A missing file is an empty policy; a deviating or
    /// unreadable file is fatal for the whole evaluation.
    fn system_rows(&self) -> Result<Vec<PolicyRow>> {
        if !self.system_path.exists() {
            warn!(file = %self.system_path.display(), "System policy file missing");
            return Ok(Vec::new());
        }
        store::load_rows(&self.system_path, &self.system_owner)
    }

    /// User rows for `principal`. Any problem with the user file only
    /// costs the user their own rows.
    fn user_rows(&self, principal: &str) -> Vec<PolicyRow> {
        let Some(user_policy) = (self.homes)(principal) else {
            return Vec::new();
        };
        if !user_policy.path.exists() {
            return Vec::new();
        }

        let rows = match store::load_rows(&user_policy.path, &user_policy.owner) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(file = %user_policy.path.display(), error = %e, "Ignoring user policy file");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter(|row| {
                if row.principal == principal {
                    true
                } else {
                    warn!(
                        file = %user_policy.path.display(),
                        row_principal = %row.principal,
                        "Ignoring user policy row for a foreign principal"
                    );
                    false
                }
            })
            .collect()
    }
}

/// Resolve a principal's policy file through the passwd database.
fn passwd_home_resolver(principal: &str) -> Option<UserPolicy> {
    let user = nix::unistd::User::from_name(principal).ok().flatten()?;
    Some(UserPolicy {
        path: user.dir.join(".opk").join("auth_id"),
        owner: ExpectedOwner::user(user.uid.as_raw(), user.gid.as_raw()),
    })
}

/// A resolver rooted at `base/<principal>/.opk/auth_id` with the caller's
/// own uid/gid. Used by tests and the privileged helper's read path.
#[must_use]
pub fn rooted_home_resolver(base: &Path) -> HomeResolver {
    let base = base.to_path_buf();
    Box::new(move |principal: &str| {
        Some(UserPolicy {
            path: base.join(principal).join(".opk").join("auth_id"),
            owner: crate::access::current_user(0o600),
        })
    })
}
