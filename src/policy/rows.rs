//! Policy rows — one authorization grant per line.
//!
//! Stable row format:
//!
//! ```text
//! <principal> <email_or_sub> <issuer> [group=<g>]
//! ```
//!
//! Columns are whitespace-delimited; lines starting with `#` and blank
//! lines are ignored. The identity column is matched against the token's
//! `email` first, then `sub`. A `group=` row matches on group membership
//! instead.

use std::fmt;

use crate::pktoken::Identity;
use crate::{Error, Result};

/// One row of an `auth_id` policy file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRow {
    /// Local username this row grants.
    pub principal: String,
    /// Email or subject the issuer vouches for.
    pub identity: String,
    /// Issuer URL.
    pub issuer: String,
    /// Optional group constraint: match on `groups` membership instead of
    /// the identity column.
    pub group: Option<String>,
}

impl PolicyRow {
    /// Parse one non-comment line.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [principal, identity, issuer] => Ok(Self {
                principal: (*principal).to_string(),
                identity: (*identity).to_string(),
                issuer: (*issuer).to_string(),
                group: None,
            }),
            [principal, identity, issuer, group_col] => {
                let group = group_col.strip_prefix("group=").ok_or_else(|| {
                    Error::Malformed(format!("unexpected trailing column {group_col:?}"))
                })?;
                if group.is_empty() {
                    return Err(Error::Malformed("empty group= constraint".into()));
                }
                Ok(Self {
                    principal: (*principal).to_string(),
                    identity: (*identity).to_string(),
                    issuer: (*issuer).to_string(),
                    group: Some(group.to_string()),
                })
            }
            _ => Err(Error::Malformed(format!(
                "expected 3 or 4 columns, got {}",
                fields.len()
            ))),
        }
    }

    /// Does this row authorize `identity` to become `principal`?
    ///
    /// Any matching row allows; row order never matters.
    #[must_use]
    pub fn matches(&self, principal: &str, identity: &Identity) -> bool {
        if self.principal != principal || self.issuer != identity.issuer {
            return false;
        }
        match &self.group {
            Some(group) => identity.groups.iter().any(|g| g == group),
            None => {
                identity.email.as_deref() == Some(self.identity.as_str())
                    || identity.sub == self.identity
            }
        }
    }
}

impl fmt::Display for PolicyRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.principal, self.identity, self.issuer)?;
        if let Some(group) = &self.group {
            write!(f, " group={group}")?;
        }
        Ok(())
    }
}

/// Parse a whole policy file. Malformed rows are returned separately so
/// the caller can log them; well-formed rows still load.
#[must_use]
pub fn parse_rows(text: &str) -> (Vec<PolicyRow>, Vec<(usize, Error)>) {
    let mut rows = Vec::new();
    let mut bad = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match PolicyRow::parse(trimmed) {
            Ok(row) => rows.push(row),
            Err(e) => bad.push((index + 1, e)),
        }
    }
    (rows, bad)
}
