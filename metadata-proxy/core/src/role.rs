//! IAM role identifiers.
//!
//! Roles are referenced either by a bare name (`payments-svc`) or by a full
//! ARN (`arn:aws:iam::111122223333:role/payments-svc`). Annotations, allow-list
//! patterns and request paths may use either form, so every comparison goes
//! through the helpers here.

use once_cell::sync::Lazy;
use regex::Regex;
use std::{fmt, str::FromStr};

const ARN_PREFIX: &str = "arn:";
const ROLE_RESOURCE: &str = ":role/";

static BASE_ARN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^arn:[\w-]*:iam::\d+:role/?[\w+=,.@/-]*$").expect("base ARN pattern must compile")
});

/// The ARN prefix of roles in the local account, e.g.
/// `arn:aws:iam::111122223333:role/`.
///
/// Bare role names are expanded with this prefix and roles in this account are
/// reported back to callers without it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BaseArn(Option<String>);

#[derive(Debug, thiserror::Error)]
#[error("invalid base role ARN: {0:?}")]
pub struct InvalidBaseArn(String);

/// Returns true if `role` is a full ARN rather than a bare name.
pub fn is_arn(role: &str) -> bool {
    role.starts_with(ARN_PREFIX)
}

/// Returns the role's name, including any IAM path, without the ARN prefix.
///
/// Bare names are returned unchanged.
pub fn name(role: &str) -> &str {
    if !is_arn(role) {
        return role;
    }
    match role.split_once(ROLE_RESOURCE) {
        Some((_, name)) => name,
        None => role,
    }
}

/// Returns the last path segment of a role ARN or name.
pub fn last_segment(role: &str) -> &str {
    role.rsplit('/').next().unwrap_or(role)
}

// === impl BaseArn ===

impl BaseArn {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Expands `role` to a full ARN. Full ARNs are returned unchanged, as are
    /// bare names when no base ARN is configured.
    pub fn role_arn(&self, role: &str) -> String {
        match self.0.as_deref() {
            Some(base) if !is_arn(role) => format!("{base}{role}"),
            _ => role.to_string(),
        }
    }

    /// Returns the bare name of `role` if it belongs to the base account.
    pub fn strip<'r>(&self, role: &'r str) -> Option<&'r str> {
        role.strip_prefix(self.0.as_deref()?)
    }
}

impl FromStr for BaseArn {
    type Err = InvalidBaseArn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !BASE_ARN_RE.is_match(s) {
            return Err(InvalidBaseArn(s.to_string()));
        }
        let mut base = s.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self(Some(base)))
    }
}

impl fmt::Display for BaseArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_deref().unwrap_or(""))
    }
}
