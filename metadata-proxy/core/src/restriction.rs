use std::{fmt, str::FromStr};

/// The pattern language of a namespace's allow-list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Shell-style wildcards matched against bare role names.
    #[default]
    Glob,
    /// Anchored regular expressions matched against the requested role.
    Regexp,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown restriction format {0:?}; expected 'glob' or 'regexp'")]
pub struct InvalidDialect(String);

/// The roles workloads in a namespace may assume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceRestriction {
    pub namespace: String,
    pub allowed_roles: Vec<String>,
    /// When false the namespace opts out of restriction.
    pub enabled: bool,
    pub dialect: Dialect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestrictionEvent {
    Applied(NamespaceRestriction),
    Deleted(String),
}

// === impl Dialect ===

impl FromStr for Dialect {
    type Err = InvalidDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(Self::Glob),
            "regexp" | "regex" => Ok(Self::Regexp),
            _ => Err(InvalidDialect(s.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob => f.write_str("glob"),
            Self::Regexp => f.write_str("regexp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dialects() {
        assert_eq!("glob".parse::<Dialect>().unwrap(), Dialect::Glob);
        assert_eq!("regexp".parse::<Dialect>().unwrap(), Dialect::Regexp);
        assert_eq!("regex".parse::<Dialect>().unwrap(), Dialect::Regexp);
        assert!("Glob".parse::<Dialect>().is_err());
        assert_eq!(Dialect::Regexp.to_string(), "regexp");
    }
}
