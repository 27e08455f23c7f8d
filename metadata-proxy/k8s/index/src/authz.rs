use crate::Index;
use metadata_proxy_core::{role, Dialect, NamespaceRestriction};
use regex::Regex;

/// A namespace allow-list with its patterns compiled.
#[derive(Debug)]
pub(crate) struct Restriction {
    enabled: bool,
    dialect: Dialect,
    matchers: Vec<Matcher>,
}

#[derive(Debug)]
enum Matcher {
    Glob { pattern: String, glob: glob::Pattern },
    Regexp { pattern: String, regex: Regex },
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionDump {
    pub enabled: bool,
    pub format: String,
    pub allowed_roles: Vec<String>,
}

// === impl Index ===

impl Index {
    /// Returns true if workloads in `namespace` may assume `role`.
    ///
    /// Namespaces without an allow-list may assume nothing while enforcement is enabled.
    pub fn is_authorized(&self, namespace: &str, role: &str) -> bool {
        if !self.config.namespace_restriction {
            return true;
        }

        let Some(restriction) = self.restrictions.get(namespace) else {
            tracing::debug!(ns = %namespace, %role, "No allow-list for namespace");
            return false;
        };
        if !restriction.enabled {
            return true;
        }

        match restriction.matching(role) {
            Some(pattern) => {
                tracing::debug!(ns = %namespace, %role, %pattern, "Role permitted");
                true
            }
            None => {
                tracing::debug!(ns = %namespace, %role, "Role not permitted");
                false
            }
        }
    }

    pub(crate) fn apply_restriction(&mut self, restriction: NamespaceRestriction) {
        let namespace = restriction.namespace.clone();
        let compiled = Restriction::compile(restriction);
        tracing::debug!(ns = %namespace, patterns = compiled.matchers.len(), "Indexed allow-list");
        self.restrictions.insert(namespace, compiled);
    }

    pub(crate) fn delete_restriction(&mut self, namespace: &str) {
        if self.restrictions.remove(namespace).is_some() {
            tracing::debug!(ns = %namespace, "Removed allow-list");
        }
    }
}

// === impl Restriction ===

impl Restriction {
    fn compile(
        NamespaceRestriction {
            namespace,
            allowed_roles,
            enabled,
            dialect,
        }: NamespaceRestriction,
    ) -> Self {
        let matchers = allowed_roles
            .into_iter()
            .filter_map(|pattern| match Matcher::compile(dialect, pattern) {
                Ok(m) => Some(m),
                Err((pattern, error)) => {
                    tracing::warn!(ns = %namespace, %pattern, %error, "Ignoring invalid role pattern");
                    None
                }
            })
            .collect();

        Self {
            enabled,
            dialect,
            matchers,
        }
    }

    /// Returns the first pattern that permits `role`.
    fn matching(&self, requested: &str) -> Option<&str> {
        self.matchers
            .iter()
            .find(|m| m.matches(requested))
            .map(Matcher::pattern)
    }

    pub(crate) fn dump(&self) -> RestrictionDump {
        RestrictionDump {
            enabled: self.enabled,
            format: self.dialect.to_string(),
            allowed_roles: self
                .matchers
                .iter()
                .map(|m| m.pattern().to_string())
                .collect(),
        }
    }
}

// === impl Matcher ===

impl Matcher {
    fn compile(dialect: Dialect, pattern: String) -> Result<Self, (String, String)> {
        match dialect {
            Dialect::Glob => match glob::Pattern::new(role::name(&pattern)) {
                Ok(glob) => Ok(Self::Glob { pattern, glob }),
                Err(e) => Err((pattern, e.to_string())),
            },
            Dialect::Regexp => match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(regex) => Ok(Self::Regexp { pattern, regex }),
                Err(e) => Err((pattern, e.to_string())),
            },
        }
    }

    fn matches(&self, requested: &str) -> bool {
        match self {
            Self::Glob { glob, .. } => glob.matches(role::name(requested)),
            Self::Regexp { regex, .. } => regex.is_match(requested),
        }
    }

    fn pattern(&self) -> &str {
        match self {
            Self::Glob { pattern, .. } | Self::Regexp { pattern, .. } => pattern,
        }
    }
}
