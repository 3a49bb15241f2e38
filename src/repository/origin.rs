//! Origin allow-list.

use std::collections::HashSet;

/// Checks the `Origin` header of upgrade requests against an allow-list.
///
/// Both sides are reduced to a bare host before comparing: scheme, `www.`
/// and any path are dropped, so `https://www.example.com/app` and
/// `example.com` match.
#[derive(Debug, Clone)]
pub struct OriginValidator {
    check_origin: bool,
    allowed: HashSet<String>,
}

impl Default for OriginValidator {
    fn default() -> Self {
        Self {
            check_origin: true,
            allowed: HashSet::new(),
        }
    }
}

impl OriginValidator {
    /// Validator with checking `enabled` over `allowed_origins`. Entries
    /// that normalize to nothing are skipped.
    #[must_use]
    pub fn new<I, S>(enabled: bool, allowed_origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = allowed_origins
            .into_iter()
            .map(|origin| normalize(origin.as_ref()))
            .filter(|origin| !origin.is_empty())
            .collect();
        Self {
            check_origin: enabled,
            allowed,
        }
    }

    /// Whether origins are checked at all.
    #[must_use]
    pub fn need_validate(&self) -> bool {
        self.check_origin
    }

    /// Whether `origin` is on the allow-list.
    #[must_use]
    pub fn validate(&self, origin: &str) -> bool {
        self.allowed.contains(&normalize(origin))
    }

    /// Full gate for a handshake: passes when checking is off, otherwise
    /// needs a present and allowed origin.
    #[must_use]
    pub fn admits(&self, origin: Option<&str>) -> bool {
        if !self.check_origin {
            return true;
        }
        origin.is_some_and(|origin| self.validate(origin))
    }
}

fn normalize(origin: &str) -> String {
    let stripped = origin
        .replace("https://", "")
        .replace("http://", "")
        .replace("www.", "");
    let stripped = stripped.strip_prefix('/').unwrap_or(&stripped);
    match stripped.find('/') {
        Some(idx) => stripped[..idx].to_string(),
        None => stripped.to_string(),
    }
}
