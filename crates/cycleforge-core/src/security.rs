//! Security-level ordering and clearance checks.
//!
//! Five levels, totally ordered, case-insensitive on parse, canonical form
//! lowercase-hyphenated. Missing or blank input normalizes to `Unofficial`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered security classification.
///
/// Ordering follows declaration order: `Unofficial < Official <
/// OfficialSensitive < Secret < TopSecret`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityLevel {
    Unofficial,
    Official,
    OfficialSensitive,
    Secret,
    TopSecret,
}

impl SecurityLevel {
    const ORDER: [SecurityLevel; 5] = [
        SecurityLevel::Unofficial,
        SecurityLevel::Official,
        SecurityLevel::OfficialSensitive,
        SecurityLevel::Secret,
        SecurityLevel::TopSecret,
    ];

    /// The canonical lowercase-hyphenated string form.
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Unofficial => "unofficial",
            SecurityLevel::Official => "official",
            SecurityLevel::OfficialSensitive => "official-sensitive",
            SecurityLevel::Secret => "secret",
            SecurityLevel::TopSecret => "top-secret",
        }
    }

    fn index(self) -> usize {
        Self::ORDER.iter().position(|l| *l == self).unwrap_or(0)
    }

    /// Normalizes an optional, possibly differently-cased level string.
    /// `None` or blank input maps to [`SecurityLevel::Unofficial`].
    pub fn normalize(level: Option<&str>) -> Result<SecurityLevel, UnknownSecurityLevel> {
        let trimmed = level.map(str::trim).unwrap_or("");
        if trimmed.is_empty() {
            return Ok(SecurityLevel::Unofficial);
        }
        let lowered = trimmed.to_lowercase();
        Self::ORDER
            .iter()
            .copied()
            .find(|l| l.as_str() == lowered)
            .ok_or_else(|| UnknownSecurityLevel(trimmed.to_string()))
    }

    /// True iff `clearance` is sufficient to observe data classified at `data`.
    pub fn is_allowed(data: SecurityLevel, clearance: SecurityLevel) -> bool {
        clearance.index() >= data.index()
    }

    /// The maximum of a set of optional level strings, defaulting to
    /// `Unofficial` when the set is empty or every entry is `None`.
    pub fn resolve<'a, I>(levels: I) -> Result<SecurityLevel, UnknownSecurityLevel>
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let mut highest = SecurityLevel::Unofficial;
        let mut any = false;
        for level in levels.into_iter().flatten() {
            let normalized = Self::normalize(Some(level))?;
            any = true;
            if normalized > highest {
                highest = normalized;
            }
        }
        let _ = any;
        Ok(highest)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::Unofficial
    }
}

/// Raised when a security level string does not match one of the five
/// canonical values.
#[derive(Debug, thiserror::Error)]
#[error("unknown security level '{0}'")]
pub struct UnknownSecurityLevel(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_blank_is_unofficial() {
        assert_eq!(SecurityLevel::normalize(None).unwrap(), SecurityLevel::Unofficial);
        assert_eq!(SecurityLevel::normalize(Some("  ")).unwrap(), SecurityLevel::Unofficial);
    }

    #[test]
    fn normalize_is_case_insensitive() {
        assert_eq!(SecurityLevel::normalize(Some("SECRET")).unwrap(), SecurityLevel::Secret);
        assert_eq!(
            SecurityLevel::normalize(Some(" Official-Sensitive ")).unwrap(),
            SecurityLevel::OfficialSensitive
        );
    }

    #[test]
    fn normalize_rejects_unknown() {
        assert!(SecurityLevel::normalize(Some("ultra")).is_err());
    }

    #[test]
    fn clearance_must_be_at_least_data_level() {
        assert!(SecurityLevel::is_allowed(SecurityLevel::Secret, SecurityLevel::Secret));
        assert!(SecurityLevel::is_allowed(SecurityLevel::Official, SecurityLevel::Secret));
        assert!(!SecurityLevel::is_allowed(SecurityLevel::Secret, SecurityLevel::Official));
    }

    #[test]
    fn resolve_picks_the_maximum() {
        let resolved = SecurityLevel::resolve(vec![Some("official"), Some("secret"), None]).unwrap();
        assert_eq!(resolved, SecurityLevel::Secret);
    }

    #[test]
    fn resolve_defaults_to_unofficial() {
        assert_eq!(SecurityLevel::resolve(Vec::<Option<&str>>::new()).unwrap(), SecurityLevel::Unofficial);
    }

    #[test]
    fn ordering_matches_declaration_order() {
        assert!(SecurityLevel::Unofficial < SecurityLevel::Official);
        assert!(SecurityLevel::Official < SecurityLevel::OfficialSensitive);
        assert!(SecurityLevel::OfficialSensitive < SecurityLevel::Secret);
        assert!(SecurityLevel::Secret < SecurityLevel::TopSecret);
    }
}
