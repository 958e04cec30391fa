//! Dotted-integer versions and the simplified range check used for
//! dependency resolution.
//!
//! Ranges are reduced to a lower bound: operator characters are stripped
//! (`^1.2.3`, `~1.2`, `>=1.0` all become plain versions) and the installed
//! version must compare greater than or equal to that bound. `~` and `^`
//! are not distinguished and pre-release tags are ignored.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// A dotted-integer version such as `1`, `1.4` or `2.0.13`.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// Create a three-component version.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            parts: vec![major, minor, patch],
        }
    }

    /// Parse a strict dotted-integer string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid_manifest("empty version"));
        }

        let parts = s
            .split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| Error::invalid_manifest(format!("invalid version: {}", s)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { parts })
    }

    /// Reduce a range expression to its lower-bound version.
    ///
    /// Returns `None` for wildcard ranges (`*`, `x`, `latest`, empty), which
    /// accept any installed version.
    pub fn lower_bound(range: &str) -> Option<Self> {
        let token = range
            .split_whitespace()
            .find(|t| t.chars().any(|c| c.is_ascii_digit()))?;

        let cleaned: String = token
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        let parts: Vec<u64> = cleaned
            .split('.')
            .filter(|p| !p.is_empty())
            // Only digits remain, so parsing fails only on overflow.
            .map(|p| p.parse().unwrap_or(u64::MAX))
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    /// Version components, most significant first.
    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn component(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.parts.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Check whether an installed version satisfies a required range.
///
/// Unparseable installed versions are treated as `0`.
pub fn satisfies(installed: &str, range: &str) -> bool {
    let Some(required) = Version::lower_bound(range) else {
        return true;
    };
    let installed = Version::lower_bound(installed).unwrap_or_else(|| Version { parts: vec![0] });
    installed >= required
}
