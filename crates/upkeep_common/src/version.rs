//! Version identifiers - parsing and total ordering
//!
//! Accepted form: `[v]MAJOR.MINOR.PATCH[TAG]` where TAG starts with `-` or `+`.
//! A tagged version sorts below the untagged release with the same numbers;
//! two tags on the same numbers are ordered by plain string comparison, so
//! distinct inputs never compare equal unless numbers and tag both match.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::VersionError;

/// Characters allowed inside a pre-release/build tag (after the separator)
fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_' | '~')
}

/// Parsed, immutable version identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    /// Tag text including its leading separator (`-beta`, `+build.7`)
    tag: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            tag: None,
        }
    }

    /// Parse a dotted version string
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        if text.is_empty() {
            return Err(VersionError::Empty);
        }

        // Release tags are commonly published as `v1.2.3`
        let body = text
            .strip_prefix('v')
            .or_else(|| text.strip_prefix('V'))
            .unwrap_or(text);

        let parts: Vec<&str> = body.splitn(3, '.').collect();
        if parts.len() != 3 {
            return Err(VersionError::ComponentCount {
                input: text.to_string(),
                found: parts.len(),
            });
        }

        // The tag can only follow the patch number
        let (patch, tag) = match parts[2].find(['-', '+']) {
            Some(idx) if idx > 0 => (&parts[2][..idx], Some(&parts[2][idx..])),
            _ => (parts[2], None),
        };

        let mut values = [0u64; 3];
        for (slot, part) in values.iter_mut().zip([parts[0], parts[1], patch]) {
            *slot = parse_component(text, part)?;
        }

        let tag = match tag {
            Some(t) => {
                let rest = &t[1..];
                if rest.is_empty() || !rest.chars().all(is_tag_char) {
                    return Err(VersionError::InvalidTag {
                        input: text.to_string(),
                        tag: t.to_string(),
                    });
                }
                Some(t.to_string())
            }
            None => None,
        };

        Ok(Self {
            major: values[0],
            minor: values[1],
            patch: values[2],
            tag,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_prerelease(&self) -> bool {
        self.tag.is_some()
    }

    /// Version of the running binaries
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is validated by cargo as semver
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Self::new(0, 0, 0))
    }
}

fn parse_component(input: &str, part: &str) -> Result<u64, VersionError> {
    if part.is_empty() {
        return Err(VersionError::NonNumeric {
            input: input.to_string(),
            component: part.to_string(),
        });
    }
    if part.starts_with('-') {
        return Err(VersionError::Negative {
            input: input.to_string(),
            component: part.to_string(),
        });
    }
    // u64::from_str would accept a leading '+'
    if !part.chars().all(|c| c.is_ascii_digit()) {
        return Err(VersionError::NonNumeric {
            input: input.to_string(),
            component: part.to_string(),
        });
    }
    part.parse().map_err(|_| VersionError::NonNumeric {
        input: input.to_string(),
        component: part.to_string(),
    })
}

/// Three-way structural comparison
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// True when `remote` is strictly newer than `installed`
pub fn is_update_available(installed: &Version, remote: &Version) -> bool {
    remote > installed
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.tag, &other.tag) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(tag) = &self.tag {
            write!(f, "{}", tag)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}
