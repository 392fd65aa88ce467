//! Module identity: coordinates and tool references.
//!
//! A module is addressed by a [`ModuleCoordinate`]: a `namespace/name` slug
//! plus a semantic version. The canonical string form is
//! `namespace/name@version`; the `namespace/name:version` form is accepted
//! on parse because that is how tool lists name tools.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Error returned when parsing a coordinate or tool reference fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinateParseError {
    /// The slug is not of the form `namespace/name`.
    #[error("invalid module slug '{0}': expected namespace/name")]
    InvalidSlug(String),

    /// A slug segment contains characters outside `[a-z0-9_-]`.
    #[error("invalid slug segment '{0}': only lowercase alphanumerics, '-' and '_' are allowed")]
    InvalidSegment(String),

    /// The coordinate has no version component.
    #[error("missing version in '{0}': expected namespace/name@version")]
    MissingVersion(String),

    /// The version component is not valid semver.
    #[error("invalid version '{version}' in '{input}': {message}")]
    InvalidVersion {
        /// The full input string.
        input: String,
        /// The offending version component.
        version: String,
        /// The semver parse error message.
        message: String,
    },
}

/// Check that a slug segment uses only lowercase alphanumerics, `-` and `_`.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Split a spec string into its slug and optional version component.
///
/// Both `@` and `:` separate the version from the slug. The separator is
/// searched after the `/`, so namespaces themselves can never be split.
fn split_version(spec: &str) -> (&str, Option<&str>) {
    match spec.rsplit_once(['@', ':']) {
        Some((slug, version)) if slug.contains('/') => (slug, Some(version)),
        _ => (spec, None),
    }
}

/// Parse a `namespace/name` slug into its two segments.
fn parse_slug(slug: &str) -> Result<(String, String), CoordinateParseError> {
    let (namespace, name) = slug
        .split_once('/')
        .ok_or_else(|| CoordinateParseError::InvalidSlug(slug.to_string()))?;
    if name.contains('/') {
        return Err(CoordinateParseError::InvalidSlug(slug.to_string()));
    }
    for segment in [namespace, name] {
        if !is_valid_segment(segment) {
            return Err(CoordinateParseError::InvalidSegment(segment.to_string()));
        }
    }
    Ok((namespace.to_string(), name.to_string()))
}

/// The identity of a module: `namespace/name` plus a semantic version.
///
/// Within one store at most one installed artifact exists per slug —
/// installing a new version supersedes the prior one, so the coordinate's
/// version identifies *which* artifact currently occupies the slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ModuleCoordinate {
    namespace: String,
    name: String,
    version: Version,
}

impl ModuleCoordinate {
    /// Create a coordinate from pre-validated parts.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinateParseError::InvalidSegment`] if either segment
    /// contains characters outside `[a-z0-9_-]`.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: Version,
    ) -> Result<Self, CoordinateParseError> {
        let namespace = namespace.into();
        let name = name.into();
        for segment in [namespace.as_str(), name.as_str()] {
            if !is_valid_segment(segment) {
                return Err(CoordinateParseError::InvalidSegment(segment.to_string()));
            }
        }
        Ok(Self {
            namespace,
            name,
            version,
        })
    }

    /// Parse a full coordinate: `namespace/name@version` (or `:` separated).
    ///
    /// # Errors
    ///
    /// Returns a [`CoordinateParseError`] if the slug or version component
    /// is malformed, or the version is absent.
    pub fn parse(spec: &str) -> Result<Self, CoordinateParseError> {
        let (slug, version) = split_version(spec);
        let version = version.ok_or_else(|| {
            // A bad slug is the more useful diagnostic when both are wrong.
            if slug.contains('/') {
                CoordinateParseError::MissingVersion(spec.to_string())
            } else {
                CoordinateParseError::InvalidSlug(spec.to_string())
            }
        })?;
        let (namespace, name) = parse_slug(slug)?;
        let version =
            Version::parse(version).map_err(|e| CoordinateParseError::InvalidVersion {
                input: spec.to_string(),
                version: version.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            namespace,
            name,
            version,
        })
    }

    /// The namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The semantic version.
    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The `namespace/name` slug, without the version.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether this coordinate occupies the same slug as another.
    #[must_use]
    pub fn same_slug(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.version)
    }
}

impl FromStr for ModuleCoordinate {
    type Err = CoordinateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ModuleCoordinate> for String {
    fn from(coordinate: ModuleCoordinate) -> Self {
        coordinate.to_string()
    }
}

impl TryFrom<String> for ModuleCoordinate {
    type Error = CoordinateParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl PartialOrd for ModuleCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleCoordinate {
    /// Slug-lexicographic, then semver precedence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// A reference to a tool module, as it appears in a `tool_list`
/// configurable: a slug with an optional pinned version
/// (`ns/calc` or `ns/calc:0.1.0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ToolRef {
    namespace: String,
    name: String,
    version: Option<Version>,
}

impl ToolRef {
    /// Parse a tool reference, with or without a version.
    ///
    /// # Errors
    ///
    /// Returns a [`CoordinateParseError`] on a malformed slug or version.
    pub fn parse(spec: &str) -> Result<Self, CoordinateParseError> {
        let (slug, version) = split_version(spec);
        let (namespace, name) = parse_slug(slug)?;
        let version = version
            .map(|v| {
                Version::parse(v).map_err(|e| CoordinateParseError::InvalidVersion {
                    input: spec.to_string(),
                    version: v.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;
        Ok(Self {
            namespace,
            name,
            version,
        })
    }

    /// The `namespace/name` slug.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The namespace segment.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The name segment.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pinned version, if the reference carries one.
    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// Whether an installed coordinate satisfies this reference.
    ///
    /// Slugs must match; an unpinned reference accepts any version.
    #[must_use]
    pub fn matches(&self, coordinate: &ModuleCoordinate) -> bool {
        self.namespace == coordinate.namespace()
            && self.name == coordinate.name()
            && self.version.as_ref().is_none_or(|v| v == coordinate.version())
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}/{}:{version}", self.namespace, self.name),
            None => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

impl FromStr for ToolRef {
    type Err = CoordinateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ToolRef> for String {
    fn from(tool_ref: ToolRef) -> Self {
        tool_ref.to_string()
    }
}

impl TryFrom<String> for ToolRef {
    type Error = CoordinateParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_at_form() {
        let c = ModuleCoordinate::parse("ns/calc@0.1.0").unwrap();
        assert_eq!(c.namespace(), "ns");
        assert_eq!(c.name(), "calc");
        assert_eq!(c.version(), &Version::new(0, 1, 0));
        assert_eq!(c.to_string(), "ns/calc@0.1.0");
    }

    #[test]
    fn parse_colon_form() {
        let c = ModuleCoordinate::parse("ns/calc:0.1.0").unwrap();
        assert_eq!(c.slug(), "ns/calc");
        // Canonical display uses '@' regardless of input separator.
        assert_eq!(c.to_string(), "ns/calc@0.1.0");
    }

    #[test]
    fn parse_prerelease() {
        let c = ModuleCoordinate::parse("ns/calc@1.0.0-alpha.1").unwrap();
        assert_eq!(c.version().to_string(), "1.0.0-alpha.1");
    }

    #[test]
    fn reject_missing_version() {
        assert!(matches!(
            ModuleCoordinate::parse("ns/calc"),
            Err(CoordinateParseError::MissingVersion(_))
        ));
    }

    #[test]
    fn reject_missing_namespace() {
        assert!(ModuleCoordinate::parse("calc@0.1.0").is_err());
        assert!(ModuleCoordinate::parse("calc").is_err());
    }

    #[test]
    fn reject_invalid_segment() {
        assert!(matches!(
            ModuleCoordinate::parse("Ns/calc@0.1.0"),
            Err(CoordinateParseError::InvalidSegment(_))
        ));
        assert!(ModuleCoordinate::parse("ns/ca lc@0.1.0").is_err());
        assert!(ModuleCoordinate::parse("ns//calc@0.1.0").is_err());
    }

    #[test]
    fn reject_invalid_version() {
        assert!(matches!(
            ModuleCoordinate::parse("ns/calc@not.a.version"),
            Err(CoordinateParseError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn ordering_is_slug_then_semver() {
        let a = ModuleCoordinate::parse("a/m@2.0.0").unwrap();
        let b = ModuleCoordinate::parse("b/m@1.0.0").unwrap();
        assert!(a < b, "namespace dominates version");

        let pre = ModuleCoordinate::parse("a/m@1.0.0-rc.1").unwrap();
        let rel = ModuleCoordinate::parse("a/m@1.0.0").unwrap();
        assert!(pre < rel, "pre-release sorts before release");
    }

    #[test]
    fn serde_round_trip() {
        let c = ModuleCoordinate::parse("ns/calc@0.1.0").unwrap();
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, "\"ns/calc@0.1.0\"");
        let back: ModuleCoordinate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn tool_ref_pinned_and_unpinned() {
        let installed = ModuleCoordinate::parse("ns/calc@0.1.0").unwrap();

        let pinned = ToolRef::parse("ns/calc:0.1.0").unwrap();
        assert!(pinned.matches(&installed));

        let other = ToolRef::parse("ns/calc:0.2.0").unwrap();
        assert!(!other.matches(&installed));

        let unpinned = ToolRef::parse("ns/calc").unwrap();
        assert!(unpinned.matches(&installed));

        let different = ToolRef::parse("ns/other").unwrap();
        assert!(!different.matches(&installed));
    }

    #[test]
    fn tool_ref_display() {
        assert_eq!(
            ToolRef::parse("ns/calc:0.1.0").unwrap().to_string(),
            "ns/calc:0.1.0"
        );
        assert_eq!(ToolRef::parse("ns/calc").unwrap().to_string(), "ns/calc");
    }
}
