//! In-memory representation of an OSV-shaped vulnerability advisory.
//!
//! The Go vulnerability database binds a module path to semver event
//! ranges and, per affected module, an ecosystem-specific list of
//! affected packages with optional symbol and platform constraints.
//! Field names follow the OSV JSON schema; note that the OSV `package`
//! object actually names a Go *module*.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The ecosystem tag carried by Go advisories.
pub const GO_ECOSYSTEM: &str = "Go";

/// Range kind used by Go advisories. Other kinds are ignored.
pub const RANGE_KIND_SEMVER: &str = "SEMVER";

/// A single advisory record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: String,

    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub published: Option<OffsetDateTime>,

    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified: Option<OffsetDateTime>,

    /// A withdrawal timestamp in the past means the advisory is void
    /// and must never produce a finding.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub withdrawn: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected: Vec<Affected>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_specific: Option<serde_json::Value>,
}

impl Entry {
    /// Whether the advisory was withdrawn at or before `now`.
    pub fn is_withdrawn(&self, now: OffsetDateTime) -> bool {
        matches!(self.withdrawn, Some(w) if w <= now)
    }

    /// The affected blocks naming `module_path`.
    pub fn affected_for<'a, 'b>(
        &'a self,
        module_path: &'b str,
    ) -> impl Iterator<Item = &'a Affected> + use<'a, 'b> {
        self.affected
            .iter()
            .filter(move |a| a.module.path == module_path)
    }
}

/// One module's worth of applicability constraints within an advisory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Affected {
    /// The affected Go module. Called "package" in the OSV schema.
    #[serde(rename = "package")]
    pub module: AffectedModule,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<Range>,

    #[serde(default, skip_serializing_if = "EcosystemSpecific::is_empty")]
    pub ecosystem_specific: EcosystemSpecific,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AffectedModule {
    #[serde(rename = "name")]
    pub path: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ecosystem: String,
}

/// Go-specific applicability data: the affected packages of a module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EcosystemSpecific {
    #[serde(default, rename = "imports", skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<AffectedPackage>,
}

impl EcosystemSpecific {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// An affected package with optional symbol and platform constraints.
/// Empty constraint lists mean "all symbols" / "all platforms".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AffectedPackage {
    pub path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goos: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub goarch: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
}

/// An ordered list of version events. Events alternate
/// introduced/fixed in ascending version order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Range {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<RangeEvent>,
}

impl Range {
    pub fn semver(events: Vec<RangeEvent>) -> Self {
        Self {
            kind: RANGE_KIND_SEMVER.to_string(),
            events,
        }
    }
}

/// A single version event. Exactly one of the fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduced: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<String>,
}

impl RangeEvent {
    pub fn introduced(v: impl Into<String>) -> Self {
        Self {
            introduced: Some(v.into()),
            fixed: None,
        }
    }

    pub fn fixed(v: impl Into<String>) -> Self {
        Self {
            introduced: None,
            fixed: Some(v.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const SAMPLE: &str = r#"{
        "id": "GO-2023-0001",
        "published": "2023-01-10T18:30:00Z",
        "modified": "2023-02-01T09:00:00Z",
        "aliases": ["CVE-2023-0001"],
        "summary": "Header parsing panics on malformed input",
        "affected": [{
            "package": {"name": "example.com/mod", "ecosystem": "Go"},
            "ranges": [{
                "type": "SEMVER",
                "events": [{"introduced": "0"}, {"fixed": "1.2.3"}]
            }],
            "ecosystem_specific": {
                "imports": [{
                    "path": "example.com/mod/parser",
                    "goos": ["linux"],
                    "symbols": ["Parse", "Header.Read"]
                }]
            }
        }],
        "references": [{"type": "FIX", "url": "https://example.com/fix"}]
    }"#;

    #[test]
    fn parses_osv_json() {
        let entry: Entry = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(entry.id, "GO-2023-0001");
        assert_eq!(entry.aliases, vec!["CVE-2023-0001"]);
        assert_eq!(entry.affected.len(), 1);

        let affected = &entry.affected[0];
        assert_eq!(affected.module.path, "example.com/mod");
        assert_eq!(affected.ranges[0].kind, RANGE_KIND_SEMVER);
        assert_eq!(affected.ranges[0].events.len(), 2);

        let pkg = &affected.ecosystem_specific.packages[0];
        assert_eq!(pkg.path, "example.com/mod/parser");
        assert_eq!(pkg.goos, vec!["linux"]);
        assert_eq!(pkg.symbols, vec!["Parse", "Header.Read"]);
    }

    #[test]
    fn round_trips_through_json() {
        let entry: Entry = serde_json::from_str(SAMPLE).unwrap();
        let text = serde_json::to_string(&entry).unwrap();
        let again: Entry = serde_json::from_str(&text).unwrap();
        assert_eq!(entry, again);
    }

    #[test]
    fn withdrawn_is_relative_to_now() {
        let mut entry = Entry {
            id: "GO-2023-0002".into(),
            ..Entry::default()
        };
        assert!(!entry.is_withdrawn(datetime!(2023-06-01 00:00 UTC)));

        entry.withdrawn = Some(datetime!(2023-05-01 00:00 UTC));
        assert!(entry.is_withdrawn(datetime!(2023-06-01 00:00 UTC)));
        assert!(!entry.is_withdrawn(datetime!(2023-04-01 00:00 UTC)));
    }

    #[test]
    fn affected_for_filters_by_module_path() {
        let entry: Entry = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(entry.affected_for("example.com/mod").count(), 1);
        assert_eq!(entry.affected_for("example.com/other").count(), 0);
    }
}
