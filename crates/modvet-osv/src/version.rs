//! Version semantics for Go modules and toolchains.
//!
//! Advisory ranges carry semver strings without the `v` prefix that
//! module versions use, and the standard library is versioned by
//! toolchain tags (`go1.19.4`). Everything here canonicalizes to
//! `v`-prefixed semver before comparing.

use crate::entry::{Affected, Range, RANGE_KIND_SEMVER};
use semver::{Prerelease, Version};
use std::cmp::Ordering;

/// Ensure the `v` prefix module versions carry.
pub fn canonical(v: &str) -> String {
    let v = v.trim();
    if v.is_empty() || v.starts_with('v') {
        v.to_string()
    } else {
        format!("v{v}")
    }
}

/// Parse a version string, with or without the `v` prefix. Shorthand
/// forms are completed (`1.19` parses as 1.19.0). Build metadata is
/// ignored for comparison, matching Go's semver rules.
pub fn parse(v: &str) -> Option<Version> {
    let v = v.trim();
    let v = v.strip_prefix('v').unwrap_or(v);
    if v.is_empty() {
        return None;
    }
    let core_and_pre = match v.split_once('+') {
        Some((head, _build)) => head,
        None => v,
    };
    let (core, pre) = match core_and_pre.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (core_and_pre, None),
    };

    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = match parts.next() {
        Some(p) => p.parse::<u64>().ok()?,
        None => 0,
    };
    let patch = match parts.next() {
        Some(p) => p.parse::<u64>().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    let mut version = Version::new(major, minor, patch);
    if let Some(pre) = pre {
        version.pre = Prerelease::new(pre).ok()?;
    }
    Some(version)
}

pub fn is_valid(v: &str) -> bool {
    parse(v).is_some()
}

/// Compare two version strings. `None` if either fails to parse.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    Some(parse(a)?.cmp(&parse(b)?))
}

/// Whether `version` falls inside any of the declared ranges.
///
/// An empty installed version is never affected (unpinned modules must
/// not raise false alarms); an empty range list means every version is
/// affected.
pub fn affects(ranges: &[Range], version: &str) -> bool {
    let v = match parse(version) {
        Some(v) => v,
        None => return false,
    };
    if ranges.is_empty() {
        return true;
    }
    ranges.iter().any(|r| range_contains(r, &v))
}

fn range_contains(range: &Range, v: &Version) -> bool {
    if range.kind != RANGE_KIND_SEMVER {
        return false;
    }
    // Events alternate introduced/fixed in ascending order, so a
    // single in-order walk settles membership.
    let mut vulnerable = false;
    for event in &range.events {
        if let Some(introduced) = &event.introduced {
            if introduced == "0" || parse(introduced).is_some_and(|iv| *v >= iv) {
                vulnerable = true;
            }
        }
        if let Some(fixed) = &event.fixed {
            if parse(fixed).is_some_and(|fv| *v >= fv) {
                vulnerable = false;
            }
        }
    }
    vulnerable
}

/// The maximum `fixed` version across all semver ranges of the blocks
/// naming `module_path`. Any matching range left open by an
/// `introduced` event without a subsequent fix means the module is
/// unfixed, which forces the result empty.
pub fn latest_fixed(module_path: &str, affected: &[Affected]) -> String {
    let mut latest: Option<Version> = None;
    let mut unfixed = false;

    for a in affected.iter().filter(|a| a.module.path == module_path) {
        for range in &a.ranges {
            if range.kind != RANGE_KIND_SEMVER {
                continue;
            }
            let mut open = false;
            for event in &range.events {
                if event.introduced.is_some() {
                    open = true;
                }
                if let Some(fixed) = &event.fixed {
                    open = false;
                    if let Some(fv) = parse(fixed) {
                        if latest.as_ref().map_or(true, |cur| fv > *cur) {
                            latest = Some(fv);
                        }
                    }
                }
            }
            if open {
                unfixed = true;
            }
        }
    }

    if unfixed {
        return String::new();
    }
    latest.map(|v| format!("v{v}")).unwrap_or_default()
}

/// Map a toolchain tag (`go1.19`, `go1.19.4`, `go1.20rc1`) to
/// `v`-prefixed semver. `None` if the tag is not a toolchain tag.
pub fn go_tag_to_semver(tag: &str) -> Option<String> {
    let rest = tag.strip_prefix("go")?;
    let numeric_end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    let (core, suffix) = rest.split_at(numeric_end);
    if core.is_empty() {
        return None;
    }

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty() || p.parse::<u64>().is_err()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }

    let mut out = format!("v{}", parts.join("."));
    if !suffix.is_empty() {
        out.push('-');
        out.push_str(suffix);
    }
    Some(out)
}

/// Map semver back to the toolchain tag used for display
/// (`v1.19.4` → `go1.19.4`, `v1.19.0` → `go1.19`).
pub fn semver_to_go_tag(v: &str) -> String {
    let Some(version) = parse(v) else {
        return v.to_string();
    };
    let mut tag = if version.patch == 0 {
        format!("go{}.{}", version.major, version.minor)
    } else {
        format!("go{}.{}.{}", version.major, version.minor, version.patch)
    };
    if !version.pre.is_empty() {
        tag.push_str(version.pre.as_str());
    }
    tag
}
