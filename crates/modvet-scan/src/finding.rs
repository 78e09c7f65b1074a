//! Vulnerability findings and their precision levels.

use modvet_graph::Position;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Precision of a finding, and the scan depth requested by the user.
/// The order is total: a symbol finding is more specific than a
/// package finding, which is more specific than a module finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ScanLevel {
    Module,
    Package,
    #[default]
    Symbol,
}

impl fmt::Display for ScanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanLevel::Module => write!(f, "module"),
            ScanLevel::Package => write!(f, "package"),
            ScanLevel::Symbol => write!(f, "symbol"),
        }
    }
}

/// One frame of a call stack witness. Traces run sink to source: the
/// vulnerable symbol first, the program entry point last.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Frame {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Frame {
    /// The advisory-style symbol name, `Func` or `Receiver.Method`.
    pub fn symbol(&self) -> String {
        if self.receiver.is_empty() {
            self.function.clone()
        } else {
            format!("{}.{}", self.receiver, self.function)
        }
    }
}

/// One actionable record tying an advisory to a location in the
/// program, at module, package, or symbol precision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    #[serde(rename = "OSV")]
    pub osv: String,
    #[serde(
        rename = "FixedVersion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub fixed_version: String,
    #[serde(rename = "Trace", default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<Frame>,
}

impl Finding {
    /// The sink frame: the most specific location of the finding.
    pub fn sink(&self) -> Option<&Frame> {
        self.trace.first()
    }

    pub fn precision(&self) -> ScanLevel {
        match self.trace.first() {
            Some(frame) if !frame.function.is_empty() => ScanLevel::Symbol,
            Some(frame) if !frame.package.is_empty() => ScanLevel::Package,
            _ => ScanLevel::Module,
        }
    }

    /// Reject malformed findings: every frame needs a module before it
    /// may carry a version or package, and a package before a
    /// function.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.osv.is_empty() {
            return Err("finding has no advisory id".to_string());
        }
        if self.trace.is_empty() {
            return Err(format!("finding {}: empty trace", self.osv));
        }
        for frame in &self.trace {
            if !frame.version.is_empty() && frame.module.is_empty() {
                return Err(format!("finding {}: Version set without Module", self.osv));
            }
            if !frame.package.is_empty() && frame.module.is_empty() {
                return Err(format!("finding {}: Package set without Module", self.osv));
            }
            if !frame.function.is_empty() && frame.package.is_empty() {
                return Err(format!("finding {}: Function set without Package", self.osv));
            }
        }
        Ok(())
    }

    /// Ordering key: advisory id, then module, package, and function
    /// of the sink frame.
    pub fn sort_key(&self) -> (&str, &str, &str, &str, &str) {
        match self.trace.first() {
            Some(frame) => (
                &self.osv,
                &frame.module,
                &frame.package,
                &frame.function,
                &frame.receiver,
            ),
            None => (&self.osv, "", "", "", ""),
        }
    }

    /// The trace with positions erased, for duplicate suppression.
    pub fn compact_trace(&self) -> Vec<(&str, &str, &str, &str)> {
        self.trace
            .iter()
            .map(|f| {
                (
                    f.module.as_str(),
                    f.package.as_str(),
                    f.receiver.as_str(),
                    f.function.as_str(),
                )
            })
            .collect()
    }
}
