//! Binary symbol matching.
//!
//! Symbol extraction itself is an opaque collaborator returning the
//! binary's modules, per-package symbol lists, and target platform.
//! This module turns that artifact plus the advisory index into
//! findings.

use crate::emit::module_level_findings;
use crate::finding::{Finding, Frame, ScanLevel};
use crate::index::AdvisoryIndex;
use modvet_graph::DepGraph;
use modvet_osv::version;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// Everything recoverable from an executable without running it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BinaryArtifact {
    pub modules: Vec<modvet_graph::Module>,
    pub goos: String,
    pub goarch: String,
    /// Toolchain tag the binary was built with, e.g. `go1.21.3`.
    pub go_version: String,
    /// Code symbols per package. `None` for stripped binaries.
    pub pkg_symbols: Option<BTreeMap<String, BTreeSet<String>>>,
}

impl BinaryArtifact {
    pub fn is_stripped(&self) -> bool {
        self.pkg_symbols.is_none()
    }
}

/// Abstract supplier of [`BinaryArtifact`]s.
pub trait SymbolSource: Send + Sync {
    fn extract(&self, path: &Path) -> anyhow::Result<BinaryArtifact>;
}

/// Synthetic symbol name standing for "every symbol of the package",
/// used when a stripped binary leaves no symbol table to check.
pub fn every_symbol(pkg_path: &str) -> String {
    format!("{pkg_path}/*")
}

/// Findings for a binary artifact at the requested precision.
pub fn binary_findings(
    graph: &DepGraph,
    index: &AdvisoryIndex,
    artifact: &BinaryArtifact,
    level: ScanLevel,
) -> Vec<Finding> {
    let Some(pkg_symbols) = &artifact.pkg_symbols else {
        // No symbol table to check against: every known-vulnerable
        // symbol is assumed present, and the findings stay at module
        // precision.
        warn!("binary is stripped; reporting at module precision");
        for (_, entries) in index.iter() {
            for entry in entries {
                for affected in &entry.affected {
                    for package in &affected.ecosystem_specific.packages {
                        debug!(
                            advisory = %entry.id,
                            symbol = %every_symbol(&package.path),
                            "assuming symbol present"
                        );
                    }
                }
            }
        }
        return module_level_findings(index);
    };
    if level == ScanLevel::Module {
        return module_level_findings(index);
    }

    let mut findings = module_level_findings(index);
    for (pkg_path, present) in pkg_symbols {
        for (entry, affected_package) in index.package_advisories(pkg_path) {
            // An empty advisory symbol list marks the whole package
            // vulnerable, so every present symbol counts.
            let vulnerable: Vec<&str> = if affected_package.symbols.is_empty() {
                present.iter().map(String::as_str).collect()
            } else {
                affected_package
                    .symbols
                    .iter()
                    .map(String::as_str)
                    .filter(|s| present.contains(*s))
                    .collect()
            };
            if vulnerable.is_empty() {
                continue;
            }

            let module_path = graph.owning_module_path(pkg_path);
            let module_version = graph
                .get_module(&module_path)
                .map(|m| version::canonical(&m.resolved().version))
                .unwrap_or_default();
            let fixed_version = index.fixed_version(&module_path, entry);

            if level == ScanLevel::Package {
                findings.push(Finding {
                    osv: entry.id.clone(),
                    fixed_version,
                    trace: vec![Frame {
                        module: module_path,
                        version: module_version,
                        package: pkg_path.clone(),
                        ..Frame::default()
                    }],
                });
                continue;
            }

            // If any exported vulnerable symbol is present, the
            // unexported ones carry no extra signal.
            let (exported, unexported): (Vec<&str>, Vec<&str>) =
                vulnerable.iter().partition(|s| is_exported_symbol(s));
            let chosen = if exported.is_empty() {
                unexported
            } else {
                exported
            };
            debug!(package = %pkg_path, advisory = %entry.id, symbols = chosen.len(), "matched binary symbols");
            for symbol in chosen {
                let (receiver, function) = split_symbol(symbol);
                findings.push(Finding {
                    osv: entry.id.clone(),
                    fixed_version: fixed_version.clone(),
                    trace: vec![Frame {
                        module: module_path.clone(),
                        version: module_version.clone(),
                        package: pkg_path.clone(),
                        receiver: receiver.to_string(),
                        function: function.to_string(),
                        ..Frame::default()
                    }],
                });
            }
        }
    }
    findings
}

/// Exportedness of the identifier after the optional receiver prefix.
fn is_exported_symbol(symbol: &str) -> bool {
    let name = symbol.rsplit('.').next().unwrap_or(symbol);
    name.chars().next().is_some_and(|c| c.is_uppercase())
}

/// Split `Receiver.Method` into its parts; plain functions have no
/// receiver.
fn split_symbol(symbol: &str) -> (&str, &str) {
    match symbol.rsplit_once('.') {
        Some((receiver, function)) => (receiver.trim_start_matches('*'), function),
        None => ("", symbol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Target;
    use modvet_graph::Module;
    use modvet_osv::entry::{
        Affected, AffectedModule, AffectedPackage, EcosystemSpecific, Entry, Range, RangeEvent,
    };
    use time::macros::datetime;

    fn fixture() -> (DepGraph, AdvisoryIndex) {
        let entry = Entry {
            id: "GO-TEST-0001".into(),
            affected: vec![Affected {
                module: AffectedModule {
                    path: "example.com/v".into(),
                    ecosystem: "Go".into(),
                },
                ranges: vec![Range::semver(vec![
                    RangeEvent::introduced("1.0.0"),
                    RangeEvent::fixed("1.2.3"),
                ])],
                ecosystem_specific: EcosystemSpecific {
                    packages: vec![AffectedPackage {
                        path: "example.com/v".into(),
                        symbols: vec!["V".into(), "hidden".into()],
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        let module = Module::new("example.com/v", "v1.1.0");
        let index = AdvisoryIndex::new(
            vec![(module.clone(), vec![entry])],
            &Target::new("linux", "amd64"),
            datetime!(2024-06-01 12:00 UTC),
        );
        let mut graph = DepGraph::new();
        graph.add_modules([module, Module::new("example.com/app", "")]);
        (graph, index)
    }

    fn artifact(symbols: Option<Vec<(&str, Vec<&str>)>>) -> BinaryArtifact {
        BinaryArtifact {
            modules: vec![Module::new("example.com/v", "v1.1.0")],
            goos: "linux".into(),
            goarch: "amd64".into(),
            go_version: "go1.21.0".into(),
            pkg_symbols: symbols.map(|pkgs| {
                pkgs.into_iter()
                    .map(|(pkg, syms)| {
                        (
                            pkg.to_string(),
                            syms.into_iter().map(String::from).collect(),
                        )
                    })
                    .collect()
            }),
        }
    }

    #[test]
    fn symbol_scan_emits_one_frame_traces() {
        let (graph, index) = fixture();
        let binary = artifact(Some(vec![("example.com/v", vec!["V", "main"])]));
        let findings = binary_findings(&graph, &index, &binary, ScanLevel::Symbol);

        let symbol_findings: Vec<&Finding> = findings
            .iter()
            .filter(|f| f.precision() == ScanLevel::Symbol)
            .collect();
        assert_eq!(symbol_findings.len(), 1);
        let frame = &symbol_findings[0].trace[0];
        assert_eq!(frame.module, "example.com/v");
        assert_eq!(frame.package, "example.com/v");
        assert_eq!(frame.function, "V");
        assert_eq!(symbol_findings[0].fixed_version, "v1.2.3");
    }

    #[test]
    fn absent_symbols_do_not_match() {
        let (graph, index) = fixture();
        let binary = artifact(Some(vec![("example.com/v", vec!["Other"])]));
        let findings = binary_findings(&graph, &index, &binary, ScanLevel::Symbol);
        assert!(findings.iter().all(|f| f.precision() == ScanLevel::Module));
    }

    #[test]
    fn exported_presence_suppresses_unexported() {
        let (graph, index) = fixture();
        let both = artifact(Some(vec![("example.com/v", vec!["V", "hidden"])]));
        let findings = binary_findings(&graph, &index, &both, ScanLevel::Symbol);
        let symbols: Vec<&str> = findings
            .iter()
            .filter(|f| f.precision() == ScanLevel::Symbol)
            .map(|f| f.trace[0].function.as_str())
            .collect();
        assert_eq!(symbols, vec!["V"]);

        let only_hidden = artifact(Some(vec![("example.com/v", vec!["hidden"])]));
        let findings = binary_findings(&graph, &index, &only_hidden, ScanLevel::Symbol);
        let symbols: Vec<&str> = findings
            .iter()
            .filter(|f| f.precision() == ScanLevel::Symbol)
            .map(|f| f.trace[0].function.as_str())
            .collect();
        assert_eq!(symbols, vec!["hidden"]);
    }

    #[test]
    fn methods_recover_their_receiver() {
        let entry = Entry {
            id: "GO-TEST-0002".into(),
            affected: vec![Affected {
                module: AffectedModule {
                    path: "example.com/v".into(),
                    ecosystem: "Go".into(),
                },
                ranges: vec![Range::semver(vec![RangeEvent::introduced("0")])],
                ecosystem_specific: EcosystemSpecific {
                    packages: vec![AffectedPackage {
                        path: "example.com/v".into(),
                        symbols: vec!["Conn.Close".into()],
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        let module = Module::new("example.com/v", "v1.1.0");
        let index = AdvisoryIndex::new(
            vec![(module.clone(), vec![entry])],
            &Target::default(),
            datetime!(2024-06-01 12:00 UTC),
        );
        let mut graph = DepGraph::new();
        graph.add_modules([module]);

        let binary = artifact(Some(vec![("example.com/v", vec!["Conn.Close"])]));
        let findings = binary_findings(&graph, &index, &binary, ScanLevel::Symbol);
        let frame = &findings
            .iter()
            .find(|f| f.precision() == ScanLevel::Symbol)
            .unwrap()
            .trace[0];
        assert_eq!(frame.receiver, "Conn");
        assert_eq!(frame.function, "Close");
    }

    #[test]
    fn stripped_binaries_stay_at_module_precision() {
        let (graph, index) = fixture();
        let stripped = artifact(None);
        let findings = binary_findings(&graph, &index, &stripped, ScanLevel::Symbol);
        assert!(!findings.is_empty());
        assert!(findings.iter().all(|f| f.precision() == ScanLevel::Module));
    }

    #[test]
    fn package_scan_requires_a_present_symbol() {
        let (graph, index) = fixture();
        let present = artifact(Some(vec![("example.com/v", vec!["V"])]));
        let findings = binary_findings(&graph, &index, &present, ScanLevel::Package);
        assert!(findings.iter().any(|f| f.precision() == ScanLevel::Package));

        let absent = artifact(Some(vec![("example.com/v", vec!["Other"])]));
        let findings = binary_findings(&graph, &index, &absent, ScanLevel::Package);
        assert!(findings.iter().all(|f| f.precision() == ScanLevel::Module));
    }

    #[test]
    fn every_symbol_marker_names_the_package() {
        assert_eq!(every_symbol("example.com/v"), "example.com/v/*");
    }
}
