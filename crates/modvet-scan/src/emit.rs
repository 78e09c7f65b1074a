//! Finding emission: ordering, deduplication, and the osv-before-
//! finding contract.

use crate::error::{Result, ScanError};
use crate::finding::{Finding, Frame, ScanLevel};
use crate::handler::{Config, Handler, Progress};
use crate::index::AdvisoryIndex;
use modvet_osv::version;
use modvet_osv::Entry;
use std::collections::BTreeSet;
use tracing::debug;

/// Module-level findings: one per advisory of each required module.
pub fn module_level_findings(index: &AdvisoryIndex) -> Vec<Finding> {
    let mut out = Vec::new();
    for (module, entries) in index.iter() {
        for entry in entries {
            out.push(Finding {
                osv: entry.id.clone(),
                fixed_version: index.fixed_version(&module.path, entry),
                trace: vec![Frame {
                    module: module.path.clone(),
                    version: version::canonical(&module.resolved().version),
                    ..Frame::default()
                }],
            });
        }
    }
    out
}

/// Serializes the event stream to a handler: config first, progress
/// at will, each advisory at most once and before its first finding,
/// findings ordered and deduplicated, flush last.
pub struct Emitter<'h> {
    handler: &'h mut dyn Handler,
    emitted_osv: BTreeSet<String>,
}

impl<'h> Emitter<'h> {
    pub fn new(handler: &'h mut dyn Handler) -> Self {
        Self {
            handler,
            emitted_osv: BTreeSet::new(),
        }
    }

    pub fn config(&mut self, config: &Config) -> Result<()> {
        self.handler.config(config).map_err(ScanError::Handler)
    }

    pub fn progress(&mut self, message: impl Into<String>) -> Result<()> {
        self.handler
            .progress(&Progress {
                message: message.into(),
            })
            .map_err(ScanError::Handler)
    }

    /// Emit advisories without findings, for module queries.
    pub fn osv_entries<'e>(&mut self, entries: impl IntoIterator<Item = &'e Entry>) -> Result<()> {
        let mut sorted: Vec<&Entry> = entries.into_iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        for entry in sorted {
            if self.emitted_osv.insert(entry.id.clone()) {
                self.handler.osv(entry).map_err(ScanError::Handler)?;
            }
        }
        Ok(())
    }

    /// Validate, deduplicate, order, and stream findings. `index`
    /// supplies the advisory records referenced by them.
    pub fn findings(&mut self, index: &AdvisoryIndex, findings: Vec<Finding>) -> Result<()> {
        for finding in &findings {
            finding.validate().map_err(ScanError::InvalidFinding)?;
        }

        let mut findings = retain_most_specific(findings);
        findings.sort_by(|a, b| {
            a.sort_key()
                .cmp(&b.sort_key())
                .then_with(|| a.trace.len().cmp(&b.trace.len()))
                .then_with(|| a.compact_trace().cmp(&b.compact_trace()))
        });

        // One finding per advisory and locator; wrapper or otherwise
        // identical traces collapse to the first.
        let mut seen_locator: BTreeSet<(String, String, String, String, String)> = BTreeSet::new();
        let mut seen_trace: BTreeSet<String> = BTreeSet::new();
        let mut emitted = 0usize;
        for finding in findings {
            let sink = finding.sink().cloned().unwrap_or_default();
            let locator = (
                finding.osv.clone(),
                sink.module.clone(),
                sink.package.clone(),
                sink.receiver.clone(),
                sink.function.clone(),
            );
            if !seen_locator.insert(locator) {
                continue;
            }
            let compact = format!("{}|{:?}", finding.osv, finding.compact_trace());
            if !seen_trace.insert(compact) {
                continue;
            }

            if self.emitted_osv.insert(finding.osv.clone()) {
                let entry = lookup_entry(index, &finding).ok_or_else(|| {
                    ScanError::Invariant(format!(
                        "finding references unknown advisory {}",
                        finding.osv
                    ))
                })?;
                self.handler.osv(entry).map_err(ScanError::Handler)?;
            }
            self.handler.finding(&finding).map_err(ScanError::Handler)?;
            emitted += 1;
        }
        debug!(count = emitted, "emitted findings");
        Ok(())
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.handler.flush()
    }
}

fn lookup_entry<'i>(index: &'i AdvisoryIndex, finding: &Finding) -> Option<&'i Entry> {
    let module = finding.sink().map(|f| f.module.as_str())?;
    index.entry_for(module, &finding.osv)
}

/// Per `(advisory, module)` keep only findings at the deepest
/// precision present, and likewise per `(advisory, module, package)`:
/// `module < package < symbol`.
fn retain_most_specific(findings: Vec<Finding>) -> Vec<Finding> {
    let mut deeper_than_module: BTreeSet<(String, String)> = BTreeSet::new();
    let mut deeper_than_package: BTreeSet<(String, String, String)> = BTreeSet::new();
    for finding in &findings {
        let Some(sink) = finding.sink() else { continue };
        match finding.precision() {
            ScanLevel::Module => {}
            ScanLevel::Package => {
                deeper_than_module.insert((finding.osv.clone(), sink.module.clone()));
            }
            ScanLevel::Symbol => {
                deeper_than_module.insert((finding.osv.clone(), sink.module.clone()));
                deeper_than_package.insert((
                    finding.osv.clone(),
                    sink.module.clone(),
                    sink.package.clone(),
                ));
            }
        }
    }

    findings
        .into_iter()
        .filter(|finding| {
            let Some(sink) = finding.sink() else {
                return false;
            };
            match finding.precision() {
                ScanLevel::Module => {
                    !deeper_than_module.contains(&(finding.osv.clone(), sink.module.clone()))
                }
                ScanLevel::Package => !deeper_than_package.contains(&(
                    finding.osv.clone(),
                    sink.module.clone(),
                    sink.package.clone(),
                )),
                ScanLevel::Symbol => true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{MemHandler, Message};
    use crate::index::Target;
    use modvet_graph::Module;
    use modvet_osv::entry::{
        Affected, AffectedModule, AffectedPackage, EcosystemSpecific, Range, RangeEvent,
    };
    use time::macros::datetime;

    fn fixture_index() -> AdvisoryIndex {
        let make = |id: &str| Entry {
            id: id.into(),
            affected: vec![Affected {
                module: AffectedModule {
                    path: "example.com/m".into(),
                    ecosystem: "Go".into(),
                },
                ranges: vec![Range::semver(vec![
                    RangeEvent::introduced("0"),
                    RangeEvent::fixed("1.2.3"),
                ])],
                ecosystem_specific: EcosystemSpecific {
                    packages: vec![AffectedPackage {
                        path: "example.com/m/p".into(),
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        AdvisoryIndex::new(
            vec![(
                Module::new("example.com/m", "v1.0.0"),
                vec![make("GO-A"), make("GO-B")],
            )],
            &Target::default(),
            datetime!(2024-06-01 12:00 UTC),
        )
    }

    fn module_finding(osv: &str) -> Finding {
        Finding {
            osv: osv.into(),
            fixed_version: "v1.2.3".into(),
            trace: vec![Frame {
                module: "example.com/m".into(),
                version: "v1.0.0".into(),
                ..Frame::default()
            }],
        }
    }

    fn package_finding(osv: &str) -> Finding {
        let mut finding = module_finding(osv);
        finding.trace[0].package = "example.com/m/p".into();
        finding
    }

    fn symbol_finding(osv: &str, function: &str) -> Finding {
        let mut finding = package_finding(osv);
        finding.trace[0].function = function.into();
        finding
    }

    #[test]
    fn most_specific_finding_wins() {
        let mut handler = MemHandler::new();
        {
            let mut emitter = Emitter::new(&mut handler);
            emitter
                .findings(
                    &fixture_index(),
                    vec![
                        module_finding("GO-A"),
                        package_finding("GO-A"),
                        symbol_finding("GO-A", "F"),
                    ],
                )
                .unwrap();
        }
        let findings = handler.findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].precision(), ScanLevel::Symbol);
    }

    #[test]
    fn package_survives_without_symbol_findings() {
        let mut handler = MemHandler::new();
        {
            let mut emitter = Emitter::new(&mut handler);
            emitter
                .findings(
                    &fixture_index(),
                    vec![module_finding("GO-A"), package_finding("GO-A")],
                )
                .unwrap();
        }
        let findings = handler.findings();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].precision(), ScanLevel::Package);
    }

    #[test]
    fn osv_precedes_first_referencing_finding_exactly_once() {
        let mut handler = MemHandler::new();
        {
            let mut emitter = Emitter::new(&mut handler);
            emitter
                .findings(
                    &fixture_index(),
                    vec![
                        symbol_finding("GO-B", "G"),
                        symbol_finding("GO-A", "F"),
                        symbol_finding("GO-A", "G"),
                    ],
                )
                .unwrap();
        }

        let kinds: Vec<String> = handler
            .messages
            .iter()
            .map(|m| match m {
                Message::Osv(e) => format!("osv:{}", e.id),
                Message::Finding(f) => format!("finding:{}", f.osv),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "osv:GO-A",
                "finding:GO-A",
                "finding:GO-A",
                "osv:GO-B",
                "finding:GO-B"
            ]
        );
    }

    #[test]
    fn duplicate_locators_and_traces_collapse() {
        let mut handler = MemHandler::new();
        {
            let mut emitter = Emitter::new(&mut handler);
            emitter
                .findings(
                    &fixture_index(),
                    vec![
                        symbol_finding("GO-A", "F"),
                        symbol_finding("GO-A", "F"),
                    ],
                )
                .unwrap();
        }
        assert_eq!(handler.findings().len(), 1);
    }

    #[test]
    fn invalid_findings_are_rejected() {
        let mut handler = MemHandler::new();
        let mut emitter = Emitter::new(&mut handler);
        let mut bad = symbol_finding("GO-A", "F");
        bad.trace[0].package.clear();
        assert!(matches!(
            emitter.findings(&fixture_index(), vec![bad]),
            Err(ScanError::InvalidFinding(_))
        ));
    }

    #[test]
    fn unknown_advisory_is_an_invariant_violation() {
        let mut handler = MemHandler::new();
        let mut emitter = Emitter::new(&mut handler);
        assert!(matches!(
            emitter.findings(&fixture_index(), vec![symbol_finding("GO-NOPE", "F")]),
            Err(ScanError::Invariant(_))
        ));
    }

    #[test]
    fn module_findings_carry_fixed_versions() {
        let findings = module_level_findings(&fixture_index());
        assert_eq!(findings.len(), 2);
        assert!(findings.iter().all(|f| f.fixed_version == "v1.2.3"));
        assert!(findings.iter().all(|f| f.precision() == ScanLevel::Module));
    }
}
