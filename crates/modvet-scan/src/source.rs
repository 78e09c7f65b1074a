//! Source reachability: imported-symbol detection and the call-graph
//! slice from entry points to vulnerable symbols.

use crate::callgraph::{CallGraph, NodeId};
use crate::cancel::CancelToken;
use crate::emit::module_level_findings;
use crate::error::{Result, ScanError};
use crate::finding::{Finding, Frame};
use crate::index::AdvisoryIndex;
use crate::witness::{collapse_wrappers, stack_to_trace, update_init_positions, witness, StackFrame};
use modvet_graph::{DepGraph, Module};
use modvet_osv::version;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tracing::debug;

/// What to load and how.
#[derive(Debug, Clone, Default)]
pub struct LoadConfig {
    pub dir: PathBuf,
    pub patterns: Vec<String>,
    pub tags: Vec<String>,
    pub include_tests: bool,
}

/// A loaded program: the typed package graph plus the toolchain and
/// platform that produced it.
#[derive(Debug, Clone, Default)]
pub struct LoadedProgram {
    pub graph: DepGraph,
    /// Toolchain tag, e.g. `go1.21.3`.
    pub toolchain_version: String,
    pub goos: String,
    pub goarch: String,
}

/// The package/module loader. Out-of-scope machinery (the build tool
/// and type checker) lives behind this seam.
pub trait SourceLoader: Send + Sync {
    fn load(&self, config: &LoadConfig) -> anyhow::Result<LoadedProgram>;

    /// Module list only, for module-level scans: no packages, no type
    /// information.
    fn load_modules(&self, config: &LoadConfig) -> anyhow::Result<Vec<Module>>;
}

/// The SSA/call-graph builder supplied by the toolchain, behind a
/// seam so tests can inject hand-built graphs.
pub trait CallGraphBuilder: Send + Sync {
    fn build(&self, program: &LoadedProgram, cancel: &CancelToken) -> anyhow::Result<CallGraph>;
}

/// A candidate vulnerability: an advisory symbol present in an
/// imported package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub osv: String,
    pub module: String,
    pub package: String,
    pub symbol: String,
}

/// Reject programs whose packages were loaded in distinct lexical
/// coordinate spaces; positions would be meaningless across them.
pub fn check_single_origin(graph: &DepGraph) -> Result<()> {
    let origins: BTreeSet<&str> = graph
        .packages()
        .map(|p| p.origin.as_str())
        .filter(|o| !o.is_empty())
        .collect();
    if origins.len() > 1 {
        return Err(ScanError::Invariant(format!(
            "packages come from {} distinct loader sessions; load all packages in one session",
            origins.len()
        )));
    }
    Ok(())
}

/// Stage 1: traverse the package graph top-down and enumerate every
/// `(advisory, symbol, package)` candidate. An advisory with an empty
/// symbol list vouches for every symbol the package defines; a listed
/// symbol counts only if the package actually defines it.
pub fn imported_candidates(graph: &DepGraph, index: &AdvisoryIndex) -> Vec<Candidate> {
    let mut candidates: BTreeSet<Candidate> = BTreeSet::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = graph.top_packages().to_vec().into();
    visited.extend(graph.top_packages().iter().cloned());

    while let Some(path) = queue.pop_front() {
        let Some(package) = graph.get_package(&path) else {
            continue;
        };
        for import in &package.imports {
            if visited.insert(import.clone()) {
                queue.push_back(import.clone());
            }
        }

        let advisories = index.package_advisories(&package.path);
        if advisories.is_empty() {
            continue;
        }
        let defined: BTreeSet<String> = package.symbols.iter().map(|s| s.symbol()).collect();
        for (entry, affected_package) in advisories {
            let matched: Vec<String> = if affected_package.symbols.is_empty() {
                defined.iter().cloned().collect()
            } else {
                affected_package
                    .symbols
                    .iter()
                    .filter(|s| defined.contains(*s))
                    .cloned()
                    .collect()
            };
            for symbol in matched {
                candidates.insert(Candidate {
                    osv: entry.id.clone(),
                    module: package.module.clone(),
                    package: package.path.clone(),
                    symbol,
                });
            }
        }
    }

    debug!(count = candidates.len(), "imported vulnerable symbols");
    candidates.into_iter().collect()
}

/// Package-level findings: one per `(advisory, package)` with at
/// least one candidate symbol.
pub fn package_level_findings(
    graph: &DepGraph,
    index: &AdvisoryIndex,
    candidates: &[Candidate],
) -> Vec<Finding> {
    let mut seen: BTreeSet<(&str, &str, &str)> = BTreeSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        if !seen.insert((&candidate.osv, &candidate.module, &candidate.package)) {
            continue;
        }
        let version = graph
            .get_module(&candidate.module)
            .map(|m| version::canonical(&m.resolved().version))
            .unwrap_or_default();
        let fixed_version = index
            .entry_for(&candidate.module, &candidate.osv)
            .map(|entry| index.fixed_version(&candidate.module, entry))
            .unwrap_or_default();
        out.push(Finding {
            osv: candidate.osv.clone(),
            fixed_version,
            trace: vec![Frame {
                module: candidate.module.clone(),
                version,
                package: candidate.package.clone(),
                ..Frame::default()
            }],
        });
    }
    out
}

/// The slice: nodes both backward-reachable from some sink and
/// forward-reachable from some entry point.
#[derive(Debug, Default)]
pub struct SliceOutcome {
    pub nodes: BTreeSet<NodeId>,
    pub reached_sinks: BTreeSet<NodeId>,
}

/// Stage 3: two-pass intersection over the call graph. The backward
/// closure from the sinks finds every caller chain; intersecting its
/// entry points and closing forward again discards chains that no
/// entry point actually starts.
pub fn slice(cg: &CallGraph, sinks: &BTreeSet<NodeId>) -> SliceOutcome {
    let mut mirror: DiGraph<(), ()> = DiGraph::with_capacity(cg.len(), cg.len());
    for _ in 0..cg.len() {
        mirror.add_node(());
    }
    for (id, node) in cg.nodes() {
        for site in &node.call_sites {
            mirror.add_edge(NodeIndex::new(site.caller), NodeIndex::new(id), ());
        }
    }

    let reversed = Reversed(&mirror);
    let mut backward: BTreeSet<NodeId> = BTreeSet::new();
    let mut dfs = Dfs::empty(reversed);
    for &sink in sinks {
        dfs.stack.push(NodeIndex::new(sink));
    }
    while let Some(node) = dfs.next(reversed) {
        backward.insert(node.index());
    }

    let reached_entries: Vec<NodeId> = cg
        .entries()
        .iter()
        .copied()
        .filter(|e| backward.contains(e))
        .collect();

    let mut forward: BTreeSet<NodeId> = BTreeSet::new();
    let mut dfs = Dfs::empty(&mirror);
    for &entry in &reached_entries {
        dfs.stack.push(NodeIndex::new(entry));
    }
    while let Some(node) = dfs.next(&mirror) {
        forward.insert(node.index());
    }

    let nodes: BTreeSet<NodeId> = backward.intersection(&forward).copied().collect();
    let reached_sinks: BTreeSet<NodeId> = sinks.intersection(&nodes).copied().collect();
    debug!(
        slice = nodes.len(),
        sinks = sinks.len(),
        reached = reached_sinks.len(),
        "computed reachability slice"
    );
    SliceOutcome {
        nodes,
        reached_sinks,
    }
}

/// Mirror the surviving edges into a finding graph: a fresh arena
/// holding only slice nodes, each surviving edge recorded as a call
/// site on its callee.
pub fn project(cg: &CallGraph, keep: &BTreeSet<NodeId>) -> (CallGraph, BTreeMap<NodeId, NodeId>) {
    let mut out = CallGraph::new();
    let mut remap: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    for &id in keep {
        let mut node = cg.node(id).clone();
        node.call_sites = Vec::new();
        remap.insert(id, out.add_func(node));
    }
    for &id in keep {
        for site in &cg.node(id).call_sites {
            if let Some(&caller) = remap.get(&site.caller) {
                out.add_call(caller, remap[&id], site.clone());
            }
        }
    }
    for &entry in cg.entries() {
        if let Some(&mapped) = remap.get(&entry) {
            out.mark_entry(mapped);
        }
    }
    (out, remap)
}

/// Stages 1–4 for a symbol-level source scan: candidates, slice, and
/// one witness stack per reached candidate. The returned findings mix
/// module, package, and symbol precision; the emitter keeps the most
/// specific per locator.
pub fn analyze_source(
    graph: &DepGraph,
    index: &AdvisoryIndex,
    cg: &mut CallGraph,
    cancel: &CancelToken,
) -> Result<Vec<Finding>> {
    check_single_origin(graph)?;
    cancel.check()?;

    let candidates = imported_candidates(graph, index);
    let mut findings = module_level_findings(index);
    findings.extend(package_level_findings(graph, index, &candidates));

    cg.mark_entry_points(graph);

    let mut sinks_per_candidate: Vec<Vec<NodeId>> = Vec::with_capacity(candidates.len());
    let mut all_sinks: BTreeSet<NodeId> = BTreeSet::new();
    for candidate in &candidates {
        let ids = cg.lookup_symbol(&candidate.package, &candidate.symbol);
        all_sinks.extend(ids.iter().copied());
        sinks_per_candidate.push(ids);
    }
    cancel.check()?;

    let outcome = slice(cg, &all_sinks);
    let (finding_graph, remap) = project(cg, &outcome.nodes);
    let reached_projected: BTreeSet<NodeId> = outcome
        .reached_sinks
        .iter()
        .filter_map(|id| remap.get(id).copied())
        .collect();

    for (candidate, sink_ids) in candidates.iter().zip(&sinks_per_candidate) {
        cancel.check()?;
        let own: BTreeSet<NodeId> = sink_ids
            .iter()
            .filter(|id| outcome.reached_sinks.contains(id))
            .filter_map(|id| remap.get(id).copied())
            .collect();
        if own.is_empty() {
            continue;
        }
        // The witness for this symbol must not be drowned by a stack
        // routed through a different vulnerable symbol.
        let avoid: BTreeSet<NodeId> = reached_projected.difference(&own).copied().collect();

        let mut best: Option<Vec<StackFrame>> = None;
        for &sink in &own {
            if let Some(stack) = witness(&finding_graph, sink, &avoid) {
                let better = match &best {
                    None => true,
                    Some(current) => stack_order_key(&finding_graph, &stack)
                        < stack_order_key(&finding_graph, current),
                };
                if better {
                    best = Some(stack);
                }
            }
        }
        let Some(stack) = best else {
            continue;
        };

        let mut stack = collapse_wrappers(&finding_graph, stack);
        update_init_positions(&finding_graph, graph, &mut stack);

        let fixed_version = index
            .entry_for(&candidate.module, &candidate.osv)
            .map(|entry| index.fixed_version(&candidate.module, entry))
            .unwrap_or_default();
        findings.push(Finding {
            osv: candidate.osv.clone(),
            fixed_version,
            trace: stack_to_trace(&finding_graph, graph, &stack),
        });
    }

    Ok(findings)
}

/// Deterministic stack preference: shortest first, then lexicographic
/// on the stringified frames.
pub(crate) fn stack_order_key(cg: &CallGraph, stack: &[StackFrame]) -> (usize, String) {
    let rendered: Vec<String> = stack.iter().map(|f| cg.node(f.func).key()).collect();
    (stack.len(), rendered.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::{CallSite, FuncNode};
    use crate::index::Target;
    use modvet_graph::{FuncSymbol, Package};
    use modvet_osv::entry::{
        Affected, AffectedModule, AffectedPackage, EcosystemSpecific, Entry, Range, RangeEvent,
    };
    use time::macros::datetime;

    fn fixture_index() -> AdvisoryIndex {
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
                        symbols: vec!["V".into()],
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        AdvisoryIndex::new(
            vec![(Module::new("example.com/v", "v1.1.0"), vec![entry])],
            &Target::default(),
            datetime!(2024-06-01 12:00 UTC),
        )
    }

    fn fixture_graph(imports_vulnerable: bool) -> DepGraph {
        let mut graph = DepGraph::new();
        graph.add_modules([
            Module::new("example.com/app", ""),
            Module::new("example.com/v", "v1.1.0"),
        ]);
        let imports = if imports_vulnerable {
            vec!["example.com/v".to_string()]
        } else {
            Vec::new()
        };
        graph.add_package(Package {
            path: "example.com/app".into(),
            module: "example.com/app".into(),
            imports,
            symbols: vec![FuncSymbol::func("main")],
            origin: "load-1".into(),
            ..Package::default()
        });
        graph.add_package(Package {
            path: "example.com/v".into(),
            module: "example.com/v".into(),
            symbols: vec![FuncSymbol::func("V"), FuncSymbol::func("helper")],
            origin: "load-1".into(),
            ..Package::default()
        });
        graph.set_top(vec!["example.com/app".into()]);
        graph
    }

    #[test]
    fn candidates_require_imported_package() {
        let index = fixture_index();
        let reached = imported_candidates(&fixture_graph(true), &index);
        assert_eq!(reached.len(), 1);
        assert_eq!(reached[0].symbol, "V");

        let unreached = imported_candidates(&fixture_graph(false), &index);
        assert!(unreached.is_empty());
    }

    #[test]
    fn candidates_intersect_with_defined_symbols() {
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
                        symbols: vec!["Missing".into()],
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        let index = AdvisoryIndex::new(
            vec![(Module::new("example.com/v", "v1.1.0"), vec![entry])],
            &Target::default(),
            datetime!(2024-06-01 12:00 UTC),
        );
        // The advisory lists a symbol the package does not define.
        assert!(imported_candidates(&fixture_graph(true), &index).is_empty());
    }

    #[test]
    fn every_symbol_semantics_with_empty_table() {
        let entry = Entry {
            id: "GO-TEST-0003".into(),
            affected: vec![Affected {
                module: AffectedModule {
                    path: "example.com/v".into(),
                    ecosystem: "Go".into(),
                },
                ranges: vec![Range::semver(vec![RangeEvent::introduced("0")])],
                ecosystem_specific: EcosystemSpecific {
                    packages: vec![AffectedPackage {
                        path: "example.com/v".into(),
                        ..AffectedPackage::default()
                    }],
                },
            }],
            ..Entry::default()
        };
        let index = AdvisoryIndex::new(
            vec![(Module::new("example.com/v", "v1.1.0"), vec![entry])],
            &Target::default(),
            datetime!(2024-06-01 12:00 UTC),
        );
        let mut graph = fixture_graph(true);
        // Erase the package's symbol table.
        let mut replacement = graph.get_package("example.com/v").unwrap().clone();
        replacement.symbols.clear();
        let mut fresh = DepGraph::new();
        fresh.add_modules(graph.modules().cloned().collect::<Vec<_>>());
        fresh.add_package(graph.get_package("example.com/app").unwrap().clone());
        fresh.add_package(replacement);
        fresh.set_top(vec!["example.com/app".into()]);
        graph = fresh;

        assert!(imported_candidates(&graph, &index).is_empty());
    }

    #[test]
    fn origin_invariant_rejects_mixed_loads() {
        let mut graph = fixture_graph(true);
        let mut odd = Package {
            path: "example.com/odd".into(),
            module: "example.com/odd".into(),
            origin: "load-2".into(),
            ..Package::default()
        };
        odd.symbols.push(FuncSymbol::func("X"));
        graph.add_package(odd);
        assert!(matches!(
            check_single_origin(&graph),
            Err(ScanError::Invariant(_))
        ));
    }

    #[test]
    fn slice_intersects_backward_and_forward() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("example.com/app", "main"));
        let mid = cg.add_func(FuncNode::new("example.com/app", "run"));
        let sink = cg.add_func(FuncNode::new("example.com/v", "V"));
        // A caller of the sink that no entry point reaches.
        let stray = cg.add_func(FuncNode::new("example.com/x", "stray"));

        cg.add_call(main, mid, CallSite::new("run"));
        cg.add_call(mid, sink, CallSite::new("V"));
        cg.add_call(stray, sink, CallSite::new("V"));
        cg.mark_entry(main);

        let sinks: BTreeSet<NodeId> = [sink].into();
        let outcome = slice(&cg, &sinks);
        assert!(outcome.nodes.contains(&main));
        assert!(outcome.nodes.contains(&mid));
        assert!(outcome.nodes.contains(&sink));
        assert!(!outcome.nodes.contains(&stray));
        assert_eq!(outcome.reached_sinks, sinks);
    }

    #[test]
    fn slice_handles_cycles() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let a = cg.add_func(FuncNode::new("app", "a"));
        let b = cg.add_func(FuncNode::new("app", "b"));
        let sink = cg.add_func(FuncNode::new("v", "V"));

        cg.add_call(main, a, CallSite::new("a"));
        cg.add_call(a, b, CallSite::new("b"));
        cg.add_call(b, a, CallSite::new("a"));
        cg.add_call(b, sink, CallSite::new("V"));
        cg.mark_entry(main);

        let outcome = slice(&cg, &[sink].into());
        assert_eq!(outcome.reached_sinks.len(), 1);
        assert_eq!(outcome.nodes.len(), 4);
    }

    #[test]
    fn unreached_sink_is_dropped() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let sink = cg.add_func(FuncNode::new("v", "V"));
        let orphan_caller = cg.add_func(FuncNode::new("x", "f"));
        cg.add_call(orphan_caller, sink, CallSite::new("V"));
        cg.mark_entry(main);

        let outcome = slice(&cg, &[sink].into());
        assert!(outcome.reached_sinks.is_empty());
        assert!(outcome.nodes.is_empty());
    }

    #[test]
    fn project_preserves_surviving_edges_only() {
        let mut cg = CallGraph::new();
        let main = cg.add_func(FuncNode::new("app", "main"));
        let sink = cg.add_func(FuncNode::new("v", "V"));
        let stray = cg.add_func(FuncNode::new("x", "stray"));
        cg.add_call(main, sink, CallSite::new("V"));
        cg.add_call(stray, sink, CallSite::new("V"));
        cg.mark_entry(main);

        let keep: BTreeSet<NodeId> = [main, sink].into();
        let (projected, remap) = project(&cg, &keep);
        assert_eq!(projected.len(), 2);
        let new_sink = remap[&sink];
        assert_eq!(projected.node(new_sink).call_sites.len(), 1);
        assert!(projected.is_entry(remap[&main]));
    }
}
