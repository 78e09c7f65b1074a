//! The scan orchestrator: binds a mode to its pipeline.
//!
//! Source scans run advisory fetching concurrently with call-graph
//! construction under a shared cancellation token; both join before
//! the slicing phase. All events reach the handler on the calling
//! thread through the emitter.

use crate::cli::ShowFlags;
use crate::errors::{EnvError, UsageError};
use crate::toolchain;
use anyhow::{Context, Result};
use modvet_graph::{DepGraph, Module, STDLIB_MODULE_PATH};
use modvet_osv::entry::Entry;
use modvet_osv::{version, Client};
use modvet_scan::{
    analyze_source, binary_findings, imported_candidates, module_level_findings,
    package_level_findings, AdvisoryIndex, CallGraphBuilder, CancelToken, Config, Emitter,
    Handler, LoadConfig, LoadedProgram, ScanError, ScanLevel, ScanMode, SourceLoader,
    SymbolSource, Target, PROTOCOL_VERSION,
};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

/// Everything a scan needs to know, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub mode: ScanMode,
    pub level: ScanLevel,
    pub db: String,
    pub dir: PathBuf,
    pub tags: Vec<String>,
    pub include_tests: bool,
    pub show: ShowFlags,
    pub patterns: Vec<String>,
}

/// Binds a scan mode to the appropriate pipeline. The collaborators
/// (advisory client, loader, call-graph builder, symbol extractor)
/// are injected so tests can run entirely in memory.
pub struct Orchestrator {
    pub config: ScanConfig,
    pub client: Box<dyn Client>,
    pub loader: Arc<dyn SourceLoader>,
    pub builder: Arc<dyn CallGraphBuilder>,
    pub symbols: Arc<dyn SymbolSource>,
}

impl Orchestrator {
    pub fn run(&self, handler: &mut dyn Handler) -> Result<()> {
        match self.config.mode {
            ScanMode::Source => self.run_source(handler),
            ScanMode::Binary => self.run_binary(handler),
            ScanMode::Query => self.run_query(handler),
            ScanMode::Convert => self.run_convert(handler),
            ScanMode::Extract => self.run_extract(),
        }
    }

    fn config_event(&self, go_version: &str) -> Config {
        Config {
            protocol_version: PROTOCOL_VERSION.to_string(),
            scanner_name: "modvet".to_string(),
            scanner_version: format!("v{}", env!("CARGO_PKG_VERSION")),
            db: self.config.db.clone(),
            go_version: go_version.to_string(),
            scan_level: self.config.level,
            scan_mode: self.config.mode,
        }
    }

    fn load_config(&self) -> LoadConfig {
        LoadConfig {
            dir: self.config.dir.clone(),
            patterns: if self.config.patterns.is_empty() {
                vec!["./...".to_string()]
            } else {
                self.config.patterns.clone()
            },
            tags: self.config.tags.clone(),
            include_tests: self.config.include_tests,
        }
    }

    fn run_source(&self, handler: &mut dyn Handler) -> Result<()> {
        let dir = &self.config.dir;
        if !dir.join("go.mod").exists() {
            return Err(EnvError::NoModuleManifest { dir: dir.clone() }.into());
        }
        let load_config = self.load_config();

        // Module-level scans need the module list only.
        if self.config.level == ScanLevel::Module {
            let modules = self
                .loader
                .load_modules(&load_config)
                .context("loading the module graph failed")?;
            let mut emitter = Emitter::new(handler);
            emitter.config(&self.config_event(""))?;
            emitter.progress(format!(
                "Scanning {} modules for known vulnerabilities...",
                modules.len()
            ))?;
            let cancel = CancelToken::new();
            let pairs = fetch_advisories(&*self.client, modules, &cancel)?;
            let index = AdvisoryIndex::new(pairs, &Target::default(), OffsetDateTime::now_utc());
            emitter.findings(&index, module_level_findings(&index))?;
            return emitter.flush();
        }

        let mut program = self
            .loader
            .load(&load_config)
            .context("loading packages failed")?;
        check_toolchain(&program)?;
        pin_stdlib_version(&mut program);

        let mut emitter = Emitter::new(handler);
        emitter.config(&self.config_event(&program.toolchain_version))?;
        emitter.progress(format!(
            "Scanning your code and {} packages across {} dependent modules for known vulnerabilities...",
            program.graph.dep_count(),
            dependent_module_count(&program.graph),
        ))?;

        let modules: Vec<Module> = program.graph.modules().cloned().collect();
        let cancel = CancelToken::new();
        let target = Target::new(program.goos.clone(), program.goarch.clone());

        let outcome = if self.config.level == ScanLevel::Symbol {
            // Advisory fetch and call-graph construction run in
            // parallel; either failure cancels the other branch.
            let fetch_cancel = cancel.clone();
            let build_cancel = cancel.clone();
            let (fetched, built) = rayon::join(
                || {
                    let result = fetch_advisories(&*self.client, modules, &fetch_cancel);
                    if result.is_err() {
                        fetch_cancel.cancel();
                    }
                    result
                },
                || {
                    let result = self.builder.build(&program, &build_cancel);
                    if result.is_err() {
                        build_cancel.cancel();
                    }
                    result
                },
            );
            let pairs = fetched?;
            let mut callgraph = built.map_err(|source| ScanError::Load {
                phase: "call graph construction",
                source,
            })?;
            if self.config.show.verbose {
                emitter.progress(format!(
                    "Built a call graph with {} functions",
                    callgraph.len()
                ))?;
            }
            let index = AdvisoryIndex::new(pairs, &target, OffsetDateTime::now_utc());
            analyze_source(&program.graph, &index, &mut callgraph, &cancel)
                .map(|findings| (index, findings))?
        } else {
            let pairs = fetch_advisories(&*self.client, modules, &cancel)?;
            let index = AdvisoryIndex::new(pairs, &target, OffsetDateTime::now_utc());
            let candidates = imported_candidates(&program.graph, &index);
            let mut findings = module_level_findings(&index);
            findings.extend(package_level_findings(&program.graph, &index, &candidates));
            (index, findings)
        };

        let (index, findings) = outcome;
        emitter.findings(&index, findings)?;
        emitter.flush()
    }

    fn run_binary(&self, handler: &mut dyn Handler) -> Result<()> {
        let [file] = self.config.patterns.as_slice() else {
            return Err(UsageError("binary mode takes exactly one executable".into()).into());
        };
        let artifact = self
            .symbols
            .extract(Path::new(file))
            .map_err(|source| ScanError::Load {
                phase: "binary symbol extraction",
                source,
            })?;

        let mut graph = DepGraph::new();
        graph.add_modules(artifact.modules.iter().cloned());
        if let Some(stdlib) = version::go_tag_to_semver(&artifact.go_version) {
            graph.set_module(Module::new(STDLIB_MODULE_PATH, stdlib));
        }

        let mut emitter = Emitter::new(handler);
        emitter.config(&self.config_event(&artifact.go_version))?;
        emitter.progress(format!(
            "Scanning {} for modules with known vulnerabilities...",
            file
        ))?;

        let cancel = CancelToken::new();
        let modules: Vec<Module> = graph.modules().cloned().collect();
        let pairs = fetch_advisories(&*self.client, modules, &cancel)?;
        let index = AdvisoryIndex::new(
            pairs,
            &Target::new(artifact.goos.clone(), artifact.goarch.clone()),
            OffsetDateTime::now_utc(),
        );

        let findings = binary_findings(&graph, &index, &artifact, self.config.level);
        emitter.findings(&index, findings)?;
        emitter.flush()
    }

    fn run_query(&self, handler: &mut dyn Handler) -> Result<()> {
        if self.config.patterns.is_empty() {
            return Err(UsageError("query mode takes module@version patterns".into()).into());
        }
        let mut emitter = Emitter::new(handler);
        emitter.config(&self.config_event(""))?;

        for pattern in &self.config.patterns {
            let module = parse_query(pattern)?;
            let path = module.path.clone();
            let entries = self
                .client
                .by_module(&path)
                .map_err(|source| ScanError::Fetch {
                    module: path.clone(),
                    source,
                })?;
            debug!(module = %path, advisories = entries.len(), "queried module");
            let index = AdvisoryIndex::new(
                vec![(module, entries)],
                &Target::default(),
                OffsetDateTime::now_utc(),
            );
            emitter.osv_entries(index.for_module(&path))?;
        }
        emitter.flush()
    }

    fn run_convert(&self, handler: &mut dyn Handler) -> Result<()> {
        match self.config.patterns.as_slice() {
            [] => modvet_scan::replay(BufReader::new(io::stdin()), handler),
            [file] => {
                let reader = File::open(file)
                    .with_context(|| format!("failed to open stream {file}"))?;
                modvet_scan::replay(BufReader::new(reader), handler)
            }
            _ => Err(UsageError("convert mode takes at most one stream file".into()).into()),
        }
    }

    fn run_extract(&self) -> Result<()> {
        let [file] = self.config.patterns.as_slice() else {
            return Err(UsageError("extract mode takes exactly one executable".into()).into());
        };
        let artifact = self
            .symbols
            .extract(Path::new(file))
            .map_err(|source| ScanError::Load {
                phase: "binary symbol extraction",
                source,
            })?;
        serde_json::to_writer_pretty(io::stdout().lock(), &artifact)
            .context("failed to write the extracted artifact")?;
        println!();
        Ok(())
    }
}

/// `modulePath@version`, where version is semver (with or without the
/// `v` prefix) or a toolchain tag.
fn parse_query(pattern: &str) -> Result<Module> {
    let Some((path, raw_version)) = pattern.rsplit_once('@') else {
        return Err(UsageError(format!("invalid query {pattern}: missing @version")).into());
    };
    if path.is_empty() {
        return Err(UsageError(format!("invalid query {pattern}: missing module path")).into());
    }
    let resolved = match version::go_tag_to_semver(raw_version) {
        Some(semver) => semver,
        None if version::is_valid(raw_version) => version::canonical(raw_version),
        None => {
            return Err(UsageError(format!(
                "invalid query {pattern}: {raw_version} is not valid semver"
            ))
            .into())
        }
    };
    Ok(Module::new(path, resolved))
}

/// One request per module, aborted between requests on cancellation.
/// A fetch failure is not swallowed: it cancels the scan.
fn fetch_advisories(
    client: &dyn Client,
    modules: Vec<Module>,
    cancel: &CancelToken,
) -> std::result::Result<Vec<(Module, Vec<Entry>)>, ScanError> {
    let mut pairs = Vec::with_capacity(modules.len());
    for module in modules {
        cancel.check()?;
        let path = module.resolved().path.clone();
        match client.by_module(&path) {
            Ok(entries) => {
                debug!(module = %path, advisories = entries.len(), "fetched advisories");
                pairs.push((module, entries));
            }
            Err(source) => {
                return Err(ScanError::Fetch {
                    module: path,
                    source,
                })
            }
        }
    }
    Ok(pairs)
}

/// A cryptic load failure usually means the toolchain on PATH is not
/// the one that produced the load; surface that instead.
fn check_toolchain(program: &LoadedProgram) -> Result<()> {
    let Some(on_path) = toolchain::version::go_version_on_path() else {
        return Ok(());
    };
    if !program.toolchain_version.is_empty() && program.toolchain_version != on_path {
        return Err(EnvError::ToolchainMismatch {
            loaded: program.toolchain_version.clone(),
            on_path,
        }
        .into());
    }
    Ok(())
}

/// Give the `stdlib` pseudo-module the toolchain's semver so stdlib
/// advisories can be matched by version.
fn pin_stdlib_version(program: &mut LoadedProgram) {
    let Some(stdlib) = version::go_tag_to_semver(&program.toolchain_version) else {
        return;
    };
    let unpinned = program
        .graph
        .get_module(STDLIB_MODULE_PATH)
        .is_some_and(|m| m.version.is_empty());
    if unpinned {
        program
            .graph
            .set_module(Module::new(STDLIB_MODULE_PATH, stdlib));
    }
}

fn dependent_module_count(graph: &DepGraph) -> usize {
    graph.modules().filter(|m| !m.version.is_empty()).count()
}
