//! The companion analyzer bridge.
//!
//! `modvet-analyzer` is a small Go tool that performs the typed
//! package load and SSA call-graph construction with the toolchain's
//! own libraries, then prints one JSON report. This module finds the
//! tool, runs it, and adapts the report onto the scan types.

use anyhow::{bail, Context, Result};
use modvet_graph::{DepGraph, FuncSymbol, Module, Package, Position, STDLIB_MODULE_PATH};
use modvet_osv::version as semver;
use modvet_scan::{CallGraph, CallSite, CancelToken, FuncNode, LoadConfig, LoadedProgram};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, info};

/// Environment override for the analyzer location.
const ANALYZER_ENV: &str = "MODVET_ANALYZER";

const ANALYZER_NAME: &str = "modvet-analyzer";

/// How often the call-graph adapter polls the cancellation token.
const CANCEL_STRIDE: usize = 1024;

/// The analyzer's JSON report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub go_version: String,
    #[serde(default)]
    pub goos: String,
    #[serde(default)]
    pub goarch: String,
    /// Token of the lexical coordinate space of this load.
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub top: Vec<String>,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
    #[serde(default)]
    pub functions: Vec<FunctionRecord>,
    #[serde(default)]
    pub calls: Vec<CallRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleRecord {
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub replace: Option<Box<ModuleRecord>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageRecord {
    pub path: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<SymbolRecord>,
    #[serde(default)]
    pub import_positions: BTreeMap<String, Position>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub exported: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionRecord {
    pub package: String,
    pub name: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub wrapper: bool,
    #[serde(default)]
    pub position: Option<Position>,
}

/// An edge between two indices of the `functions` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallRecord {
    pub caller: usize,
    pub callee: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub recv_type: String,
    #[serde(default = "default_resolved")]
    pub resolved: bool,
    #[serde(default)]
    pub position: Option<Position>,
}

fn default_resolved() -> bool {
    true
}

/// Run the analyzer over the configured patterns.
pub fn run(config: &LoadConfig) -> Result<Report> {
    let tool = find_analyzer()?;
    info!(tool = %tool.display(), "running the companion analyzer");

    let mut command = Command::new(&tool);
    command.current_dir(&config.dir).arg("-json");
    if !config.tags.is_empty() {
        command.arg(format!("-tags={}", config.tags.join(",")));
    }
    if config.include_tests {
        command.arg("-test");
    }
    command.args(&config.patterns);

    let output = command
        .output()
        .with_context(|| format!("failed to run {}", tool.display()))?;
    if !output.status.success() {
        bail!(
            "{} failed: {}",
            tool.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout).context("malformed analyzer report")
}

/// Locate the analyzer: the environment override, then next to the
/// running executable, then PATH.
fn find_analyzer() -> Result<PathBuf> {
    if let Ok(path) = env::var(ANALYZER_ENV) {
        return Ok(PathBuf::from(path));
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(ANALYZER_NAME);
            if sibling.exists() {
                return Ok(sibling);
            }
        }
    }
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(ANALYZER_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    bail!(
        "{ANALYZER_NAME} not found; install it with\n  go install github.com/modvet/modvet/{ANALYZER_NAME}@latest\nor set {ANALYZER_ENV} to its location"
    )
}

impl Report {
    /// The typed package graph of this load.
    pub fn to_program(&self) -> LoadedProgram {
        let mut graph = DepGraph::new();
        graph.add_modules(self.modules.iter().map(convert_module));
        if let Some(stdlib) = semver::go_tag_to_semver(&self.go_version) {
            graph.add_modules([Module::new(STDLIB_MODULE_PATH, stdlib)]);
        }
        for record in &self.packages {
            graph.add_package(Package {
                path: record.path.clone(),
                module: record.module.clone(),
                imports: record.imports.clone(),
                symbols: record
                    .symbols
                    .iter()
                    .map(|s| FuncSymbol {
                        name: s.name.clone(),
                        receiver: s.receiver.clone(),
                        exported: s.exported,
                    })
                    .collect(),
                origin: self.origin.clone(),
                import_positions: record.import_positions.clone(),
            });
        }
        graph.set_top(self.top.clone());
        debug!(
            packages = self.packages.len(),
            modules = self.modules.len(),
            "adapted analyzer report"
        );
        LoadedProgram {
            graph,
            toolchain_version: self.go_version.clone(),
            goos: self.goos.clone(),
            goarch: self.goarch.clone(),
        }
    }

    /// The over-approximate call graph of this load.
    pub fn to_call_graph(&self, cancel: &CancelToken) -> Result<CallGraph> {
        let mut graph = CallGraph::new();
        let mut ids = Vec::with_capacity(self.functions.len());
        for (i, record) in self.functions.iter().enumerate() {
            if i % CANCEL_STRIDE == 0 {
                cancel.check()?;
            }
            let mut node = FuncNode::method(&record.package, &record.receiver, &record.name);
            node.wrapper = record.wrapper;
            node.pos = record.position.clone();
            ids.push(graph.add_func(node));
        }
        for (i, record) in self.calls.iter().enumerate() {
            if i % CANCEL_STRIDE == 0 {
                cancel.check()?;
            }
            let (Some(&caller), Some(&callee)) = (ids.get(record.caller), ids.get(record.callee))
            else {
                bail!(
                    "call record {} references function {} of {}",
                    i,
                    record.caller.max(record.callee),
                    ids.len()
                );
            };
            let mut site = CallSite::new(&record.name);
            site.recv_type = record.recv_type.clone();
            site.resolved = record.resolved;
            site.pos = record.position.clone();
            graph.add_call(caller, callee, site);
        }
        debug!(functions = graph.len(), "adapted call graph");
        Ok(graph)
    }
}

fn convert_module(record: &ModuleRecord) -> Module {
    let mut module = Module::new(&record.path, &record.version);
    if let Some(replace) = &record.replace {
        module.replace = Some(Box::new(convert_module(replace)));
    }
    module
}
