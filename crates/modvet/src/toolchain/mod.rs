//! Bridges to the Go toolchain on PATH.
//!
//! Package loading and SSA call-graph construction belong to the
//! toolchain, not to modvet: the companion analyzer performs the
//! typed load with the toolchain's own libraries and emits a JSON
//! report, which this module adapts onto the scan traits. Binary
//! inspection shells out to `go version -m` and `go tool nm`.

pub mod analyzer;
pub mod binary;
pub mod version;

use anyhow::{Context, Result};
use modvet_graph::Module;
use modvet_scan::{
    BinaryArtifact, CallGraph, CallGraphBuilder, CancelToken, LoadConfig, LoadedProgram,
    SourceLoader, SymbolSource,
};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The default collaborator set: loads through the companion
/// analyzer, reusing one report for both the package graph and the
/// call graph of a scan.
#[derive(Default)]
pub struct GoToolchain {
    report: Mutex<Option<Arc<analyzer::Report>>>,
}

impl GoToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&self, config: &LoadConfig) -> Result<Arc<analyzer::Report>> {
        if let Some(report) = self.report.lock().expect("report lock").clone() {
            return Ok(report);
        }
        let report = Arc::new(analyzer::run(config)?);
        *self.report.lock().expect("report lock") = Some(report.clone());
        Ok(report)
    }
}

impl SourceLoader for GoToolchain {
    fn load(&self, config: &LoadConfig) -> Result<LoadedProgram> {
        Ok(self.report(config)?.to_program())
    }

    fn load_modules(&self, config: &LoadConfig) -> Result<Vec<Module>> {
        version::list_modules(&config.dir)
    }
}

impl CallGraphBuilder for GoToolchain {
    fn build(&self, _program: &LoadedProgram, cancel: &CancelToken) -> Result<CallGraph> {
        let report = self
            .report
            .lock()
            .expect("report lock")
            .clone()
            .context("packages must be loaded before building the call graph")?;
        report.to_call_graph(cancel)
    }
}

impl SymbolSource for GoToolchain {
    fn extract(&self, path: &Path) -> Result<BinaryArtifact> {
        binary::extract(path)
    }
}
