//! Queries against the `go` tool on PATH.

use anyhow::{bail, Context, Result};
use modvet_graph::Module;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// The toolchain tag of the `go` on PATH, e.g. `go1.21.3`. `None`
/// when no toolchain is installed or the output is unrecognizable.
pub fn go_version_on_path() -> Option<String> {
    let output = Command::new("go").arg("version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    // "go version go1.21.3 linux/amd64"
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .find(|token| token.starts_with("go1"))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
struct GoListModule {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Version", default)]
    version: Option<String>,
    #[serde(rename = "Replace", default)]
    replace: Option<Box<GoListModule>>,
}

impl GoListModule {
    fn into_module(self) -> Module {
        let mut module = Module::new(self.path, self.version.unwrap_or_default());
        if let Some(replace) = self.replace {
            module.replace = Some(Box::new(replace.into_module()));
        }
        module
    }
}

/// The module closure of the main module, via `go list -m -json all`.
pub fn list_modules(dir: &Path) -> Result<Vec<Module>> {
    let output = Command::new("go")
        .args(["list", "-m", "-json", "all"])
        .current_dir(dir)
        .output()
        .context("failed to run `go list -m -json all`")?;
    if !output.status.success() {
        bail!(
            "`go list -m` failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    // The output is a concatenated stream of JSON objects.
    let text = String::from_utf8_lossy(&output.stdout);
    let mut modules = Vec::new();
    let stream = serde_json::Deserializer::from_str(&text).into_iter::<GoListModule>();
    for record in stream {
        let record = record.context("malformed `go list -m` output")?;
        modules.push(record.into_module());
    }
    debug!(count = modules.len(), "listed modules");
    Ok(modules)
}
