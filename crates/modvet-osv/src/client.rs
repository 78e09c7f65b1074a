//! Advisory database clients.
//!
//! The database is queried per module and returns zero or more
//! advisories. The transport is pluggable: HTTP for the hosted
//! database, a local directory for offline runs and fixtures, and an
//! in-memory map for tests.

use crate::entry::Entry;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use ureq::Agent;

/// The hosted vulnerability database queried when no `--db` override
/// is given.
pub const DEFAULT_DB: &str = "https://vuln.go.dev";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A per-module advisory source.
pub trait Client: Send + Sync {
    /// All advisories recorded for `module_path`. An unknown module
    /// yields an empty list, not an error.
    fn by_module(&self, module_path: &str) -> Result<Vec<Entry>>;
}

/// Escape a module path for use in a database URL or filename.
/// Uppercase letters become `!` followed by the lowercase letter, the
/// same convention the module proxy protocol uses.
pub fn escape_module_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// HTTP client for a hosted database serving
/// `{base}/{escaped-module}.json` documents.
pub struct HttpClient {
    base: String,
    agent: Agent,
}

impl HttpClient {
    pub fn new(base: impl Into<String>) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            agent: config.into(),
        }
    }
}

impl Client for HttpClient {
    fn by_module(&self, module_path: &str) -> Result<Vec<Entry>> {
        let url = format!("{}/{}.json", self.base, escape_module_path(module_path));
        let mut response = match self.agent.get(&url).call() {
            Ok(response) => response,
            // Absence from the database means "no known advisories".
            Err(ureq::Error::StatusCode(404)) => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("advisory request failed: {url}"))
            }
        };
        response
            .body_mut()
            .read_json::<Vec<Entry>>()
            .with_context(|| format!("malformed advisory data from {url}"))
    }
}

/// Directory-backed client reading `{root}/{escaped-module}.json`.
pub struct DirClient {
    root: PathBuf,
}

impl DirClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Client for DirClient {
    fn by_module(&self, module_path: &str) -> Result<Vec<Entry>> {
        let path = self
            .root
            .join(format!("{}.json", escape_module_path(module_path)));
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read advisory file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("malformed advisory file {}", path.display()))
    }
}

/// In-memory client for tests.
#[derive(Debug, Default)]
pub struct MemClient {
    entries: HashMap<String, Vec<Entry>>,
}

impl MemClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module_path: impl Into<String>, entries: Vec<Entry>) -> &mut Self {
        self.entries.insert(module_path.into(), entries);
        self
    }
}

impl Client for MemClient {
    fn by_module(&self, module_path: &str) -> Result<Vec<Entry>> {
        Ok(self.entries.get(module_path).cloned().unwrap_or_default())
    }
}
