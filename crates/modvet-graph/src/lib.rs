//! Module and package adjacency for the program under analysis.
//!
//! The graph is built once per scan, either by the source loader or
//! from a binary's recorded module list, and is read-only afterwards.
//! Packages belong to exactly one module; the pseudo-module `stdlib`
//! owns every runtime-library package.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Path of the pseudo-module owning standard-library packages.
pub const STDLIB_MODULE_PATH: &str = "stdlib";

/// Path of the pseudo-module owning toolchain command packages.
pub const CMD_MODULE_PATH: &str = "cmd";

/// A module of the program snapshot, with its optional replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Module {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<Box<Module>>,
}

impl Module {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
            replace: None,
        }
    }

    pub fn replaced_by(mut self, replacement: Module) -> Self {
        self.replace = Some(Box::new(replacement));
        self
    }

    /// The module that actually supplies the code: the replacement if
    /// one is recorded, otherwise the module itself.
    pub fn resolved(&self) -> &Module {
        self.replace.as_deref().unwrap_or(self)
    }
}

/// A source position, `file:line:column`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub struct Position {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub column: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Position {
    pub fn new(filename: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            filename: filename.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.line, self.column)
    }
}

/// A function or method recorded in a package's typed symbol table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FuncSymbol {
    pub name: String,
    /// Receiver type for methods, without any pointer marker.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver: String,
    #[serde(default)]
    pub exported: bool,
}

impl FuncSymbol {
    pub fn func(name: impl Into<String>) -> Self {
        let name = name.into();
        let exported = starts_uppercase(&name);
        Self {
            name,
            receiver: String::new(),
            exported,
        }
    }

    pub fn method(receiver: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let exported = starts_uppercase(&name);
        Self {
            name,
            receiver: receiver.into(),
            exported,
        }
    }

    /// The advisory-style symbol name: `Func` or `Receiver.Method`.
    pub fn symbol(&self) -> String {
        if self.receiver.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.receiver.trim_start_matches('*'), self.name)
        }
    }
}

fn starts_uppercase(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_uppercase())
}

/// A package of the program, with its imports and (for source
/// analysis) a typed symbol table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub path: String,
    /// Path of the owning module.
    pub module: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<FuncSymbol>,
    /// Token identifying the lexical coordinate space the package was
    /// loaded in. All packages of one scan must agree.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    /// Position of each import declaration, keyed by imported path.
    /// Used to attribute `init` frames to the triggering import.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub import_positions: BTreeMap<String, Position>,
}

/// Whether `path` names a standard-library package: no dot in the
/// first path segment.
pub fn is_std_package(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    let first = path.split('/').next().unwrap_or(path);
    !first.contains('.')
}

/// Whether `path` names a toolchain command package.
pub fn is_cmd_package(path: &str) -> bool {
    path == "cmd" || path.starts_with("cmd/")
}

/// Adjacency over the modules and packages of the program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepGraph {
    modules: BTreeMap<String, Module>,
    packages: BTreeMap<String, Package>,
    top: Vec<String>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern modules. Already-known paths are left untouched.
    pub fn add_modules(&mut self, modules: impl IntoIterator<Item = Module>) {
        for module in modules {
            self.modules.entry(module.path.clone()).or_insert(module);
        }
    }

    pub fn get_module(&self, path: &str) -> Option<&Module> {
        self.modules.get(path)
    }

    /// Replace an interned module, e.g. to pin the `stdlib`
    /// pseudo-module to the recorded toolchain version.
    pub fn set_module(&mut self, module: Module) {
        self.modules.insert(module.path.clone(), module);
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    /// Intern a package, interning a stub for its module as needed.
    pub fn add_package(&mut self, mut package: Package) {
        if package.module.is_empty() {
            package.module = self.owning_module_path(&package.path);
        }
        self.add_modules([Module::new(package.module.clone(), "")]);
        self.packages
            .entry(package.path.clone())
            .or_insert(package);
    }

    pub fn get_package(&self, path: &str) -> Option<&Package> {
        self.packages.get(path)
    }

    /// The interned package, creating a stub for standard-library
    /// paths (owned by `stdlib`) and unknown paths (owned by the
    /// longest-path module match).
    pub fn get_or_create_package(&mut self, path: &str) -> &Package {
        if !self.packages.contains_key(path) {
            let package = Package {
                path: path.to_string(),
                module: self.owning_module_path(path),
                ..Package::default()
            };
            self.add_package(package);
        }
        &self.packages[path]
    }

    /// The module owning `path`: `stdlib` for standard-library
    /// packages, otherwise the longest interned module whose path is a
    /// prefix of the package path at a `/` boundary. Falls back to a
    /// module named after the package itself.
    pub fn owning_module_path(&self, path: &str) -> String {
        if is_cmd_package(path) {
            return CMD_MODULE_PATH.to_string();
        }
        if is_std_package(path) {
            return STDLIB_MODULE_PATH.to_string();
        }
        self.modules
            .keys()
            .filter(|m| path_has_prefix(path, m))
            .max_by_key(|m| m.len())
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }

    /// The module owning an import path, resolved through the graph.
    pub fn module_for_package(&self, path: &str) -> Option<&Module> {
        let package = self.packages.get(path)?;
        self.modules.get(&package.module)
    }

    pub fn set_top(&mut self, paths: Vec<String>) {
        self.top = paths;
    }

    /// Entry packages requested by the user.
    pub fn top_packages(&self) -> &[String] {
        &self.top
    }

    /// Transitive dependency count, for progress messages. Cycles and
    /// self-imports are visited at most once per package.
    pub fn dep_count(&self) -> usize {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.top.iter().map(String::as_str).collect();
        for path in &self.top {
            visited.insert(path);
        }
        while let Some(path) = queue.pop_front() {
            if let Some(package) = self.packages.get(path) {
                for import in &package.imports {
                    if visited.insert(import) {
                        queue.push_back(import);
                    }
                }
            }
        }
        visited.len().saturating_sub(self.top.len())
    }

    /// All packages in deterministic (path) order.
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }
}

/// `path == prefix` or `path` starts with `prefix` followed by `/`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}
