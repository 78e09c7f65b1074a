//! Per-module advisory index.
//!
//! Ingests `(module, advisories)` pairs and keeps filtered copies of
//! each advisory: only affected blocks that name the installed module,
//! whose declared ranges contain the installed version, and with at
//! least one affected package matching the target platform. Withdrawn
//! advisories are dropped entirely.

use modvet_graph::{is_cmd_package, is_std_package, path_has_prefix, Module, CMD_MODULE_PATH, STDLIB_MODULE_PATH};
use modvet_osv::entry::{Affected, AffectedPackage, Entry};
use modvet_osv::version;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::debug;

/// The platform the program runs on. Empty strings mean "unknown" and
/// match every constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub goos: String,
    pub goarch: String,
}

impl Target {
    pub fn new(goos: impl Into<String>, goarch: impl Into<String>) -> Self {
        Self {
            goos: goos.into(),
            goarch: goarch.into(),
        }
    }
}

#[derive(Debug)]
struct ModuleBag {
    module: Module,
    entries: Vec<Entry>,
}

/// Filtered advisories keyed by installed module path.
#[derive(Debug, Default)]
pub struct AdvisoryIndex {
    bags: BTreeMap<String, ModuleBag>,
}

impl AdvisoryIndex {
    pub fn new(
        pairs: Vec<(Module, Vec<Entry>)>,
        target: &Target,
        now: OffsetDateTime,
    ) -> Self {
        let mut bags = BTreeMap::new();
        for (module, entries) in pairs {
            let effective = module.resolved();
            let installed = version::canonical(&effective.version);

            let mut kept: Vec<Entry> = Vec::new();
            for entry in entries {
                if entry.is_withdrawn(now) {
                    debug!(id = %entry.id, "dropping withdrawn advisory");
                    continue;
                }
                let affected = filter_affected(&entry, &effective.path, &installed, target);
                if affected.is_empty() {
                    continue;
                }
                let mut copy = entry;
                copy.affected = affected;
                kept.push(copy);
            }
            kept.sort_by(|a, b| a.id.cmp(&b.id));
            kept.dedup_by(|a, b| a.id == b.id);

            debug!(module = %module.path, advisories = kept.len(), "indexed module");
            bags.insert(
                module.path.clone(),
                ModuleBag {
                    module,
                    entries: kept,
                },
            );
        }
        Self { bags }
    }

    /// All indexed modules, with or without advisories.
    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.bags.values().map(|bag| &bag.module)
    }

    /// `(module, advisories)` pairs for modules that have any.
    pub fn iter(&self) -> impl Iterator<Item = (&Module, &[Entry])> {
        self.bags
            .values()
            .filter(|bag| !bag.entries.is_empty())
            .map(|bag| (&bag.module, bag.entries.as_slice()))
    }

    pub fn module(&self, path: &str) -> Option<&Module> {
        self.bags.get(path).map(|bag| &bag.module)
    }

    /// The advisory bag of a module.
    pub fn for_module(&self, module_path: &str) -> &[Entry] {
        self.bags
            .get(module_path)
            .map(|bag| bag.entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn entry_for(&self, module_path: &str, id: &str) -> Option<&Entry> {
        self.for_module(module_path).iter().find(|e| e.id == id)
    }

    /// Advisories whose affected packages include `import_path`,
    /// paired with the matching affected-package record. The bag is
    /// selected by the longest module-path prefix; standard-library
    /// packages route to the `stdlib` bag; replaced modules rewrite
    /// the import path onto the replacement before comparing.
    pub fn package_advisories(&self, import_path: &str) -> Vec<(&Entry, &AffectedPackage)> {
        let Some((bag, effective_import)) = self.bag_for_package(import_path) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in &bag.entries {
            'entry: for affected in &entry.affected {
                for package in &affected.ecosystem_specific.packages {
                    if package.path == effective_import {
                        out.push((entry, package));
                        break 'entry;
                    }
                }
            }
        }
        out
    }

    /// `forPackage`: advisories affecting the package at the installed
    /// module version.
    pub fn for_package(&self, import_path: &str) -> Vec<&Entry> {
        self.package_advisories(import_path)
            .into_iter()
            .map(|(entry, _)| entry)
            .collect()
    }

    /// `forSymbol`: restricts `for_package` to advisories that list
    /// `symbol` or leave their symbol list empty (every symbol
    /// vulnerable).
    pub fn for_symbol(&self, import_path: &str, symbol: &str) -> Vec<&Entry> {
        self.package_advisories(import_path)
            .into_iter()
            .filter(|(_, package)| {
                package.symbols.is_empty() || package.symbols.iter().any(|s| s == symbol)
            })
            .map(|(entry, _)| entry)
            .collect()
    }

    /// The latest fixed version of `entry` for the module, rendered as
    /// a toolchain tag for the `stdlib` and `cmd` pseudo-modules.
    pub fn fixed_version(&self, module_path: &str, entry: &Entry) -> String {
        let effective_path = self
            .bags
            .get(module_path)
            .map(|bag| bag.module.resolved().path.as_str())
            .unwrap_or(module_path);
        let fixed = version::latest_fixed(effective_path, &entry.affected);
        if fixed.is_empty() {
            return fixed;
        }
        if module_path == STDLIB_MODULE_PATH || module_path == CMD_MODULE_PATH {
            version::semver_to_go_tag(&fixed)
        } else {
            fixed
        }
    }

    fn bag_for_package(&self, import_path: &str) -> Option<(&ModuleBag, String)> {
        let module_path = if is_cmd_package(import_path) {
            CMD_MODULE_PATH.to_string()
        } else if is_std_package(import_path) {
            STDLIB_MODULE_PATH.to_string()
        } else {
            self.bags
                .keys()
                .filter(|path| path_has_prefix(import_path, path))
                .max_by_key(|path| path.len())?
                .clone()
        };
        let bag = self.bags.get(&module_path)?;

        let effective_import = match &bag.module.replace {
            Some(replacement) => format!(
                "{}{}",
                replacement.path,
                import_path
                    .strip_prefix(bag.module.path.as_str())
                    .unwrap_or_default()
            ),
            None => import_path.to_string(),
        };
        Some((bag, effective_import))
    }
}

fn filter_affected(
    entry: &Entry,
    module_path: &str,
    installed: &str,
    target: &Target,
) -> Vec<Affected> {
    let mut out = Vec::new();
    for affected in &entry.affected {
        // Same-CVE entries for unrelated modules must not leak in.
        if affected.module.path != module_path {
            continue;
        }
        if !version::affects(&affected.ranges, installed) {
            continue;
        }
        let packages: Vec<AffectedPackage> = affected
            .ecosystem_specific
            .packages
            .iter()
            .filter(|p| matches_platform(p, target))
            .cloned()
            .collect();
        if !affected.ecosystem_specific.packages.is_empty() && packages.is_empty() {
            continue;
        }
        let mut copy = affected.clone();
        copy.ecosystem_specific.packages = packages;
        out.push(copy);
    }
    out
}

fn matches_platform(package: &AffectedPackage, target: &Target) -> bool {
    constraint_matches(&package.goos, &target.goos)
        && constraint_matches(&package.goarch, &target.goarch)
}

fn constraint_matches(constraint: &[String], value: &str) -> bool {
    constraint.is_empty() || value.is_empty() || constraint.iter().any(|c| c == value)
}
