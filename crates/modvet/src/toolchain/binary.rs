//! Binary inspection through the toolchain.
//!
//! `go version -m` reports the module list, toolchain version, and
//! build settings embedded in any Go executable. `go tool nm` lists
//! its text symbols; a stripped binary yields none, which downgrades
//! the scan to module precision.

use anyhow::{bail, Context, Result};
use modvet_graph::Module;
use modvet_scan::BinaryArtifact;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Command;
use tracing::debug;

pub fn extract(path: &Path) -> Result<BinaryArtifact> {
    let output = Command::new("go")
        .args(["version", "-m"])
        .arg(path)
        .output()
        .context("failed to run `go version -m`")?;
    if !output.status.success() {
        bail!(
            "{} is not a Go binary: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let mut artifact = parse_version_output(&String::from_utf8_lossy(&output.stdout));

    let nm = Command::new("go")
        .args(["tool", "nm"])
        .arg(path)
        .output()
        .context("failed to run `go tool nm`")?;
    if nm.status.success() {
        artifact.pkg_symbols = parse_nm_output(&String::from_utf8_lossy(&nm.stdout));
    }
    debug!(
        modules = artifact.modules.len(),
        stripped = artifact.is_stripped(),
        "extracted binary metadata"
    );
    Ok(artifact)
}

/// `go version -m` format: a header line `file: go1.21.3`, then
/// tab-led records (`path`, `mod`, `dep`, `=>`, `build`).
fn parse_version_output(text: &str) -> BinaryArtifact {
    let mut artifact = BinaryArtifact::default();
    for line in text.lines() {
        if !line.starts_with('\t') {
            if let Some((_, version)) = line.rsplit_once(": ") {
                artifact.go_version = version.trim().to_string();
            }
            continue;
        }
        let fields: Vec<&str> = line.trim_start_matches('\t').split('\t').collect();
        match fields.as_slice() {
            ["mod" | "dep", module_path, rest @ ..] => {
                let version = rest.first().copied().unwrap_or_default();
                artifact.modules.push(Module::new(
                    *module_path,
                    if version == "(devel)" { "" } else { version },
                ));
            }
            ["=>", module_path, rest @ ..] => {
                // Replacement for the immediately preceding module.
                if let Some(last) = artifact.modules.last_mut() {
                    let version = rest.first().copied().unwrap_or_default();
                    last.replace = Some(Box::new(Module::new(*module_path, version)));
                }
            }
            ["build", setting, ..] => {
                if let Some(goos) = setting.strip_prefix("GOOS=") {
                    artifact.goos = goos.to_string();
                }
                if let Some(goarch) = setting.strip_prefix("GOARCH=") {
                    artifact.goarch = goarch.to_string();
                }
            }
            _ => {}
        }
    }
    artifact
}

/// `go tool nm` format: `address type name` per line. Only text
/// symbols (`T`/`t`) matter, and runtime-internal names are skipped.
/// Returns `None` when no package symbols are present (stripped).
fn parse_nm_output(text: &str) -> Option<BTreeMap<String, BTreeSet<String>>> {
    let mut symbols: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(first), Some(second)) = (fields.next(), fields.next()) else {
            continue;
        };
        // The address column is absent for some symbols.
        let (kind, name) = match fields.next() {
            Some(third) => (second, third),
            None => (first, second),
        };
        if kind != "T" && kind != "t" {
            continue;
        }
        if name.starts_with("go:") || name.starts_with("type:") {
            continue;
        }
        let Some((pkg, symbol)) = split_package_symbol(name) else {
            continue;
        };
        symbols.entry(pkg).or_default().insert(symbol);
    }
    if symbols.is_empty() {
        None
    } else {
        Some(symbols)
    }
}

/// Split `example.com/mod/pkg.(*Conn).Close` into the package path
/// and the `Conn.Close` symbol.
fn split_package_symbol(name: &str) -> Option<(String, String)> {
    let pkg_end = match name.rfind('/') {
        Some(slash) => slash + name[slash..].find('.')?,
        None => name.find('.')?,
    };
    let pkg = &name[..pkg_end];
    let symbol = &name[pkg_end + 1..];
    if pkg.is_empty() || symbol.is_empty() {
        return None;
    }
    let symbol = symbol
        .replace("(*", "")
        .replace(['(', ')'], "");
    Some((pkg.to_string(), symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION_OUTPUT: &str = "\
bin/server: go1.21.3
\tpath\texample.com/app
\tmod\texample.com/app\t(devel)\t
\tdep\texample.com/v\tv1.1.0\th1:abcdef=
\tdep\texample.com/old\tv0.9.0\th1:remove=
\t=>\texample.com/new\tv1.0.0\th1:replace=
\tbuild\tGOOS=linux
\tbuild\tGOARCH=amd64
";

    #[test]
    fn parses_version_records() {
        let artifact = parse_version_output(VERSION_OUTPUT);
        assert_eq!(artifact.go_version, "go1.21.3");
        assert_eq!(artifact.goos, "linux");
        assert_eq!(artifact.goarch, "amd64");
        assert_eq!(artifact.modules.len(), 3);
        assert_eq!(artifact.modules[0].path, "example.com/app");
        assert_eq!(artifact.modules[0].version, "");
        assert_eq!(artifact.modules[1].version, "v1.1.0");

        let replaced = &artifact.modules[2];
        assert_eq!(replaced.path, "example.com/old");
        assert_eq!(replaced.resolved().path, "example.com/new");
        assert_eq!(replaced.resolved().version, "v1.0.0");
    }

    #[test]
    fn parses_nm_symbols() {
        let nm = "\
  401000 T example.com/v.V
  401200 T example.com/v.(*Conn).Close
  401400 t example.com/v.helper
  402000 T main.main
  403000 T type:.eq.example.com/v.Conn
  404000 R example.com/v.constant
";
        let symbols = parse_nm_output(nm).unwrap();
        let v = &symbols["example.com/v"];
        assert!(v.contains("V"));
        assert!(v.contains("Conn.Close"));
        assert!(v.contains("helper"));
        assert!(!v.contains("constant"));
        assert!(symbols.contains_key("main"));
        assert!(!symbols.keys().any(|k| k.starts_with("type:")));
    }

    #[test]
    fn empty_symbol_table_reads_as_stripped() {
        assert!(parse_nm_output("").is_none());
        assert!(parse_nm_output("  401000 R only.data\n").is_none());
    }

    #[test]
    fn package_symbol_split_handles_methods() {
        assert_eq!(
            split_package_symbol("example.com/mod/pkg.(*Conn).Close"),
            Some(("example.com/mod/pkg".into(), "Conn.Close".into()))
        );
        assert_eq!(
            split_package_symbol("fmt.Println"),
            Some(("fmt".into(), "Println".into()))
        );
        assert_eq!(split_package_symbol("noseparator"), None);
    }
}
