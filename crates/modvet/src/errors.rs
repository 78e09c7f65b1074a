//! Actionable errors for environment and usage problems.
//!
//! A missing module manifest or a toolchain mismatch are not bugs;
//! the message tells the user what to do next instead of surfacing a
//! cryptic loader failure.

use std::fmt;
use std::path::PathBuf;

/// The environment cannot support the requested scan.
#[derive(Debug)]
pub enum EnvError {
    /// Source mode requires a module manifest in the working
    /// directory.
    NoModuleManifest { dir: PathBuf },
    /// The toolchain that loaded the packages is not the one on PATH.
    ToolchainMismatch { loaded: String, on_path: String },
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvError::NoModuleManifest { dir } => {
                write!(f, "no go.mod found in {}", dir.display())
            }
            EnvError::ToolchainMismatch { loaded, on_path } => write!(
                f,
                "packages were loaded with {loaded} but {on_path} is on PATH"
            ),
        }
    }
}

impl std::error::Error for EnvError {}

impl EnvError {
    /// Remediation text shown under the error message.
    pub fn remediation(&self) -> String {
        match self {
            EnvError::NoModuleManifest { .. } => "\
source scans run inside a module. Either:
  cd /path/to/your/module     # a directory containing go.mod
  modvet -C /path/to/module   # or point modvet at it
  go mod init example.com/m   # or create the manifest first"
                .to_string(),
            EnvError::ToolchainMismatch { loaded, .. } => format!(
                "\
the analysis is only sound when both toolchains agree. Either:
  put {loaded} first on PATH, or
  rebuild your packages with the toolchain on PATH and re-run modvet"
            ),
        }
    }
}

/// Bad flags or arguments, reported with the usage banner.
#[derive(Debug)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UsageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_names_the_fix() {
        let err = EnvError::NoModuleManifest {
            dir: PathBuf::from("/tmp/project"),
        };
        assert!(err.to_string().contains("go.mod"));
        assert!(err.remediation().contains("go mod init"));

        let err = EnvError::ToolchainMismatch {
            loaded: "go1.21.3".into(),
            on_path: "go1.20.1".into(),
        };
        assert!(err.to_string().contains("go1.21.3"));
        assert!(err.remediation().contains("go1.21.3"));
    }
}
