use clap::{Parser, ValueEnum};
use modvet_osv::DEFAULT_DB;
use modvet_scan::{ScanLevel, ScanMode};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "modvet",
    version,
    about = "Report known vulnerabilities that affect Go code",
    long_about = None,
    after_help = "EXAMPLES:
  # Scan the module in the current directory at symbol precision
  modvet ./...

  # Scan a compiled executable
  modvet --mode=binary ./bin/server

  # Ask which advisories apply to a module version
  modvet --mode=query golang.org/x/text@v0.3.7

  # Re-render a recorded JSON stream as text
  modvet --mode=convert findings.json

EXIT CODES:
  0  no vulnerabilities at the requested precision
  3  vulnerabilities found
  2  usage error"
)]
pub struct Cli {
    /// Analysis mode
    #[arg(long, value_enum, default_value = "source")]
    pub mode: Mode,

    /// Precision to scan at
    #[arg(long, value_enum, default_value = "symbol")]
    pub scan: Level,

    /// Vulnerability database: an https URL or a local directory
    #[arg(long, default_value = DEFAULT_DB, value_name = "URL")]
    pub db: String,

    /// Change to this directory before running
    #[arg(short = 'C', value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Comma-separated build tags for source loading
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    pub tags: Vec<String>,

    /// Analyze test files too
    #[arg(long)]
    pub test: bool,

    /// Additional output: traces, color, version, verbose
    #[arg(long, value_delimiter = ',', value_enum, value_name = "LIST")]
    pub show: Vec<Show>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: Format,

    /// Output the JSON stream (legacy alias for --format=json)
    #[arg(long)]
    pub json: bool,

    /// Package patterns, a binary path, or module@version queries
    #[arg(value_name = "PATTERNS")]
    pub patterns: Vec<String>,
}

impl Cli {
    /// `--json` overrides `--format`.
    pub fn effective_format(&self) -> Format {
        if self.json {
            Format::Json
        } else {
            self.format
        }
    }

    pub fn show_flags(&self) -> ShowFlags {
        let mut flags = ShowFlags::default();
        for show in &self.show {
            match show {
                Show::Traces => flags.traces = true,
                Show::Color => flags.color = true,
                Show::Version => flags.version = true,
                Show::Verbose => flags.verbose = true,
            }
        }
        flags
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Source,
    Binary,
    Convert,
    Query,
    Extract,
}

impl From<Mode> for ScanMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Source => ScanMode::Source,
            Mode::Binary => ScanMode::Binary,
            Mode::Convert => ScanMode::Convert,
            Mode::Query => ScanMode::Query,
            Mode::Extract => ScanMode::Extract,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Module,
    Package,
    Symbol,
}

impl From<Level> for ScanLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Module => ScanLevel::Module,
            Level::Package => ScanLevel::Package,
            Level::Symbol => ScanLevel::Symbol,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Traces,
    Color,
    Version,
    Verbose,
}

/// Output toggles resolved from `--show`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowFlags {
    pub traces: bool,
    pub color: bool,
    pub version: bool,
    pub verbose: bool,
}
