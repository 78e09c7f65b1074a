//! The push protocol consumed by renderers.
//!
//! Event ordering contract: one `config`, zero or more `progress`
//! events, then interleaved `osv` and `finding` events where each
//! advisory appears at most once and always before the first finding
//! referencing it, then a terminal `flush`.

use crate::finding::{Finding, ScanLevel};
use anyhow::{Context, Result};
use modvet_osv::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use thiserror::Error;

/// Version of the streamed output format.
pub const PROTOCOL_VERSION: &str = "v1.0.0";

/// Distinguished error returned by `flush` when the scan found
/// vulnerabilities at the requested precision. Drives exit code 3; it
/// is not a failure for logging purposes.
#[derive(Debug, Clone, Copy, Error)]
#[error("vulnerabilities found")]
pub struct VulnerabilitiesFound;

/// How the program under analysis was presented to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Source,
    Binary,
    Query,
    Convert,
    Extract,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Source => write!(f, "source"),
            ScanMode::Binary => write!(f, "binary"),
            ScanMode::Query => write!(f, "query"),
            ScanMode::Convert => write!(f, "convert"),
            ScanMode::Extract => write!(f, "extract"),
        }
    }
}

/// Scan-wide parameters, the first event of every stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scanner_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scanner_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub db: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub go_version: String,
    #[serde(default)]
    pub scan_level: ScanLevel,
    #[serde(default)]
    pub scan_mode: ScanMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    pub message: String,
}

/// Capability set consumed by the finding emitter and implemented by
/// every renderer.
pub trait Handler {
    fn config(&mut self, config: &Config) -> Result<()>;
    fn progress(&mut self, progress: &Progress) -> Result<()>;
    fn osv(&mut self, entry: &Entry) -> Result<()>;
    fn finding(&mut self, finding: &Finding) -> Result<()>;

    /// End of stream. Returns [`VulnerabilitiesFound`] if findings at
    /// the configured scan level were emitted.
    fn flush(&mut self) -> Result<()>;
}

/// One newline-framed object of the JSON stream, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Message {
    Config(Config),
    Progress(Progress),
    Osv(Entry),
    Finding(Finding),
}

/// Forward a parsed stream message to a handler.
pub fn dispatch(message: &Message, handler: &mut dyn Handler) -> Result<()> {
    match message {
        Message::Config(config) => handler.config(config),
        Message::Progress(progress) => handler.progress(progress),
        Message::Osv(entry) => handler.osv(entry),
        Message::Finding(finding) => handler.finding(finding),
    }
}

/// Replay a recorded newline-framed stream into a handler and flush
/// it. This is the whole of convert mode.
pub fn replay(reader: impl BufRead, handler: &mut dyn Handler) -> Result<()> {
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read stream")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(&line)
            .with_context(|| format!("malformed stream object on line {}", number + 1))?;
        dispatch(&message, handler)?;
    }
    handler.flush()
}

/// Whether any of `findings` is precise enough to fail the scan at
/// `level`.
pub fn found_at_level<'a>(findings: impl IntoIterator<Item = &'a Finding>, level: ScanLevel) -> bool {
    findings.into_iter().any(|f| f.precision() >= level)
}

/// Handler that records every event, for tests and for stages that
/// buffer a stream.
#[derive(Debug, Default)]
pub struct MemHandler {
    pub messages: Vec<Message>,
    scan_level: ScanLevel,
    found: bool,
}

impl MemHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> Vec<&Finding> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Finding(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn osv_ids(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Osv(entry) => Some(entry.id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn progress_messages(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Progress(p) => Some(p.message.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Handler for MemHandler {
    fn config(&mut self, config: &Config) -> Result<()> {
        self.scan_level = config.scan_level;
        self.messages.push(Message::Config(config.clone()));
        Ok(())
    }

    fn progress(&mut self, progress: &Progress) -> Result<()> {
        self.messages.push(Message::Progress(progress.clone()));
        Ok(())
    }

    fn osv(&mut self, entry: &Entry) -> Result<()> {
        self.messages.push(Message::Osv(entry.clone()));
        Ok(())
    }

    fn finding(&mut self, finding: &Finding) -> Result<()> {
        self.found |= finding.precision() >= self.scan_level;
        self.messages.push(Message::Finding(finding.clone()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.found {
            return Err(VulnerabilitiesFound.into());
        }
        Ok(())
    }
}
