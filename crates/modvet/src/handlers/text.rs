//! Terminal renderer.
//!
//! Events are buffered until flush: the ordering contract guarantees
//! every advisory arrives before its findings, so the report can be
//! grouped by advisory and split into called and informational
//! sections.

use crate::cli::ShowFlags;
use anyhow::Result;
use colored::Colorize;
use modvet_osv::Entry;
use modvet_scan::{
    found_at_level, Config, Finding, Frame, Handler, Progress, ScanLevel, VulnerabilitiesFound,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

pub struct TextHandler<W: Write> {
    out: W,
    show: ShowFlags,
    config: Option<Config>,
    entries: BTreeMap<String, Entry>,
    findings: Vec<Finding>,
}

impl<W: Write> TextHandler<W> {
    pub fn new(out: W, show: ShowFlags) -> Self {
        Self {
            out,
            show,
            config: None,
            entries: BTreeMap::new(),
            findings: Vec::new(),
        }
    }

    fn heading(&self, text: String) -> String {
        if self.show.color {
            text.bold().to_string()
        } else {
            text
        }
    }

    fn alert(&self, text: String) -> String {
        if self.show.color {
            text.red().bold().to_string()
        } else {
            text
        }
    }

    fn dim(&self, text: String) -> String {
        if self.show.color {
            text.dimmed().to_string()
        } else {
            text
        }
    }

    fn scan_level(&self) -> ScanLevel {
        self.config
            .as_ref()
            .map(|c| c.scan_level)
            .unwrap_or_default()
    }

    fn write_advisory_block(&mut self, number: usize, id: &str, with_traces: bool) -> Result<()> {
        let entry = self.entries.get(id).cloned();
        let group: Vec<Finding> = self
            .findings
            .iter()
            .filter(|f| f.osv == id)
            .cloned()
            .collect();

        let title = self.alert(format!("Vulnerability #{number}: {id}"));
        writeln!(self.out, "{title}")?;
        if let Some(entry) = &entry {
            if !entry.summary.is_empty() {
                writeln!(self.out, "    {}", entry.summary)?;
            }
            writeln!(
                self.out,
                "  More info: https://pkg.go.dev/vuln/{}",
                entry.id
            )?;
            for alias in &entry.aliases {
                writeln!(self.out, "  Also known as: {alias}")?;
            }
        }

        let mut seen_modules: BTreeSet<&str> = BTreeSet::new();
        for finding in &group {
            let Some(sink) = finding.sink() else { continue };
            if !seen_modules.insert(sink.module.as_str()) {
                continue;
            }
            writeln!(self.out, "  Module: {}", sink.module)?;
            if !sink.version.is_empty() {
                writeln!(self.out, "    Found in: {}@{}", sink.module, sink.version)?;
            }
            if finding.fixed_version.is_empty() {
                writeln!(self.out, "    Fixed in: N/A")?;
            } else {
                writeln!(
                    self.out,
                    "    Fixed in: {}@{}",
                    sink.module, finding.fixed_version
                )?;
            }
        }

        if with_traces && self.show.traces {
            let traced: Vec<&Finding> = group.iter().filter(|f| f.trace.len() > 1).collect();
            if !traced.is_empty() {
                writeln!(self.out, "    Example traces found:")?;
                for (i, finding) in traced.iter().enumerate() {
                    for (j, line) in render_trace(&finding.trace).into_iter().enumerate() {
                        if j == 0 {
                            writeln!(self.out, "      #{}: {line}", i + 1)?;
                        } else {
                            writeln!(self.out, "          {line}")?;
                        }
                    }
                }
            }
        }
        writeln!(self.out)?;
        Ok(())
    }
}

impl<W: Write> Handler for TextHandler<W> {
    fn config(&mut self, config: &Config) -> Result<()> {
        if self.show.version {
            let line = self.dim(format!(
                "{} {} scanning at {} level using {}",
                config.scanner_name, config.scanner_version, config.scan_level, config.db
            ));
            writeln!(self.out, "{line}")?;
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn progress(&mut self, progress: &Progress) -> Result<()> {
        let line = self.dim(progress.message.clone());
        writeln!(self.out, "{line}")?;
        writeln!(self.out)?;
        Ok(())
    }

    fn osv(&mut self, entry: &Entry) -> Result<()> {
        self.entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn finding(&mut self, finding: &Finding) -> Result<()> {
        // Fail closed: renderers reject what the emitter should not
        // have sent.
        finding.validate().map_err(anyhow::Error::msg)?;
        self.findings.push(finding.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let level = self.scan_level();

        let mut primary: Vec<String> = Vec::new();
        let mut informational: Vec<String> = Vec::new();
        let mut advisory_order: Vec<String> = Vec::new();
        for finding in &self.findings {
            if !advisory_order.contains(&finding.osv) {
                advisory_order.push(finding.osv.clone());
            }
        }
        for id in &advisory_order {
            let best = self
                .findings
                .iter()
                .filter(|f| &f.osv == id)
                .map(|f| f.precision())
                .max()
                .unwrap_or(ScanLevel::Module);
            if best >= level {
                primary.push(id.clone());
            } else {
                informational.push(id.clone());
            }
        }

        // Advisories without findings only occur in query mode, where
        // the list itself is the answer.
        let referenced: BTreeSet<&String> = self.findings.iter().map(|f| &f.osv).collect();
        let unreferenced: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !referenced.contains(id))
            .cloned()
            .collect();
        for (i, id) in unreferenced.iter().enumerate() {
            self.write_advisory_block(i + 1, id, false)?;
        }

        for (i, id) in primary.clone().into_iter().enumerate() {
            self.write_advisory_block(i + 1, &id, true)?;
        }

        if !informational.is_empty() {
            let heading = self.heading("=== Informational ===".to_string());
            writeln!(self.out, "{heading}")?;
            writeln!(
                self.out,
                "These advisories affect modules or packages you require, but no vulnerable\nsymbol appears reachable. They are unlikely to affect your program.\n"
            )?;
            for (i, id) in informational.into_iter().enumerate() {
                self.write_advisory_block(i + 1, &id, false)?;
            }
        }

        if primary.is_empty() {
            if unreferenced.is_empty() {
                writeln!(self.out, "No vulnerabilities found.")?;
            }
            self.out.flush()?;
            return Ok(());
        }

        let modules: BTreeSet<&str> = self
            .findings
            .iter()
            .filter(|f| f.precision() >= level)
            .filter_map(|f| f.sink().map(|s| s.module.as_str()))
            .collect();
        let summary = self.alert(format!(
            "Your code is affected by {} vulnerabilit{} from {} module{}.",
            primary.len(),
            if primary.len() == 1 { "y" } else { "ies" },
            modules.len(),
            if modules.len() == 1 { "" } else { "s" },
        ));
        writeln!(self.out, "{summary}")?;
        self.out.flush()?;

        if found_at_level(self.findings.iter(), level) {
            return Err(VulnerabilitiesFound.into());
        }
        Ok(())
    }
}

/// Render a sink-first trace as source-to-sink call lines.
fn render_trace(trace: &[Frame]) -> Vec<String> {
    let frames: Vec<&Frame> = trace.iter().rev().collect();
    if frames.len() < 2 {
        return frames.iter().map(|f| frame_name(f)).collect();
    }
    frames
        .windows(2)
        .map(|pair| {
            let (caller, callee) = (pair[0], pair[1]);
            let prefix = callee
                .position
                .as_ref()
                .map(|p| format!("{p}: "))
                .unwrap_or_default();
            format!("{prefix}{} calls {}", frame_name(caller), frame_name(callee))
        })
        .collect()
}

fn frame_name(frame: &Frame) -> String {
    let base = frame
        .package
        .rsplit('/')
        .next()
        .filter(|b| !b.is_empty())
        .unwrap_or(&frame.module);
    let symbol = frame.symbol();
    if symbol.is_empty() {
        base.to_string()
    } else {
        format!("{base}.{symbol}")
    }
}
