//! Newline-framed JSON renderer.
//!
//! Each event becomes one externally tagged object per line; the
//! stream is self-contained and round-trips through convert mode.
//! Flush never reports the vulnerabilities-found sentinel: stream
//! consumers inspect the findings themselves.

use anyhow::Result;
use modvet_osv::Entry;
use modvet_scan::{Config, Finding, Handler, Message, Progress};
use std::io::Write;

pub struct JsonHandler<W: Write> {
    out: W,
}

impl<W: Write> JsonHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn write(&mut self, message: Message) -> Result<()> {
        let line = serde_json::to_string(&message)?;
        writeln!(self.out, "{line}")?;
        Ok(())
    }
}

impl<W: Write> Handler for JsonHandler<W> {
    fn config(&mut self, config: &Config) -> Result<()> {
        self.write(Message::Config(config.clone()))
    }

    fn progress(&mut self, progress: &Progress) -> Result<()> {
        self.write(Message::Progress(progress.clone()))
    }

    fn osv(&mut self, entry: &Entry) -> Result<()> {
        self.write(Message::Osv(entry.clone()))
    }

    fn finding(&mut self, finding: &Finding) -> Result<()> {
        // Fail closed on malformed findings rather than corrupting
        // the stream.
        finding.validate().map_err(anyhow::Error::msg)?;
        self.write(Message::Finding(finding.clone()))
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}
