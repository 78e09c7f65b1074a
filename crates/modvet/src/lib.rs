//! modvet reports known vulnerabilities that affect Go code.
//!
//! Given a source module or a compiled executable, it consults a
//! vulnerability database and reports which advisories apply, refined
//! by how deeply the vulnerable code is actually reached: required by
//! the module graph, imported into the package graph, or called via
//! the program's call graph.

pub mod cli;
pub mod errors;
pub mod handlers;
pub mod scan;
pub mod toolchain;

use anyhow::Result;
use cli::{Cli, Format};
use handlers::{JsonHandler, TextHandler};
use modvet_osv::{Client, DirClient, HttpClient};
use scan::{Orchestrator, ScanConfig};
use std::io;
use std::sync::Arc;
use toolchain::GoToolchain;

/// Wire the default collaborators and run the requested scan.
pub fn run(cli: Cli) -> Result<()> {
    let format = cli.effective_format();
    let show = cli.show_flags();
    let config = ScanConfig {
        mode: cli.mode.into(),
        level: cli.scan.into(),
        db: cli.db.clone(),
        dir: match &cli.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        },
        tags: cli.tags.clone(),
        include_tests: cli.test,
        show,
        patterns: cli.patterns.clone(),
    };

    let client: Box<dyn Client> = if config.db.starts_with("http://") || config.db.starts_with("https://") {
        Box::new(HttpClient::new(&config.db))
    } else {
        Box::new(DirClient::new(&config.db))
    };
    let go = Arc::new(GoToolchain::new());

    let orchestrator = Orchestrator {
        config,
        client,
        loader: go.clone(),
        builder: go.clone(),
        symbols: go,
    };

    match format {
        Format::Text => {
            let mut handler = TextHandler::new(io::stdout().lock(), show);
            orchestrator.run(&mut handler)
        }
        Format::Json => {
            let mut handler = JsonHandler::new(io::stdout().lock());
            orchestrator.run(&mut handler)
        }
    }
}
