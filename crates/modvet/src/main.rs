use clap::{CommandFactory, Parser};
use modvet::cli::Cli;
use modvet::errors::{EnvError, UsageError};
use modvet_scan::VulnerabilitiesFound;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match modvet::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is::<VulnerabilitiesFound>() => ExitCode::from(3),
        Err(err) => {
            if let Some(usage) = err.downcast_ref::<UsageError>() {
                eprintln!("modvet: {usage}");
                eprintln!("{}", Cli::command().render_usage());
                return ExitCode::from(2);
            }
            if let Some(env) = err.downcast_ref::<EnvError>() {
                eprintln!("modvet: {env}");
                eprintln!("{}", env.remediation());
                return ExitCode::FAILURE;
            }
            eprintln!("modvet: {err:#}");
            ExitCode::FAILURE
        }
    }
}
