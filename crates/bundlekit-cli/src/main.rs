use std::path::PathBuf;
use std::process::ExitCode;

use bundlekit_core::ArtifactClass;
use clap::{ArgAction, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use dispatch::{run_cli, EXIT_INSTALL_FAILED};

#[derive(Parser, Debug)]
#[command(name = "bundlekit")]
#[command(about = "Keeps the runtime image and compatibility layer up to date", long_about = None)]
struct Cli {
    /// Config file; defaults to $BUNDLEKIT_CONFIG or the XDG config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v info is the default, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Make sure an install exists and is current; prints its path.
    Ensure {
        #[arg(value_parser = parse_class)]
        class: ArtifactClass,
        /// Pin an exact published version instead of the latest.
        #[arg(long)]
        version: Option<String>,
        /// Seconds to wait for another instance's update before giving up.
        #[arg(long, value_name = "SECS")]
        lock_timeout: Option<u64>,
    },
    Status {
        #[arg(value_parser = parse_class)]
        class: Option<ArtifactClass>,
    },
    Paths,
    Completions {
        shell: Shell,
    },
}

fn parse_class(input: &str) -> Result<ArtifactClass, String> {
    ArtifactClass::parse(input).ok_or_else(|| {
        let known = ArtifactClass::ALL
            .iter()
            .map(|class| class.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("unknown artifact class '{input}' (expected one of: {known})")
    })
}

fn log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_env("BUNDLEKIT_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_directive(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_INSTALL_FAILED)
        }
    }
}

#[cfg(test)]
mod tests;
