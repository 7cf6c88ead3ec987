mod config;
mod profile;
mod sandbox;

use clap::Parser;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::profile::LaunchProfile;
use crate::sandbox::{ProcessRunner, RealProcessRunner, TerminalInfo};

/// Runs bazel inside the dazel build container. Every argument is passed
/// through to bazel, so dazel has no options of its own.
#[derive(Parser, Debug)]
#[command(name = "dazel", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DazelError {
    #[error("invalid config file {}: {message}", .path.display())]
    ConfigSyntax { path: PathBuf, message: String },
    #[error("failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },
    #[error("{0} executable could not be found on PATH")]
    MissingDependency(String),
    #[error("process error: {0}")]
    Process(String),
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    match run(&cli.args, &RealProcessRunner) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .try_init();
}

fn run<R: ProcessRunner>(args: &[String], runner: &R) -> Result<i32, DazelError> {
    let config = config::resolve()?;
    let profile = LaunchProfile::from_config(config)?;
    debug!(
        ?profile,
        ports = %profile.ports_fragment(),
        env = %profile.env_fragment(),
        "resolved launch profile"
    );

    let code = sandbox::ensure_started(&profile, runner)?;
    if code != 0 {
        return Ok(code);
    }

    let terminal = TerminalInfo::detect();
    sandbox::send_command(&profile, &terminal, args, runner)
}
