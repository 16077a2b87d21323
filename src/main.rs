//! Command-line harness for the sandbox
//!
//! Results are printed to stdout as JSON; logs go to stderr and to a daily
//! log file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcl_sandbox::{
    platform_dirs, ErrorInfo, LimitOverrides, Sandbox, SandboxConfig, SandboxError, ShellScope,
};

/// Run untrusted TCL scripts and whitelisted shell commands under policy
#[derive(Parser, Debug)]
#[command(name = "tcl-sandbox")]
#[command(version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Skip writing the rolling log file
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a script file
    RunScript {
        /// Script to run; `-` reads stdin
        script: PathBuf,

        /// Working directory inside an allowed directory
        #[arg(short = 'C', long)]
        working_dir: Option<PathBuf>,

        /// Override the execution timeout for this run
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Run a shell command through the command policy
    RunCommand {
        /// bash or powershell
        scope: ShellScope,

        command: String,

        #[arg(short = 'C', long)]
        working_dir: Option<PathBuf>,
    },

    /// Report whether the policy admits a command, without running it
    CheckCommand { scope: ShellScope, command: String },

    /// Run the static script checks only
    Validate {
        script: PathBuf,

        #[arg(short = 'C', long)]
        working_dir: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct Verdict {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

fn init_logging(log_file: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let file = if log_file {
        match platform_dirs::logs_dir().and_then(|dir| {
            platform_dirs::ensure_dir(&dir)?;
            Ok(dir)
        }) {
            Ok(dir) => Some(tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, "tcl-sandbox.log"),
            )),
            Err(e) => {
                eprintln!("Log file disabled: {e:#}");
                None
            }
        }
    } else {
        None
    };

    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .init();
    guard
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => platform_dirs::config_file()?,
    };
    info!("Loading configuration from {}", path.display());
    SandboxConfig::load(&path)
}

fn read_script(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("failed to read script from stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Working directory, defaulting to the first allowed directory
fn working_dir(sandbox: &Sandbox, requested: Option<PathBuf>) -> Result<PathBuf> {
    match requested {
        Some(dir) => Ok(dir),
        None => sandbox
            .files()
            .allowed_directories()
            .into_iter()
            .next()
            .context("no allowed directory is available"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(!cli.no_log_file);

    let sandbox = Sandbox::from_config(load_config(cli.config.as_deref())?)?;

    let success = match cli.command {
        Command::RunScript {
            script,
            working_dir: dir,
            timeout,
        } => {
            let text = read_script(&script)?;
            let dir = working_dir(&sandbox, dir)?;
            let overrides = LimitOverrides {
                max_execution_seconds: timeout,
                ..LimitOverrides::default()
            };
            let result = sandbox
                .execute_script_with_limits(&text, dir, &overrides)
                .await;
            print_json(&result)?;
            result.success
        }
        Command::RunCommand {
            scope,
            command,
            working_dir: dir,
        } => {
            let dir = working_dir(&sandbox, dir)?;
            match sandbox.run_command(scope, &command, &dir).await {
                Ok(result) => {
                    print_json(&result)?;
                    result.success
                }
                Err(e) => {
                    print_json(&ErrorInfo::from(&e))?;
                    false
                }
            }
        }
        Command::CheckCommand { scope, command } => {
            let error = sandbox
                .check_command(scope, &command)
                .err()
                .map(|e| ErrorInfo::from(SandboxError::from(e)));
            let verdict = Verdict {
                allowed: error.is_none(),
                error,
            };
            print_json(&verdict)?;
            verdict.allowed
        }
        Command::Validate {
            script,
            working_dir: dir,
        } => {
            let text = read_script(&script)?;
            let dir = working_dir(&sandbox, dir)?;
            let error = sandbox
                .validate_script(&text, &dir)
                .err()
                .map(|e| ErrorInfo::from(SandboxError::from(e)));
            let verdict = Verdict {
                allowed: error.is_none(),
                error,
            };
            print_json(&verdict)?;
            verdict.allowed
        }
    };

    if !success {
        warn!("Request did not succeed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
