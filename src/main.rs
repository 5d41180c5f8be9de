use anyhow::{Context, Result};
use clap::Parser;
use lsproxy::logger::TrafficLog;
use lsproxy::proxy;
use lsproxy::script::Script;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// A transparent LSP proxy
#[derive(Parser, Debug)]
#[command(name = "lsproxy")]
#[command(about = "Record and rewrite LSP traffic between an editor and a language server", long_about = None)]
#[command(version)]
struct Args {
    /// Path to a script library with message transforms
    /// (default: ~/.config/lsproxy/script.so, used only when present)
    #[arg(short = 's', value_name = "PATH")]
    script: Option<PathBuf>,

    /// Path to the traffic log (default: ~/.local/state/lsproxy/log)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Language server command to run, with its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Argument errors exit 1 like every other startup failure; help and
    // version output are not failures.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Stdout carries the client-facing protocol stream, so diagnostics must
    // go to stderr. RUST_LOG controls verbosity.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let home = PathBuf::from(std::env::var("HOME").context("failed to get $HOME")?);

    let log_path = args.log_file.unwrap_or_else(|| {
        home.join(".local")
            .join("state")
            .join("lsproxy")
            .join("log")
    });
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open traffic log {}", log_path.display()))?;
    let log = Arc::new(TrafficLog::new(file));

    let script = match args.script {
        Some(path) => Script::load(&path)?,
        None => {
            let default = home.join(".config").join("lsproxy").join("script.so");
            // The default script is optional; a present-but-broken one still
            // fails the startup.
            if default.exists() {
                Script::load(&default)?
            } else {
                Script::new()
            }
        }
    };

    proxy::run_proxy(
        &args.command,
        script,
        log,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await
}
