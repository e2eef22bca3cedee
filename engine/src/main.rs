// Sift
// Main entry point for the sift binary

use clap::Parser;
use sift_engine::cli::{Cli, Command};
use sift_engine::config::Config;
use sift_engine::handlers::{
    handle_ask, handle_check, handle_doctor, handle_exec, handle_history, handle_inspect,
    OutputFormat,
};
use sift_engine::sandbox::serve_stdio;
use sift_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The worker's stdout is the protocol channel: no config, no logging
    if let Command::SandboxWorker = cli.command {
        serve_stdio()?;
        return Ok(());
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = Config::load(cli.config.as_deref())?;

    // RUST_LOG still wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::debug!(
        "Sift v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Ask {
            query,
            files,
            session,
        } => {
            tracing::info!("Answering question over {} file(s)", files.len());
            handle_ask(query, files, session, &config, format).await
        }

        Command::Check { script } => handle_check(script, format).await,

        Command::Exec {
            script,
            files,
            timeout,
        } => handle_exec(script, files, timeout, &config, format).await,

        Command::Inspect { files } => handle_inspect(files, &config, format).await,

        Command::History { limit, session } => {
            handle_history(limit, session, &config, format).await
        }

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }

        Command::SandboxWorker => Ok(()),
    }
}
