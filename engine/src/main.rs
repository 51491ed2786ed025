// lovestats
// Main entry point for the lovestats binary

use clap::Parser;
use lovestats_engine::cli::{Cli, Command};
use lovestats_engine::config::Config;
use lovestats_engine::handlers::{
    handle_check, handle_prebuild, handle_refresh, handle_serve, handle_show, handle_status,
    OutputFormat,
};
use lovestats_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!(
        "lovestats v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Serve { bind } => handle_serve(&config, bind).await,
        Command::Refresh { mode, no_prebuild } => {
            handle_refresh(&config, mode, no_prebuild, format).await
        }
        Command::Prebuild => handle_prebuild(&config, format).await,
        Command::Status { limit } => handle_status(&config, limit, format).await,
        Command::Show { campaign, year } => handle_show(&config, &campaign, year, format).await,
        Command::Check => handle_check(&config, format).await,
    }
}
