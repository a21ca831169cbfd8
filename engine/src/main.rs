// Vitalis Health Chat Engine
// Main entry point for the vitalis binary

use clap::Parser;
use vitalis_engine::cli::{Cli, Command, ConfigAction};
use vitalis_engine::config::Config;
use vitalis_engine::handlers::{
    handle_chat, handle_config_path, handle_config_show, handle_doctor, OutputFormat,
};
use vitalis_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Vitalis Engine v{} ({} - {})", version, commit, timestamp);

    // Handle commands
    match cli.command {
        Command::Chat { prompt, warm_up } => {
            tracing::info!("Starting chat with {} backend", config.backend.kind);
            handle_chat(prompt, warm_up, &config, format).await
        }

        Command::Config { action } => {
            tracing::info!("Config management: {:?}", action);
            match action {
                ConfigAction::Show => handle_config_show(&config, format),
                ConfigAction::Path => handle_config_path(cli.config.as_ref(), format),
            }
        }

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
