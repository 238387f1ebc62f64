mod api;
mod app;
mod audio;
mod config;
mod error;
mod messages;
mod services;

use app::App;
use config::Config;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the shell
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting voxask");

    let config_path = Config::config_path()?;
    let config = Config::load_from(&config_path)?;
    config.validate()?;

    // Create LocalSet for !Send futures (the Recorder holds a cpal::Stream)
    let local = tokio::task::LocalSet::new();

    local
        .run_until(async move { App::new(config, config_path)?.run().await })
        .await
}
