use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use lambda_service_manager::{config::ManagerConfig, service::Service, tracing::setup_tracing};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ManagerConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    setup_tracing(&config)?;

    start_manager(config).await
}

#[::tracing::instrument(skip(config), fields(env = %config.env, namespace = %config.namespace))]
async fn start_manager(config: ManagerConfig) -> anyhow::Result<()> {
    let mut service = Service::new(config)
        .await
        .context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
