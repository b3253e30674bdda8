use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaygate::config;
use relaygate::Core;

#[derive(Parser)]
#[command(name = "relaygate")]
#[command(version, about = "Dynamic HTTP/TCP reverse proxy data plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); falls back to environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve,

    /// Validate the configuration and print the reduced overview
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Check => check(config),
    }
}

async fn serve(config: config::Config) -> Result<()> {
    let core = Core::new(config).await?;

    tracing::info!(
        entrypoints = core.entrypoints().len(),
        "relaygate starting"
    );
    let accept_loops = core.start();

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, draining");
    core.shutdown().await;

    for accept_loop in accept_loops {
        let _ = accept_loop.await;
    }

    tracing::info!("relaygate stopped");
    Ok(())
}

fn check(config: config::Config) -> Result<()> {
    let features = config.features();
    println!("entrypoints: {}", config.entrypoints.len());
    println!("services:    {}", config.services.len());
    println!("providers:   {:?}", config.providers());
    println!(
        "features:    tracing={:?} metrics={:?} access_log={}",
        features.tracing, features.metrics, features.access_log
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
