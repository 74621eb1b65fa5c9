use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_lookout_client::LookoutClient;
use beach_lookout_core::ServerEnvelope;
use beach_lookout_server::{
    config::{Cli, Command, SendArgs},
    routes::{router, AppState},
    telemetry::Telemetry,
    SessionRegistry, ServerConfig,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Command::Send(args)) = cli.command {
        return send(args).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        shell = %config.shell.display(),
        enable_admin = config.enable_admin,
        "starting beach-lookout server"
    );

    run(config, telemetry.metrics_handle()).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::from_config(&config, metrics)?;
    let registry = state.registry.clone();
    let app = router(state, config.enable_admin);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-lookout listening on {}", config.listen_addr);

    let graceful =
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(registry.clone()));
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        remaining = registry.len(),
        "waiting for sessions to drain"
    );
    if !registry.wait_empty(config.shutdown_grace).await {
        warn!(
            remaining = registry.len(),
            "sessions still open after the shutdown grace period"
        );
    }
    info!("graceful shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C after closing every session, so in-flight commands are
/// cancelled while the listener stops accepting.
async fn shutdown_signal(registry: SessionRegistry) {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
    registry.close_all();
}

async fn send(args: SendArgs) -> Result<ExitCode> {
    let url = LookoutClient::url_for(&args.url, args.target.as_deref());
    let command = args.command.join(" ");
    let mut client = LookoutClient::connect(&url).await?;
    client.send_command(&command).await?;

    let transcript = client
        .collect_until_terminal(Duration::from_secs(args.timeout_secs))
        .await?;
    for line in &transcript.output {
        println!("{line}");
    }
    let _ = client.close().await;

    match &transcript.terminal {
        ServerEnvelope::Finished(message) => {
            eprintln!("{message}");
            Ok(ExitCode::SUCCESS)
        }
        other => {
            eprintln!("{}", other.data());
            Ok(ExitCode::FAILURE)
        }
    }
}
