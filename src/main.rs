use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::service::{
    docker::DockerRuntime, lifecycle::ContainerRuntime, orchestrator::RestartOrchestrator,
    probe::HttpProbe,
};

mod api;
mod cli;
mod config;
mod service;

#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::Args::parse();

    // Load the env file before the logger so RUST_LOG can live there too
    let env_file = dotenv::from_path(&args.env_file);

    // Initialize the logger
    env_logger::init();

    if let Err(e) = env_file {
        log::warn!("Error loading env file {:?}: {e}", args.env_file);
    }

    let config = match ServerConfig::from_env() {
        Ok(config) => config.with_args(&args),
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let docker = DockerRuntime::connect()?;
    if let Err(e) = docker.ping().await {
        log::warn!("Docker daemon is not reachable yet: {e}");
    }

    if config.probe_host.is_none() {
        log::warn!("SERVER_IP is not set, restart requests will be rejected");
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    let probe = Arc::new(HttpProbe::new(config.probe_request_timeout)?);
    let orchestrator = Arc::new(RestartOrchestrator::new(
        Arc::clone(&runtime),
        probe,
        config.timings,
    ));

    let state = Arc::new(AppState {
        runtime,
        orchestrator,
        probe_host: config.probe_host.clone(),
        health_container: config.health_container.clone(),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on {addr}");
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("Received stop signal, shutting down...");
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
}
