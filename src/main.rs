use forwardgate::config::Config;
use forwardgate::error::DispatchError;
use forwardgate::proxy::ProxyServer;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forwardgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("forwardgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    log_startup(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_tx.send_replace(true);
    });

    let server = ProxyServer::from_config(&config);
    match server.run(shutdown_rx).await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.downcast_ref::<DispatchError>().is_some() => {
            error!(error = %e, "No backend left to serve traffic, exiting");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e),
    }
}

fn log_startup(config: &Config) {
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        startup_delay_secs = config.server.startup_delay_secs,
        rejecting = config.server.rejection_data.is_some(),
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    for (i, backend) in config.backends.iter().enumerate() {
        info!(
            backend = i + 1,
            address = %backend.address,
            command = backend.command.as_deref().unwrap_or("(external)"),
            startup_timeout_secs = ?backend.startup_timeout(&config.defaults).map(|t| t.as_secs()),
            "Backend configured"
        );
    }
}

/// Resolve on Ctrl+C, or SIGTERM on Unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
