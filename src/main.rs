//! # Remote Connection Server
//!
//! Binary entry point: loads configuration from the environment, registers
//! the built-in plugins, starts the server core together with its
//! maintenance scheduler and auxiliary servers, exposes the admin endpoint
//! and serves the main WebSocket listener until interrupted.
//!
//! ## Errors
//! Exits with an error if configuration validation fails, a required
//! plugin does not resolve, an auxiliary server fails to start or the
//! main listener cannot bind.

use std::sync::Arc;
use std::time::Duration;

use tokio::{net::TcpListener, signal};
use tracing::info;

use remote_server_rs::config::ServerConfiguration;
use remote_server_rs::server::auxiliary::LOCATOR_SERVER;
use remote_server_rs::server::{
    admin, handler, PluginRegistry, Server, ServerAdmin, SessionService, SystemMetricsProvider,
    TransportState,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt::init();

    let mut configuration = ServerConfiguration::from_env()?;
    if configuration.registry_port > 0
        && !configuration
            .auxiliary_servers
            .iter()
            .any(|id| id == LOCATOR_SERVER)
    {
        configuration.auxiliary_servers.push(LOCATOR_SERVER.to_string());
    }
    configuration.validate()?;

    // deployments register their authenticators and custom auxiliary
    // servers here, next to the built-ins
    let plugins = PluginRegistry::with_defaults();

    let tls_acceptor = configuration.create_tls_acceptor()?;
    let port = configuration.port;
    let admin_port = configuration.admin_port;
    let idle_timeout = Duration::from_millis(configuration.idle_timeout_ms);

    let server = Server::start(configuration, SessionService::new(idle_timeout), &plugins).await?;

    if admin_port > 0 {
        let server_admin = Arc::new(ServerAdmin::new(
            server.clone(),
            Arc::new(SystemMetricsProvider::new()),
        ));
        tokio::spawn(admin::serve_admin_http(server_admin, admin_port));
    }

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Server listening on port {}", port);

    let state = Arc::new(TransportState {
        server: server.clone(),
        tls_acceptor,
    });

    // The core registers no process-exit hooks; ctrl-c handling here owns
    // the shutdown call.
    tokio::select! {
        _ = handler::serve(listener, state) => {},
        _ = shutdown_signal() => {
            info!("Shutting down gracefully");
            server.shutdown().await;
        }
    }

    Ok(())
}

/// Listens for a shutdown signal (Ctrl+C) and initiates a graceful
/// shutdown.
async fn shutdown_signal() {
    signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
}
