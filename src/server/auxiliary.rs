use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::server::core::{ConnectionHandler, Server, ServerInformation};
use crate::utils::error::ServerError;

/// Identifier of the built-in locator auxiliary server factory.
pub const LOCATOR_SERVER: &str = "locator";

/// A secondary network listener started alongside the main server, sharing
/// its authentication/registry core.
///
/// Each auxiliary server is started on a dedicated worker and awaited
/// before the main server is considered up; a start failure aborts server
/// construction. `stop` failures during shutdown are logged and swallowed.
#[async_trait]
pub trait AuxiliaryServer: Send + Sync {
    /// A human-readable description for logs.
    fn information(&self) -> String;

    /// Starts the listener. Returns once it is fully operational.
    async fn start(&self) -> Result<(), ServerError>;

    /// Stops the listener.
    async fn stop(&self) -> Result<(), ServerError>;
}

/// Creates an [`AuxiliaryServer`] bound to a server core. Resolved through
/// the plugin registry by identifier.
pub trait AuxiliaryServerFactory<H: ConnectionHandler>: Send + Sync {
    fn create(&self, server: &Server<H>) -> Result<Arc<dyn AuxiliaryServer>, ServerError>;
}

/// The payload published by the locator endpoint, used for server ranking.
#[derive(Debug, Serialize)]
struct LocatorRecord {
    information: ServerInformation,
    load: u64,
    connections_available: bool,
}

/// The built-in locator: an HTTP endpoint on the registry port publishing
/// server information, current load and availability.
pub struct LocatorServer<H: ConnectionHandler> {
    server: Server<H>,
    port: u16,
    shutdown: StdMutex<Option<oneshot::Sender<()>>>,
}

impl<H: ConnectionHandler> LocatorServer<H> {
    pub fn new(server: Server<H>, port: u16) -> Self {
        Self {
            server,
            port,
            shutdown: StdMutex::new(None),
        }
    }
}

async fn locator_record<H: ConnectionHandler>(
    State(server): State<Server<H>>,
) -> Json<LocatorRecord> {
    Json(LocatorRecord {
        information: server.server_information().clone(),
        load: server.server_load(),
        connections_available: server.connections_available(),
    })
}

async fn locator_load<H: ConnectionHandler>(State(server): State<Server<H>>) -> Json<u64> {
    Json(server.server_load())
}

async fn locator_available<H: ConnectionHandler>(State(server): State<Server<H>>) -> Json<bool> {
    Json(server.connections_available())
}

#[async_trait]
impl<H: ConnectionHandler> AuxiliaryServer for LocatorServer<H> {
    fn information(&self) -> String {
        format!(
            "locator for {} on port {}",
            self.server.server_information().server_name,
            self.port
        )
    }

    async fn start(&self) -> Result<(), ServerError> {
        let app = Router::new()
            .route("/server-information", get(locator_record::<H>))
            .route("/load", get(locator_load::<H>))
            .route("/available", get(locator_available::<H>))
            .with_state(self.server.clone());

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let builder = axum::Server::try_bind(&addr)
            .map_err(|e| ServerError::Connection(format!("Locator bind failed: {e}")))?;
        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock().unwrap() = Some(tx);
        let serving = builder
            .serve(app.into_make_service())
            .with_graceful_shutdown(async {
                rx.await.ok();
            });
        tokio::spawn(async move {
            if let Err(e) = serving.await {
                error!("Locator server error: {}", e);
            }
        });
        info!("Locator listening on port {}", self.port);

        Ok(())
    }

    async fn stop(&self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }

        Ok(())
    }
}

/// Factory for the built-in locator, bound to the configured registry port.
pub struct LocatorServerFactory;

impl<H: ConnectionHandler> AuxiliaryServerFactory<H> for LocatorServerFactory {
    fn create(&self, server: &Server<H>) -> Result<Arc<dyn AuxiliaryServer>, ServerError> {
        let port = server.configuration().registry_port;
        if port == 0 {
            return Err(ServerError::Configuration(
                "The locator requires a non-zero registry_port".into(),
            ));
        }

        Ok(Arc::new(LocatorServer::new(server.clone(), port)))
    }
}
