use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::ServerConfiguration;
use crate::server::auth::AuthenticatorChain;
use crate::server::auxiliary::AuxiliaryServer;
use crate::server::client::{
    ClientConnection, ConnectionRequest, RemoteClient, User, CLIENT_HOST_PARAMETER, UNKNOWN_HOST,
};
use crate::server::filter::DeserializationFilter;
use crate::server::maintenance::MaintenanceScheduler;
use crate::server::plugins::PluginRegistry;
use crate::server::registry::ConnectionRegistry;
use crate::utils::error::ServerError;

/// Supplies the service-specific half of the server: producing and
/// releasing connection handles, and deciding which connections the
/// maintenance task should prune.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + Sized + 'static {
    /// The handle servicing a connected client.
    type Handle: Clone + Send + Sync + 'static;

    /// Establishes the actual client connection, producing its handle.
    /// Called only after the whole authenticator chain has succeeded.
    async fn establish_connection(
        &self,
        client: &RemoteClient,
    ) -> Result<Self::Handle, ServerError>;

    /// Releases the given handle on disconnect. Failures are logged by the
    /// server and never propagated; the registry entry is already gone.
    async fn release_connection(&self, handle: Self::Handle) -> Result<(), ServerError>;

    /// Marks activity on the given handle. Invoked by the transport for
    /// service calls, feeding idle-based pruning. No-op by default.
    async fn register_activity(&self, _handle: &Self::Handle) {}

    /// Identifies and disconnects unhealthy or expired entries, given an
    /// immutable snapshot of all current connections. Invoked periodically
    /// by the maintenance scheduler, only while at least one connection
    /// exists.
    async fn prune_connections(
        &self,
        server: &Server<Self>,
        snapshot: Vec<ClientConnection<Self::Handle>>,
    ) -> Result<(), ServerError>;
}

/// Immutable identity record for a server instance, created once at
/// construction.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInformation {
    pub server_id: Uuid,
    pub server_name: String,
    pub port: u16,
    pub start_time: SystemTime,
    pub locale: String,
    pub timezone: String,
    pub version: String,
}

impl ServerInformation {
    fn new(configuration: &ServerConfiguration) -> Self {
        Self {
            server_id: Uuid::new_v4(),
            server_name: configuration.server_name.clone(),
            port: configuration.port,
            start_time: SystemTime::now(),
            locale: configuration.locale.clone(),
            timezone: configuration.timezone.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Prometheus metrics for the server, exposed through the admin endpoint.
pub struct ServerMetrics {
    /// Tracks the number of active client connections.
    pub connections: IntGauge,
    /// Counts the total number of remote calls processed.
    pub requests: IntCounter,
    /// Counts inbound payloads rejected by the deserialization filter.
    pub rejections: IntCounter,
    registry: Registry,
}

impl ServerMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let connections = IntGauge::new("connections", "Active connections").unwrap();
        let requests = IntCounter::new("requests_total", "Total remote calls processed").unwrap();
        let rejections = IntCounter::new(
            "deserialization_rejections_total",
            "Payloads rejected by the serialization filter",
        )
        .unwrap();

        registry.register(Box::new(connections.clone())).unwrap();
        registry.register(Box::new(requests.clone())).unwrap();
        registry.register(Box::new(rejections.clone())).unwrap();

        Self {
            connections,
            requests,
            rejections,
            registry,
        }
    }

    /// Exposes the current state of all registered metrics in
    /// Prometheus-compatible format.
    pub fn expose(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

/// Measures processed requests per second, feeding `server_load()`.
struct RequestCounter {
    total: AtomicU64,
    sample: StdMutex<RequestSample>,
}

struct RequestSample {
    taken_at: Instant,
    total: u64,
    rate: u64,
}

impl RequestCounter {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            sample: StdMutex::new(RequestSample {
                taken_at: Instant::now(),
                total: 0,
                rate: 0,
            }),
        }
    }

    fn count(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn requests_per_second(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        let mut sample = self.sample.lock().unwrap();
        let elapsed = sample.taken_at.elapsed();
        if elapsed.as_millis() >= 1000 {
            sample.rate =
                ((total - sample.total) as f64 / elapsed.as_secs_f64()).round() as u64;
            sample.total = total;
            sample.taken_at = Instant::now();
        }

        sample.rate
    }
}

struct ServerInner<H: ConnectionHandler> {
    configuration: ServerConfiguration,
    information: ServerInformation,
    handler: H,
    registry: ConnectionRegistry<H::Handle>,
    authenticators: AuthenticatorChain,
    filter: Option<Arc<dyn DeserializationFilter>>,
    auxiliary_servers: StdMutex<Vec<Arc<dyn AuxiliaryServer>>>,
    maintenance: OnceLock<MaintenanceScheduler>,
    metrics: ServerMetrics,
    request_counter: RequestCounter,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_listeners: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// The connection server core.
///
/// Owns the connection registry, the authenticator chain, the serialization
/// filter, the maintenance scheduler and the auxiliary servers, and exposes
/// connect/disconnect/shutdown. Cheap to clone; clones share the same
/// underlying server.
pub struct Server<H: ConnectionHandler> {
    inner: Arc<ServerInner<H>>,
}

impl<H: ConnectionHandler> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: ConnectionHandler> Server<H> {
    /// Starts a new server: installs the serialization filter, resolves the
    /// authenticator chain, starts the maintenance scheduler and brings up
    /// every configured auxiliary server before returning. A failure in any
    /// auxiliary server start aborts construction and triggers shutdown.
    pub async fn start(
        configuration: ServerConfiguration,
        handler: H,
        plugins: &PluginRegistry<H>,
    ) -> Result<Self, ServerError> {
        configuration.validate()?;

        let filter = match configuration.object_input_filter.as_deref() {
            Some(id) => {
                let factory = plugins.resolve_filter_factory(id)?;
                Some(factory.create(&configuration)?)
            }
            None => None,
        };

        let shared = configuration
            .shared_authenticators
            .iter()
            .map(|id| plugins.resolve_authenticator(id))
            .collect::<Result<Vec<_>, _>>()?;
        let typed = configuration
            .authenticators
            .iter()
            .map(|id| plugins.resolve_authenticator(id))
            .collect::<Result<Vec<_>, _>>()?;
        let authenticators = AuthenticatorChain::new(shared, typed)?;

        let information = ServerInformation::new(&configuration);
        let (shutdown_tx, _) = watch::channel(false);
        let registry = ConnectionRegistry::new(configuration.connection_limit);
        let maintenance_interval_ms = configuration.maintenance_interval_ms;

        let server = Server {
            inner: Arc::new(ServerInner {
                configuration,
                information,
                handler,
                registry,
                authenticators,
                filter,
                auxiliary_servers: StdMutex::new(Vec::new()),
                maintenance: OnceLock::new(),
                metrics: ServerMetrics::new(),
                request_counter: RequestCounter::new(),
                shutting_down: AtomicBool::new(false),
                shutdown_tx,
                shutdown_listeners: StdMutex::new(Vec::new()),
            }),
        };

        let weak = Arc::downgrade(&server.inner);
        let scheduler = MaintenanceScheduler::start(maintenance_interval_ms, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        Server { inner }.maintain().await;
                        true
                    }
                    None => false,
                }
            }
        });
        // cannot fail, the scheduler is set exactly once per server
        let _ = server.inner.maintenance.set(scheduler);

        server.start_auxiliary_servers(plugins).await?;

        info!(
            "{} (id {}) started on port {}",
            server.inner.information.server_name,
            server.inner.information.server_id,
            server.inner.information.port
        );

        Ok(server)
    }

    async fn start_auxiliary_servers(
        &self,
        plugins: &PluginRegistry<H>,
    ) -> Result<(), ServerError> {
        let ids = self.inner.configuration.auxiliary_servers.clone();
        for id in ids {
            match self.start_auxiliary_server(&id, plugins).await {
                Ok(auxiliary) => {
                    info!("Auxiliary server started: {}", auxiliary.information());
                    self.inner.auxiliary_servers.lock().unwrap().push(auxiliary);
                }
                Err(e) => {
                    error!("Starting auxiliary server '{}': {}", id, e);
                    self.shutdown().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Starts a single auxiliary server on a dedicated task, blocking until
    /// that start completes or fails.
    async fn start_auxiliary_server(
        &self,
        id: &str,
        plugins: &PluginRegistry<H>,
    ) -> Result<Arc<dyn AuxiliaryServer>, ServerError> {
        let factory = plugins.resolve_auxiliary_factory(id)?;
        let auxiliary = factory.create(self)?;
        let worker = tokio::spawn({
            let auxiliary = auxiliary.clone();
            async move { auxiliary.start().await }
        });
        worker
            .await
            .map_err(|e| ServerError::Connection(format!("Auxiliary server start aborted: {e}")))??;

        Ok(auxiliary)
    }

    /// Establishes a connection for the given request, or returns the
    /// existing one when the client is already connected with matching
    /// credentials.
    pub async fn connect(&self, request: ConnectionRequest) -> Result<H::Handle, ServerError> {
        self.connect_from(request, None).await
    }

    /// Like [`Server::connect`], with the caller address supplied by the
    /// transport for client host resolution.
    #[instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn connect_from(
        &self,
        request: ConnectionRequest,
        transport_host: Option<IpAddr>,
    ) -> Result<H::Handle, ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        request.validate()?;

        // Critical section: the existing-connection check and the capacity
        // check must be atomic with respect to each other and to concurrent
        // disconnects.
        let _section = self.inner.registry.connect_section().await;

        if let Some(existing) = self.inner.registry.get(request.client_id) {
            if !existing.client.user().credentials_match(&request.user) {
                return Err(ServerError::AuthenticationFailed(
                    "Wrong username or password".into(),
                ));
            }
            debug!("Active connection exists for {}", existing.client);
            return Ok(existing.handle);
        }

        if self.inner.registry.at_capacity() {
            return Err(ServerError::ConnectionNotAvailable);
        }

        debug!(
            "No active connection found for client {}, establishing a new connection",
            request.client_id
        );
        let client_host = request
            .parameters
            .get(CLIENT_HOST_PARAMETER)
            .cloned()
            .or_else(|| transport_host.map(|host| host.to_string()))
            .unwrap_or_else(|| UNKNOWN_HOST.to_string());
        let client = RemoteClient::from_request(request).with_client_host(client_host);
        let client = self.inner.authenticators.login(client).await?;
        let handle = self.inner.handler.establish_connection(&client).await?;
        info!("{} connected", client);
        self.inner
            .registry
            .insert(ClientConnection::new(client, handle.clone()));
        self.inner
            .metrics
            .connections
            .set(self.inner.registry.count() as i64);

        Ok(handle)
    }

    /// Disconnects the given client. Unknown ids are a no-op; disconnecting
    /// twice is safe.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, client_id: Uuid) {
        if let Some(connection) = self.inner.registry.remove(client_id) {
            if let Err(e) = self
                .inner
                .handler
                .release_connection(connection.handle)
                .await
            {
                // disconnect must always free registry resources
                error!(
                    "Error while releasing connection for {}: {}",
                    connection.client, e
                );
            }
            self.inner.authenticators.logout(&connection.client).await;
            self.inner
                .metrics
                .connections
                .set(self.inner.registry.count() as i64);
            debug!("Client disconnected {}", connection.client);
        }
    }

    /// Shuts this server down: stops the maintenance scheduler, signals the
    /// transport listeners, disconnects every remaining client, closes the
    /// authenticators, stops the auxiliary servers, flushes the
    /// serialization filter and notifies shutdown listeners. Single-shot;
    /// repeated calls are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} shutting down", self.inner.information.server_name);
        if let Some(maintenance) = self.inner.maintenance.get() {
            maintenance.stop();
        }
        let _ = self.inner.shutdown_tx.send(true);
        for client_id in self.inner.registry.client_ids() {
            self.disconnect(client_id).await;
        }
        self.inner.authenticators.close().await;
        let auxiliary_servers: Vec<_> = self
            .inner
            .auxiliary_servers
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for auxiliary in auxiliary_servers {
            if let Err(e) = auxiliary.stop().await {
                error!(
                    "Error while stopping auxiliary server {}: {}",
                    auxiliary.information(),
                    e
                );
            }
        }
        if let Some(filter) = &self.inner.filter {
            if let Err(e) = filter.flush() {
                error!("Error while flushing serialization filter: {}", e);
            }
        }
        let listeners: Vec<_> = self
            .inner
            .shutdown_listeners
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for listener in listeners {
            listener();
        }
    }

    /// Registers a listener notified once shutdown has completed.
    pub fn on_shutdown(&self, listener: impl FnOnce() + Send + 'static) {
        self.inner
            .shutdown_listeners
            .lock()
            .unwrap()
            .push(Box::new(listener));
    }

    /// A receiver that flips to `true` when shutdown is initiated; used by
    /// the transport accept loops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> &ServerConfiguration {
        &self.inner.configuration
    }

    pub fn server_information(&self) -> &ServerInformation {
        &self.inner.information
    }

    /// The number of requests processed per second, used by locator
    /// ranking.
    pub fn server_load(&self) -> u64 {
        self.inner.request_counter.requests_per_second()
    }

    /// Counts one processed remote call. Invoked by the transport layer.
    pub fn count_request(&self) {
        self.inner.request_counter.count();
        self.inner.metrics.requests.inc();
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn connection_limit(&self) -> i32 {
        self.inner.registry.limit()
    }

    pub fn set_connection_limit(&self, limit: i32) {
        info!("Connection limit set to {}", limit);
        self.inner.registry.set_limit(limit);
    }

    pub fn connections_available(&self) -> bool {
        !self.inner.registry.at_capacity()
    }

    /// The connection handle for the given client, if connected.
    pub fn connection(&self, client_id: Uuid) -> Option<H::Handle> {
        self.inner.registry.get(client_id).map(|c| c.handle)
    }

    /// A snapshot of all current connections.
    pub fn connections(&self) -> Vec<ClientConnection<H::Handle>> {
        self.inner.registry.snapshot()
    }

    /// Copies of all connected clients. Password material is NOT cleared
    /// here; reporting boundaries use [`RemoteClient::censored`].
    pub fn clients(&self) -> Vec<RemoteClient> {
        self.inner.registry.clients()
    }

    pub fn maintenance_interval_ms(&self) -> u64 {
        self.inner
            .maintenance
            .get()
            .map(|m| m.interval_ms())
            .unwrap_or(self.inner.configuration.maintenance_interval_ms)
    }

    pub fn set_maintenance_interval_ms(&self, interval_ms: u64) {
        if let Some(maintenance) = self.inner.maintenance.get() {
            maintenance.set_interval_ms(interval_ms);
        }
    }

    /// Whether the maintenance scheduler has been stopped. Only ever true
    /// after shutdown.
    pub fn maintenance_stopped(&self) -> bool {
        self.inner
            .maintenance
            .get()
            .map(|m| m.is_stopped())
            .unwrap_or(false)
    }

    /// The active deserialization filter, consulted by the transport before
    /// payload deserialization. Installed once at construction, never
    /// changes for the server lifetime.
    pub fn filter(&self) -> Option<&Arc<dyn DeserializationFilter>> {
        self.inner.filter.as_ref()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.inner.metrics
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    /// Validates the given credentials against the configured admin user.
    pub fn authorize_admin(&self, user: &User) -> Result<(), ServerError> {
        match &self.inner.configuration.admin_user {
            Some(admin) if admin.credentials_match(user) => Ok(()),
            Some(_) => Err(ServerError::AuthenticationFailed(
                "Wrong username or password".into(),
            )),
            None => Err(ServerError::AuthenticationFailed(
                "No admin user configured".into(),
            )),
        }
    }

    async fn maintain(&self) {
        if self.inner.registry.count() == 0 {
            return;
        }
        let snapshot = self.inner.registry.snapshot();
        if let Err(e) = self.inner.handler.prune_connections(self, snapshot).await {
            error!("Exception while maintaining connections: {}", e);
        }
    }
}
