use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tracing::{error, info};
use uuid::Uuid;

use crate::server::client::{RemoteClient, User};
use crate::server::core::{ConnectionHandler, Server, ServerInformation};

/// Capacity of the garbage collection event ring buffer.
const GC_EVENT_CAPACITY: usize = 100;

/// A single garbage collection event reported by the runtime metrics
/// provider.
#[derive(Debug, Clone, Serialize)]
pub struct GcEvent {
    pub timestamp_ms: u64,
    pub collector_name: String,
    pub duration_ms: u64,
}

/// Thread counts grouped by state.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadStatistics {
    pub thread_count: usize,
    pub states: BTreeMap<String, usize>,
}

/// Memory figures reported by the runtime metrics provider: process
/// resident memory, system used memory and system total memory.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryUsage {
    pub used: u64,
    pub allocated: u64,
    pub maximum: u64,
}

/// Pluggable source of runtime telemetry consumed by the admin interface.
pub trait RuntimeMetricsProvider: Send + Sync {
    fn memory_usage(&self) -> MemoryUsage;
    fn system_cpu_load(&self) -> f64;
    fn process_cpu_load(&self) -> f64;
    fn thread_statistics(&self) -> ThreadStatistics;

    /// Garbage collection events observed since the previous poll. The
    /// default runtime has none.
    fn poll_gc_events(&self) -> Vec<GcEvent> {
        Vec::new()
    }
}

/// The default [`RuntimeMetricsProvider`], backed by sysinfo.
pub struct SystemMetricsProvider {
    system: StdMutex<System>,
}

impl SystemMetricsProvider {
    pub fn new() -> Self {
        Self {
            system: StdMutex::new(System::new_all()),
        }
    }

    fn own_pid() -> Pid {
        Pid::from_u32(std::process::id())
    }
}

impl Default for SystemMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetricsProvider for SystemMetricsProvider {
    fn memory_usage(&self) -> MemoryUsage {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.refresh_processes();
        let used = system
            .process(Self::own_pid())
            .map(|process| process.memory())
            .unwrap_or(0);

        MemoryUsage {
            used,
            allocated: system.used_memory(),
            maximum: system.total_memory(),
        }
    }

    fn system_cpu_load(&self) -> f64 {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu();

        f64::from(system.global_cpu_info().cpu_usage()) / 100.0
    }

    fn process_cpu_load(&self) -> f64 {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes();

        system
            .process(Self::own_pid())
            .map(|process| f64::from(process.cpu_usage()) / 100.0)
            .unwrap_or(0.0)
    }

    fn thread_statistics(&self) -> ThreadStatistics {
        let states = thread_states();

        ThreadStatistics {
            thread_count: states.values().sum(),
            states,
        }
    }
}

#[cfg(target_os = "linux")]
fn thread_states() -> BTreeMap<String, usize> {
    let mut states = BTreeMap::new();
    if let Ok(tasks) = std::fs::read_dir("/proc/self/task") {
        for task in tasks.flatten() {
            if let Ok(stat) = std::fs::read_to_string(task.path().join("stat")) {
                // the state field follows the parenthesised command name
                if let Some(after_comm) = stat.rsplit(')').next() {
                    if let Some(state) = after_comm.trim().chars().next() {
                        *states.entry(state.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    states
}

#[cfg(not(target_os = "linux"))]
fn thread_states() -> BTreeMap<String, usize> {
    BTreeMap::new()
}

/// An aggregate statistics record, mirroring what the monitoring tools
/// poll in one round trip.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatistics {
    pub timestamp_ms: u64,
    pub connection_count: usize,
    pub connection_limit: i32,
    pub connections_available: bool,
    pub requests_per_second: u64,
    pub memory_usage: MemoryUsage,
    pub system_cpu_load: f64,
    pub process_cpu_load: f64,
    pub thread_statistics: ThreadStatistics,
    pub gc_events: Vec<GcEvent>,
}

/// Read-only operational façade over a [`Server`], plus limited mutation.
///
/// All mutations are forwarded to server core methods, never applied to
/// internal state directly, so the admin interface can never bypass the
/// core's invariants. Password material is cleared from every client or
/// user copy before it leaves this interface.
pub struct ServerAdmin<H: ConnectionHandler> {
    server: Server<H>,
    provider: Arc<dyn RuntimeMetricsProvider>,
    gc_events: StdMutex<VecDeque<GcEvent>>,
}

impl<H: ConnectionHandler> ServerAdmin<H> {
    pub fn new(server: Server<H>, provider: Arc<dyn RuntimeMetricsProvider>) -> Self {
        Self {
            server,
            provider,
            gc_events: StdMutex::new(VecDeque::with_capacity(GC_EVENT_CAPACITY)),
        }
    }

    pub fn server(&self) -> &Server<H> {
        &self.server
    }

    pub fn server_information(&self) -> &ServerInformation {
        self.server.server_information()
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn connection_limit(&self) -> i32 {
        self.server.connection_limit()
    }

    pub fn set_connection_limit(&self, limit: i32) {
        info!("set_connection_limit({})", limit);
        self.server.set_connection_limit(limit);
    }

    pub fn connections_available(&self) -> bool {
        self.server.connections_available()
    }

    pub fn maintenance_interval_ms(&self) -> u64 {
        self.server.maintenance_interval_ms()
    }

    pub fn set_maintenance_interval_ms(&self, interval_ms: u64) {
        info!("set_maintenance_interval_ms({})", interval_ms);
        self.server.set_maintenance_interval_ms(interval_ms);
    }

    /// Copies of all connected clients, password material cleared.
    pub fn clients(&self) -> Vec<RemoteClient> {
        self.server
            .clients()
            .iter()
            .map(RemoteClient::censored)
            .collect()
    }

    /// The distinct connected users, password material cleared.
    pub fn users(&self) -> Vec<User> {
        let mut seen = HashSet::new();
        self.server
            .clients()
            .iter()
            .filter(|client| seen.insert(client.user().username.to_ascii_lowercase()))
            .map(|client| client.user().censored())
            .collect()
    }

    /// The process environment, formatted one property per line;
    /// multi-valued path properties are split one entry per line.
    pub fn system_properties(&self) -> String {
        let mut properties: Vec<(String, String)> = std::env::vars().collect();
        properties.sort();
        let mut output = String::new();
        for (key, value) in properties {
            if key.contains("PATH") && value.contains(':') {
                output.push_str(&key);
                output.push_str(":\n");
                for entry in value.split(':') {
                    output.push_str("  ");
                    output.push_str(entry);
                    output.push('\n');
                }
            } else {
                output.push_str(&format!("{key}: {value}\n"));
            }
        }

        output
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.provider.memory_usage()
    }

    pub fn system_cpu_load(&self) -> f64 {
        self.provider.system_cpu_load()
    }

    pub fn process_cpu_load(&self) -> f64 {
        self.provider.process_cpu_load()
    }

    pub fn thread_statistics(&self) -> ThreadStatistics {
        self.provider.thread_statistics()
    }

    /// Garbage collection events with a timestamp at or after `since_ms`.
    /// A bounded ring buffer keeps the most recent events.
    pub fn gc_events(&self, since_ms: u64) -> Vec<GcEvent> {
        let mut events = self.gc_events.lock().unwrap();
        for event in self.provider.poll_gc_events() {
            if events.len() == GC_EVENT_CAPACITY {
                events.pop_front();
            }
            events.push_back(event);
        }

        events
            .iter()
            .filter(|event| event.timestamp_ms >= since_ms)
            .cloned()
            .collect()
    }

    pub fn server_load(&self) -> u64 {
        self.server.server_load()
    }

    /// The aggregate statistics record.
    pub fn statistics(&self, since_ms: u64) -> ServerStatistics {
        ServerStatistics {
            timestamp_ms: now_ms(),
            connection_count: self.connection_count(),
            connection_limit: self.connection_limit(),
            connections_available: self.connections_available(),
            requests_per_second: self.server_load(),
            memory_usage: self.memory_usage(),
            system_cpu_load: self.system_cpu_load(),
            process_cpu_load: self.process_cpu_load(),
            thread_statistics: self.thread_statistics(),
            gc_events: self.gc_events(since_ms),
        }
    }

    /// Disconnects the given client, forwarded to the server core.
    pub async fn disconnect(&self, client_id: Uuid) {
        info!("disconnect({})", client_id);
        self.server.disconnect(client_id).await;
    }

    /// Shuts the server down, forwarded to the server core.
    pub async fn shutdown(&self) {
        info!("shutdown()");
        self.server.shutdown().await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Starts the admin HTTP endpoint on the given port, serving until server
/// shutdown. Every route requires the configured admin credentials in the
/// `x-admin-username`/`x-admin-password` headers.
pub async fn serve_admin_http<H: ConnectionHandler>(admin: Arc<ServerAdmin<H>>, port: u16) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/information", get(information_handler))
        .route("/statistics", get(statistics_handler))
        .route("/clients", get(clients_handler))
        .route("/users", get(users_handler))
        .route("/system-properties", get(system_properties_handler))
        .route("/connection-limit", post(connection_limit_handler))
        .route("/maintenance-interval", post(maintenance_interval_handler))
        .route("/disconnect/:client_id", post(disconnect_handler))
        .route("/shutdown", post(shutdown_handler))
        .with_state(admin.clone());

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = match axum::Server::try_bind(&addr) {
        Ok(builder) => builder,
        Err(e) => {
            error!("Admin endpoint bind failed on port {}: {}", port, e);
            return;
        }
    };
    info!("Admin endpoint listening on port {}", port);
    let mut shutdown = admin.server().shutdown_signal();
    let serving = builder
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        });
    if let Err(e) = serving.await {
        error!("Admin endpoint error: {}", e);
    }
}

fn authorize<H: ConnectionHandler>(
    admin: &ServerAdmin<H>,
    headers: &HeaderMap,
) -> Result<(), StatusCode> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let user = User::new(header("x-admin-username"), header("x-admin-password"));
    admin
        .server()
        .authorize_admin(&user)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

#[derive(Debug, Deserialize)]
struct StatisticsQuery {
    since: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConnectionLimitRequest {
    limit: i32,
}

#[derive(Debug, Deserialize)]
struct MaintenanceIntervalRequest {
    interval_ms: u64,
}

async fn metrics_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<String, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(admin.server().metrics().expose())
}

async fn information_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<Json<ServerInformation>, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(Json(admin.server_information().clone()))
}

async fn statistics_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<ServerStatistics>, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(Json(admin.statistics(query.since.unwrap_or(0))))
}

async fn clients_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<Json<Vec<RemoteClient>>, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(Json(admin.clients()))
}

async fn users_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(Json(admin.users()))
}

async fn system_properties_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<String, StatusCode> {
    authorize(&admin, &headers)?;

    Ok(admin.system_properties())
}

async fn connection_limit_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
    Json(request): Json<ConnectionLimitRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&admin, &headers)?;
    admin.set_connection_limit(request.limit);

    Ok(StatusCode::NO_CONTENT)
}

async fn maintenance_interval_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
    Json(request): Json<MaintenanceIntervalRequest>,
) -> Result<StatusCode, StatusCode> {
    authorize(&admin, &headers)?;
    admin.set_maintenance_interval_ms(request.interval_ms);

    Ok(StatusCode::NO_CONTENT)
}

async fn disconnect_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
    Path(client_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    authorize(&admin, &headers)?;
    admin.disconnect(client_id).await;

    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown_handler<H: ConnectionHandler>(
    State(admin): State<Arc<ServerAdmin<H>>>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    authorize(&admin, &headers)?;
    admin.shutdown().await;

    Ok(StatusCode::NO_CONTENT)
}
