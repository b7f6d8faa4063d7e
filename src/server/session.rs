use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::server::client::{ClientConnection, RemoteClient};
use crate::server::core::{ConnectionHandler, Server};
use crate::utils::error::ServerError;

/// The handle returned to a connected client, referencing its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub connection_id: Uuid,
}

struct Session {
    /// Timestamp of the session's last activity.
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }
}

/// The session-backed [`ConnectionHandler`] used by the server binary.
///
/// Tracks per-connection activity; the pruning pass disconnects sessions
/// that have been idle past the configured timeout.
pub struct SessionService {
    sessions: DashMap<Uuid, Session>,
    idle_timeout: Duration,
}

impl SessionService {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Marks activity on the given session. Invoked by the transport for
    /// every processed call.
    pub fn touch(&self, connection_id: Uuid) {
        if let Some(session) = self.sessions.get(&connection_id) {
            session.touch();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn timed_out(&self, connection_id: Uuid) -> bool {
        match self.sessions.get(&connection_id) {
            Some(session) => session.idle_for() > self.idle_timeout,
            // no session backing the connection, nothing left to keep alive
            None => true,
        }
    }
}

#[async_trait]
impl ConnectionHandler for SessionService {
    type Handle = ServiceHandle;

    async fn establish_connection(
        &self,
        client: &RemoteClient,
    ) -> Result<Self::Handle, ServerError> {
        let connection_id = client.client_id();
        self.sessions.insert(connection_id, Session::new());

        Ok(ServiceHandle { connection_id })
    }

    async fn release_connection(&self, handle: Self::Handle) -> Result<(), ServerError> {
        self.sessions.remove(&handle.connection_id);

        Ok(())
    }

    async fn register_activity(&self, handle: &Self::Handle) {
        self.touch(handle.connection_id);
    }

    async fn prune_connections(
        &self,
        server: &Server<Self>,
        snapshot: Vec<ClientConnection<Self::Handle>>,
    ) -> Result<(), ServerError> {
        for connection in snapshot {
            let client_id = connection.client.client_id();
            if self.timed_out(connection.handle.connection_id) {
                debug!("Removing idle connection {}", connection.client);
                server.disconnect(client_id).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::{ConnectionRequest, User};

    #[tokio::test]
    async fn establish_and_release_track_sessions() {
        let service = SessionService::new(Duration::from_secs(60));
        let client = RemoteClient::from_request(ConnectionRequest::new(
            User::new("scott", "tiger"),
            Uuid::new_v4(),
            "unit-test",
        ));
        let handle = service.establish_connection(&client).await.unwrap();
        assert_eq!(service.session_count(), 1);
        assert!(!service.timed_out(handle.connection_id));
        service.release_connection(handle.clone()).await.unwrap();
        assert_eq!(service.session_count(), 0);
        assert!(service.timed_out(handle.connection_id));
    }

    #[tokio::test]
    async fn idle_sessions_time_out() {
        let service = SessionService::new(Duration::from_millis(10));
        let client = RemoteClient::from_request(ConnectionRequest::new(
            User::new("scott", "tiger"),
            Uuid::new_v4(),
            "unit-test",
        ));
        let handle = service.establish_connection(&client).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.timed_out(handle.connection_id));
        service.touch(handle.connection_id);
        assert!(!service.timed_out(handle.connection_id));
    }
}
