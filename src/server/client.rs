use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::ServerError;

/// Sentinel host value used when the transport cannot supply a caller address.
pub const UNKNOWN_HOST: &str = "unknown host";

/// Request parameter key carrying an explicit client host.
pub const CLIENT_HOST_PARAMETER: &str = "clientHost";

/// User credentials presented with a connection request.
///
/// Username comparison is case-insensitive, password comparison is
/// byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parses a `username:password` string, as used for the admin user
    /// configuration value.
    pub fn parse(value: &str) -> Result<Self, ServerError> {
        match value.split_once(':') {
            Some((username, password)) if !username.is_empty() => {
                Ok(Self::new(username, password))
            }
            _ => Err(ServerError::Configuration(format!(
                "Expected 'username:password', got '{value}'"
            ))),
        }
    }

    /// Checks whether the presented credentials match these.
    pub fn credentials_match(&self, presented: &User) -> bool {
        self.username.eq_ignore_ascii_case(&presented.username)
            && self.password.as_bytes() == presented.password.as_bytes()
    }

    /// Returns a copy with the password cleared, safe to hand out for
    /// reporting. The original is never touched.
    pub fn censored(&self) -> User {
        User {
            username: self.username.clone(),
            password: String::new(),
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username)
    }
}

/// A client's request to connect to the server.
///
/// Immutable once received. Identity is based solely on the client id, so
/// re-submitting the same request identifies the same logical client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub user: User,
    pub client_id: Uuid,
    pub client_type: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ConnectionRequest {
    pub fn new(user: User, client_id: Uuid, client_type: impl Into<String>) -> Self {
        Self {
            user,
            client_id,
            client_type: client_type.into(),
            locale: String::new(),
            timezone: String::new(),
            version: None,
            parameters: HashMap::new(),
        }
    }

    /// Adds a request parameter, builder style.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Validates that the mandatory fields are present.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.user.username.is_empty() {
            return Err(ServerError::InvalidRequest("user is required".into()));
        }
        if self.client_id.is_nil() {
            return Err(ServerError::InvalidRequest("client id is required".into()));
        }
        if self.client_type.is_empty() {
            return Err(ServerError::InvalidRequest("client type is required".into()));
        }

        Ok(())
    }
}

impl PartialEq for ConnectionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
    }
}

impl Eq for ConnectionRequest {}

/// A vetted remote client, derived from a [`ConnectionRequest`] by the
/// authenticator chain.
///
/// The database user may differ from the login user when an authenticator
/// substitutes it; in that case a new `RemoteClient` replaces the old one,
/// the instance itself is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteClient {
    pub request: ConnectionRequest,
    pub database_user: User,
    pub client_host: String,
    pub created_at: SystemTime,
}

impl RemoteClient {
    /// Creates a client from a request; the database user starts out as the
    /// login user.
    pub fn from_request(request: ConnectionRequest) -> Self {
        let database_user = request.user.clone();
        Self {
            request,
            database_user,
            client_host: UNKNOWN_HOST.to_string(),
            created_at: SystemTime::now(),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.request.client_id
    }

    pub fn client_type(&self) -> &str {
        &self.request.client_type
    }

    pub fn user(&self) -> &User {
        &self.request.user
    }

    /// Returns a copy with the given database user substituted.
    pub fn with_database_user(&self, database_user: User) -> Self {
        Self {
            request: self.request.clone(),
            database_user,
            client_host: self.client_host.clone(),
            created_at: self.created_at,
        }
    }

    /// Returns a copy with the given client host resolved.
    pub fn with_client_host(&self, client_host: impl Into<String>) -> Self {
        Self {
            request: self.request.clone(),
            database_user: self.database_user.clone(),
            client_host: client_host.into(),
            created_at: self.created_at,
        }
    }

    /// Returns a deep copy with all password material cleared, safe to leave
    /// the server's control. Live registry entries are never cleared in
    /// place.
    pub fn censored(&self) -> RemoteClient {
        let mut request = self.request.clone();
        request.user = request.user.censored();
        Self {
            request,
            database_user: self.database_user.censored(),
            client_host: self.client_host.clone(),
            created_at: self.created_at,
        }
    }
}

impl PartialEq for RemoteClient {
    fn eq(&self, other: &Self) -> bool {
        self.request == other.request
    }
}

impl Eq for RemoteClient {}

impl fmt::Display for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{}] ({})",
            self.request.user.username,
            self.client_host,
            self.request.client_type,
            self.request.client_id
        )
    }
}

/// A (client, connection handle) pair, owned exclusively by the connection
/// registry.
#[derive(Debug, Clone)]
pub struct ClientConnection<H> {
    pub client: RemoteClient,
    pub handle: H,
}

impl<H> ClientConnection<H> {
    pub fn new(client: RemoteClient, handle: H) -> Self {
        Self { client, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_match_is_case_insensitive_on_username() {
        let registered = User::new("Scott", "tiger");
        assert!(registered.credentials_match(&User::new("scott", "tiger")));
        assert!(!registered.credentials_match(&User::new("scott", "Tiger")));
        assert!(!registered.credentials_match(&User::new("scot", "tiger")));
    }

    #[test]
    fn censored_clears_copies_only() {
        let client = RemoteClient::from_request(ConnectionRequest::new(
            User::new("scott", "tiger"),
            Uuid::new_v4(),
            "unit-test",
        ));
        let censored = client.censored();
        assert!(censored.request.user.password.is_empty());
        assert!(censored.database_user.password.is_empty());
        assert_eq!(client.request.user.password, "tiger");
        assert_eq!(client.database_user.password, "tiger");
    }

    #[test]
    fn identity_follows_the_request() {
        let id = Uuid::new_v4();
        let a = RemoteClient::from_request(ConnectionRequest::new(
            User::new("scott", "tiger"),
            id,
            "unit-test",
        ));
        let b = a.with_database_user(User::new("app", "secret"));
        assert_eq!(a, b);
        assert_eq!(b.database_user.username, "app");
        assert_eq!(a.database_user.username, "scott");
    }

    #[test]
    fn parse_admin_user() {
        let user = User::parse("admin:changeme").unwrap();
        assert_eq!(user.username, "admin");
        assert_eq!(user.password, "changeme");
        assert!(User::parse("nopassword").is_err());
    }
}
