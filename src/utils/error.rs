use thiserror::Error;

/// Represents the errors that can occur in the connection server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The connection limit has been reached.
    ///
    /// An expected operational condition: the caller may retry with backoff
    /// once capacity frees up. Never logged as an error.
    #[error("Connection not available")]
    ConnectionNotAvailable,

    /// An authenticator rejected the connection request.
    ///
    /// Surfaced verbatim to the caller and never retried automatically.
    #[error("Login failed: {0}")]
    LoginFailed(String),

    /// Presented credentials do not match the registered ones.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A mandatory request field is missing.
    ///
    /// A programmer error on the client side; fails fast with no partial
    /// state created.
    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),

    /// A connect was attempted after shutdown had been initiated.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// The server configuration is invalid or a required plugin is missing.
    ///
    /// Always fatal at startup, never recovered.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An inbound payload was rejected by the deserialization filter.
    ///
    /// Logged at the point of rejection and propagated as a transport-level
    /// fault to the caller.
    #[error("Deserialization rejected: {0}")]
    DeserializationRejected(String),

    /// Represents a general connection/transport error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Indicates a failure in serializing or deserializing wire data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Implements conversion from `serde_json::Error` to `ServerError`.
///
/// This allows serialization errors to be automatically converted into
/// `ServerError::Serialization`.
impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}

impl ServerError {
    /// Stable error code used in wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::ConnectionNotAvailable => "connection_not_available",
            ServerError::LoginFailed(_) => "login_failed",
            ServerError::AuthenticationFailed(_) => "authentication_failed",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::ShuttingDown => "server_shutting_down",
            ServerError::Configuration(_) => "configuration_error",
            ServerError::DeserializationRejected(_) => "deserialization_rejected",
            ServerError::Connection(_) => "connection_error",
            ServerError::Serialization(_) => "serialization_error",
            ServerError::Io(_) => "io_error",
        }
    }
}
