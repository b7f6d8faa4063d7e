use std::{fs, path::PathBuf, sync::Arc};

use config::Config;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig},
    TlsAcceptor,
};

use crate::server::client::User;
use crate::utils::error::ServerError;

/// Default connection maintenance interval, in milliseconds.
pub const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 30_000;

/// Default idle timeout after which the maintenance task prunes a
/// connection, in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120_000;

/// Configuration for the connection server.
///
/// Built once at startup, via [`ServerConfiguration::builder`] or
/// [`ServerConfiguration::from_env`], and never mutated after construction.
#[derive(Debug, Clone)]
pub struct ServerConfiguration {
    /// The name under which the server publishes itself.
    pub server_name: String,
    /// The port on which the main service listens.
    pub port: u16,
    /// The port for the locator endpoint, 0 to disable it.
    pub registry_port: u16,
    /// The port for the admin endpoint, 0 means not exposed.
    pub admin_port: u16,
    /// Whether TLS is enabled for the main listener.
    pub enable_tls: bool,
    /// Path to the TLS certificate file.
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub tls_key_path: PathBuf,
    /// Identifiers of auxiliary server factories to start alongside the
    /// main service.
    pub auxiliary_servers: Vec<String>,
    /// Identifier of the object input filter factory, if any.
    pub object_input_filter: Option<String>,
    /// When true, server construction fails unless an object input filter
    /// resolves.
    pub filter_required: bool,
    /// Pattern rules for the `pattern-filter` factory.
    pub filter_patterns: Option<String>,
    /// Allow-list location (file path or `classpath:` resource) for the
    /// `allowlist-filter` factory.
    pub filter_allowlist: Option<String>,
    /// Target file for the `dryrun-filter` factory.
    pub filter_dry_run_file: Option<PathBuf>,
    /// Connection maintenance interval in milliseconds.
    pub maintenance_interval_ms: u64,
    /// Maximum number of concurrent connections; negative means no limit,
    /// zero means the server accepts none.
    pub connection_limit: i32,
    /// Idle timeout used by the default pruning policy, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Identifiers of shared authenticators, applied to every client type
    /// in registration order.
    pub shared_authenticators: Vec<String>,
    /// Identifiers of client-type-specific authenticators.
    pub authenticators: Vec<String>,
    /// The admin user; admin access is refused when unset.
    pub admin_user: Option<User>,
    /// Server locale, reported through the server information record.
    pub locale: String,
    /// Server timezone, reported through the server information record.
    pub timezone: String,
}

/// Raw environment representation, deserialized by the `config` crate.
/// List-valued options arrive as comma-separated strings.
#[derive(Debug, Deserialize)]
struct RawConfiguration {
    server_name: Option<String>,
    port: u16,
    registry_port: Option<u16>,
    admin_port: Option<u16>,
    enable_tls: Option<bool>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    auxiliary_servers: Option<String>,
    object_input_filter: Option<String>,
    filter_required: Option<bool>,
    filter_patterns: Option<String>,
    filter_allowlist: Option<String>,
    filter_dry_run_file: Option<PathBuf>,
    maintenance_interval_ms: Option<u64>,
    connection_limit: Option<i32>,
    idle_timeout_ms: Option<u64>,
    shared_authenticators: Option<String>,
    authenticators: Option<String>,
    admin_user: Option<String>,
    locale: Option<String>,
    timezone: Option<String>,
}

impl ServerConfiguration {
    /// Creates a builder with the given listening port and defaults for
    /// everything else.
    pub fn builder(port: u16) -> ServerConfigurationBuilder {
        ServerConfigurationBuilder::new(port)
    }

    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables are prefixed with `RS_`, e.g. `RS_PORT`,
    /// `RS_CONNECTION_LIMIT`, `RS_OBJECT_INPUT_FILTER`.
    ///
    /// # Errors
    /// Returns a `ServerError::Configuration` if the configuration cannot
    /// be loaded.
    pub fn from_env() -> Result<Self, ServerError> {
        let raw: RawConfiguration = Config::builder()
            .add_source(config::Environment::with_prefix("RS").try_parsing(true))
            .build()
            .map_err(|e| ServerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let admin_user = raw.admin_user.as_deref().map(User::parse).transpose()?;

        let mut builder = ServerConfigurationBuilder::new(raw.port);
        if let Some(name) = raw.server_name {
            builder = builder.server_name(name);
        }
        builder = builder
            .registry_port(raw.registry_port.unwrap_or(0))
            .admin_port(raw.admin_port.unwrap_or(0))
            .enable_tls(raw.enable_tls.unwrap_or(false))
            .maintenance_interval_ms(
                raw.maintenance_interval_ms
                    .unwrap_or(DEFAULT_MAINTENANCE_INTERVAL_MS),
            )
            .connection_limit(raw.connection_limit.unwrap_or(-1))
            .idle_timeout_ms(raw.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS))
            .filter_required(raw.filter_required.unwrap_or(false))
            .auxiliary_servers(split_ids(raw.auxiliary_servers.as_deref()))
            .shared_authenticators(split_ids(raw.shared_authenticators.as_deref()))
            .authenticators(split_ids(raw.authenticators.as_deref()));
        if let Some(path) = raw.tls_cert_path {
            builder = builder.tls_cert_path(path);
        }
        if let Some(path) = raw.tls_key_path {
            builder = builder.tls_key_path(path);
        }
        if let Some(id) = raw.object_input_filter {
            builder = builder.object_input_filter(id);
        }
        if let Some(patterns) = raw.filter_patterns {
            builder = builder.filter_patterns(patterns);
        }
        if let Some(location) = raw.filter_allowlist {
            builder = builder.filter_allowlist(location);
        }
        if let Some(path) = raw.filter_dry_run_file {
            builder = builder.filter_dry_run_file(path);
        }
        if let Some(user) = admin_user {
            builder = builder.admin_user(user);
        }
        if let Some(locale) = raw.locale {
            builder = builder.locale(locale);
        }
        if let Some(timezone) = raw.timezone {
            builder = builder.timezone(timezone);
        }

        Ok(builder.build())
    }

    /// Validates the configuration settings.
    ///
    /// Ensures the server name is set, required TLS files exist when TLS is
    /// enabled, and that a filter identifier is present when one is
    /// required.
    ///
    /// # Errors
    /// Returns a `ServerError::Configuration` if validation fails.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server_name.is_empty() {
            return Err(ServerError::Configuration(
                "server_name must not be empty".into(),
            ));
        }

        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(ServerError::Configuration(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(ServerError::Configuration(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        if self.filter_required && self.object_input_filter.is_none() {
            return Err(ServerError::Configuration(
                "an object input filter is required but none is configured".into(),
            ));
        }

        Ok(())
    }

    /// Creates a TLS acceptor for the main listener.
    ///
    /// If TLS is disabled, returns `None`. Otherwise loads the certificate
    /// and private key and initializes a Rustls acceptor.
    ///
    /// # Errors
    /// Returns a `ServerError::Configuration` if any part of the TLS setup
    /// fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, ServerError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            ServerError::Configuration(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            ))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            ServerError::Configuration(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            ))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| ServerError::Configuration(format!("Cert parse error: {e}")))?;

        let mut keys = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| ServerError::Configuration(format!("Key parse error: {e}")))?;
        if keys.is_empty() {
            return Err(ServerError::Configuration(
                "No private key found in key file".into(),
            ));
        }

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(Certificate).collect(),
                PrivateKey(keys.remove(0)),
            )
            .map_err(|e| ServerError::Configuration(format!("TLS config error: {e}")))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}

fn split_ids(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Builder for [`ServerConfiguration`].
///
/// # Defaults
/// - Server name: `remote-server`
/// - Registry and admin ports: 0 (disabled)
/// - TLS: off
/// - Maintenance interval: 30 000 ms
/// - Connection limit: -1 (unlimited)
/// - Idle timeout: 120 000 ms
/// - No filter, no authenticators, no auxiliary servers, no admin user
#[derive(Debug)]
pub struct ServerConfigurationBuilder {
    configuration: ServerConfiguration,
}

impl ServerConfigurationBuilder {
    fn new(port: u16) -> Self {
        Self {
            configuration: ServerConfiguration {
                server_name: "remote-server".to_string(),
                port,
                registry_port: 0,
                admin_port: 0,
                enable_tls: false,
                tls_cert_path: PathBuf::new(),
                tls_key_path: PathBuf::new(),
                auxiliary_servers: Vec::new(),
                object_input_filter: None,
                filter_required: false,
                filter_patterns: None,
                filter_allowlist: None,
                filter_dry_run_file: None,
                maintenance_interval_ms: DEFAULT_MAINTENANCE_INTERVAL_MS,
                connection_limit: -1,
                idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
                shared_authenticators: Vec::new(),
                authenticators: Vec::new(),
                admin_user: None,
                locale: "en".to_string(),
                timezone: "UTC".to_string(),
            },
        }
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.configuration.server_name = name.into();
        self
    }

    pub fn registry_port(mut self, port: u16) -> Self {
        self.configuration.registry_port = port;
        self
    }

    pub fn admin_port(mut self, port: u16) -> Self {
        self.configuration.admin_port = port;
        self
    }

    pub fn enable_tls(mut self, enabled: bool) -> Self {
        self.configuration.enable_tls = enabled;
        self
    }

    pub fn tls_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration.tls_cert_path = path.into();
        self
    }

    pub fn tls_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration.tls_key_path = path.into();
        self
    }

    pub fn auxiliary_servers(mut self, ids: Vec<String>) -> Self {
        self.configuration.auxiliary_servers = ids;
        self
    }

    pub fn auxiliary_server(mut self, id: impl Into<String>) -> Self {
        self.configuration.auxiliary_servers.push(id.into());
        self
    }

    pub fn object_input_filter(mut self, id: impl Into<String>) -> Self {
        self.configuration.object_input_filter = Some(id.into());
        self
    }

    pub fn filter_required(mut self, required: bool) -> Self {
        self.configuration.filter_required = required;
        self
    }

    pub fn filter_patterns(mut self, patterns: impl Into<String>) -> Self {
        self.configuration.filter_patterns = Some(patterns.into());
        self
    }

    pub fn filter_allowlist(mut self, location: impl Into<String>) -> Self {
        self.configuration.filter_allowlist = Some(location.into());
        self
    }

    pub fn filter_dry_run_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.configuration.filter_dry_run_file = Some(path.into());
        self
    }

    pub fn maintenance_interval_ms(mut self, interval: u64) -> Self {
        self.configuration.maintenance_interval_ms = interval;
        self
    }

    pub fn connection_limit(mut self, limit: i32) -> Self {
        self.configuration.connection_limit = limit;
        self
    }

    pub fn idle_timeout_ms(mut self, timeout: u64) -> Self {
        self.configuration.idle_timeout_ms = timeout;
        self
    }

    pub fn shared_authenticators(mut self, ids: Vec<String>) -> Self {
        self.configuration.shared_authenticators = ids;
        self
    }

    pub fn shared_authenticator(mut self, id: impl Into<String>) -> Self {
        self.configuration.shared_authenticators.push(id.into());
        self
    }

    pub fn authenticators(mut self, ids: Vec<String>) -> Self {
        self.configuration.authenticators = ids;
        self
    }

    pub fn authenticator(mut self, id: impl Into<String>) -> Self {
        self.configuration.authenticators.push(id.into());
        self
    }

    pub fn admin_user(mut self, user: User) -> Self {
        self.configuration.admin_user = Some(user);
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.configuration.locale = locale.into();
        self
    }

    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.configuration.timezone = timezone.into();
        self
    }

    pub fn build(self) -> ServerConfiguration {
        self.configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let configuration = ServerConfiguration::builder(2222).build();
        assert_eq!(configuration.port, 2222);
        assert_eq!(configuration.connection_limit, -1);
        assert_eq!(
            configuration.maintenance_interval_ms,
            DEFAULT_MAINTENANCE_INTERVAL_MS
        );
        assert!(!configuration.enable_tls);
        assert!(configuration.validate().is_ok());
    }

    #[test]
    fn filter_required_without_filter_fails_validation() {
        let configuration = ServerConfiguration::builder(2222)
            .filter_required(true)
            .build();
        assert!(matches!(
            configuration.validate(),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn split_comma_separated_ids() {
        assert_eq!(
            split_ids(Some("locator, audit ,")),
            vec!["locator".to_string(), "audit".to_string()]
        );
        assert!(split_ids(None).is_empty());
    }
}
