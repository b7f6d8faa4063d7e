use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::server::client::RemoteClient;
use crate::utils::error::ServerError;

/// A pluggable authenticator, applied during connect.
///
/// An authenticator vets a [`RemoteClient`] and may transform it, typically
/// by substituting the database user. Authenticators without a client type
/// are *shared* and apply to every connection; an authenticator with a
/// client type applies only to requests bearing that type and runs after
/// all shared ones.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The client type this authenticator applies to, `None` meaning all.
    fn client_type(&self) -> Option<&str> {
        None
    }

    /// Vets the given client, returning the (possibly transformed) client
    /// to continue the chain with.
    ///
    /// # Errors
    /// Returns `ServerError::LoginFailed` to reject the connection,
    /// aborting the whole chain.
    async fn login(&self, client: RemoteClient) -> Result<RemoteClient, ServerError>;

    /// Notified when the given client disconnects.
    async fn logout(&self, _client: &RemoteClient) {}

    /// Releases any resources held, called exactly once on server shutdown.
    async fn close(&self) -> Result<(), ServerError> {
        Ok(())
    }
}

/// The ordered set of shared and client-type-specific authenticators.
///
/// Shared authenticators run first, in registration order, each receiving
/// the client produced by the previous step; the type-specific one, when
/// registered for the request's client type, runs last. The first failure
/// aborts the chain and discards all accumulated client transformations;
/// nothing is persisted unless the whole chain succeeds.
pub struct AuthenticatorChain {
    shared: Vec<Arc<dyn Authenticator>>,
    typed: HashMap<String, Arc<dyn Authenticator>>,
}

impl AuthenticatorChain {
    pub fn new(
        shared: Vec<Arc<dyn Authenticator>>,
        typed_authenticators: Vec<Arc<dyn Authenticator>>,
    ) -> Result<Self, ServerError> {
        let mut typed = HashMap::new();
        for authenticator in typed_authenticators {
            let client_type = authenticator.client_type().ok_or_else(|| {
                ServerError::Configuration(
                    "A client-type authenticator must declare its client type".into(),
                )
            })?;
            if typed
                .insert(client_type.to_string(), authenticator.clone())
                .is_some()
            {
                return Err(ServerError::Configuration(format!(
                    "Duplicate authenticator for client type '{client_type}'"
                )));
            }
        }

        Ok(Self { shared, typed })
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.typed.is_empty()
    }

    /// Runs the chain for the given client.
    pub async fn login(&self, mut client: RemoteClient) -> Result<RemoteClient, ServerError> {
        for authenticator in &self.shared {
            client = authenticator.login(client).await?;
        }
        if let Some(authenticator) = self.typed.get(client.client_type()) {
            debug!("Running {} authenticator for {}", client.client_type(), client);
            client = authenticator.login(client).await?;
        }

        Ok(client)
    }

    /// Notifies every applicable authenticator of a disconnect, shared ones
    /// first.
    pub async fn logout(&self, client: &RemoteClient) {
        for authenticator in &self.shared {
            authenticator.logout(client).await;
        }
        if let Some(authenticator) = self.typed.get(client.client_type()) {
            authenticator.logout(client).await;
        }
    }

    /// Closes every authenticator, shared ones first. Failures are logged,
    /// never escalated.
    pub async fn close(&self) {
        for authenticator in &self.shared {
            if let Err(e) = authenticator.close().await {
                error!("Error while closing authenticator: {}", e);
            }
        }
        for (client_type, authenticator) in &self.typed {
            if let Err(e) = authenticator.close().await {
                error!(
                    "Error while closing authenticator for client type '{}': {}",
                    client_type, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::{ConnectionRequest, User};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Renaming {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Authenticator for Renaming {
        async fn login(&self, client: RemoteClient) -> Result<RemoteClient, ServerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(client.with_database_user(User::new(self.name, "")))
        }
    }

    struct Failing;

    #[async_trait]
    impl Authenticator for Failing {
        async fn login(&self, _client: RemoteClient) -> Result<RemoteClient, ServerError> {
            Err(ServerError::LoginFailed("computer says no".into()))
        }
    }

    fn test_client() -> RemoteClient {
        RemoteClient::from_request(ConnectionRequest::new(
            User::new("scott", "tiger"),
            Uuid::new_v4(),
            "unit-test",
        ))
    }

    #[tokio::test]
    async fn shared_authenticators_run_in_registration_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = AuthenticatorChain::new(
            vec![
                Arc::new(Renaming { name: "first", calls: calls.clone() }),
                Arc::new(Renaming { name: "second", calls: calls.clone() }),
            ],
            Vec::new(),
        )
        .unwrap();
        let client = chain.login(test_client()).await.unwrap();
        assert_eq!(client.database_user.username, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_short_circuits_the_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = AuthenticatorChain::new(
            vec![
                Arc::new(Failing),
                Arc::new(Renaming { name: "never", calls: calls.clone() }),
            ],
            Vec::new(),
        )
        .unwrap();
        assert!(matches!(
            chain.login(test_client()).await,
            Err(ServerError::LoginFailed(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn typed_authenticator_requires_a_client_type() {
        let result = AuthenticatorChain::new(
            Vec::new(),
            vec![Arc::new(Renaming {
                name: "typed",
                calls: Arc::new(AtomicUsize::new(0)),
            })],
        );
        assert!(matches!(result, Err(ServerError::Configuration(_))));
    }
}
