use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message;
use uuid::Uuid;

use remote_server_rs::config::ServerConfiguration;
use remote_server_rs::server::{
    handler, Authenticator, ClientConnection, ConnectionHandler, ConnectionRequest,
    PluginRegistry, RemoteClient, Server, SessionService, TransportState, User,
};
use remote_server_rs::utils::error::ServerError;

struct TestHandler;

#[async_trait]
impl ConnectionHandler for TestHandler {
    type Handle = Uuid;

    async fn establish_connection(&self, client: &RemoteClient) -> Result<Uuid, ServerError> {
        Ok(client.client_id())
    }

    async fn release_connection(&self, _handle: Uuid) -> Result<(), ServerError> {
        Ok(())
    }

    async fn prune_connections(
        &self,
        _server: &Server<Self>,
        _snapshot: Vec<ClientConnection<Uuid>>,
    ) -> Result<(), ServerError> {
        Ok(())
    }
}

struct RecordingAuthenticator {
    name: &'static str,
    client_type: Option<&'static str>,
    fail: bool,
    log: Arc<StdMutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Authenticator for RecordingAuthenticator {
    fn client_type(&self) -> Option<&str> {
        self.client_type
    }

    async fn login(&self, client: RemoteClient) -> Result<RemoteClient, ServerError> {
        self.log.lock().unwrap().push(self.name.to_string());
        if self.fail {
            return Err(ServerError::LoginFailed(format!("{} says no", self.name)));
        }

        Ok(client)
    }

    async fn close(&self) -> Result<(), ServerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}

fn request(username: &str, password: &str, client_id: Uuid) -> ConnectionRequest {
    ConnectionRequest::new(User::new(username, password), client_id, "test-client")
}

async fn start_server(limit: i32) -> Server<TestHandler> {
    let configuration = ServerConfiguration::builder(0)
        .connection_limit(limit)
        .build();

    Server::start(configuration, TestHandler, &PluginRegistry::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn at_most_one_connection_per_client_id() {
    let server = start_server(-1).await;
    let shared_request = request("scott", "tiger", Uuid::new_v4());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let server = server.clone();
        let connect_request = shared_request.clone();
        tasks.push(tokio::spawn(
            async move { server.connect(connect_request).await },
        ));
    }

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(server.connection_count(), 1);
    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    server.shutdown().await;
}

#[tokio::test]
async fn capacity_is_enforced_and_limit_changes_apply_immediately() {
    let server = start_server(2).await;
    server
        .connect(request("u1", "p", Uuid::new_v4()))
        .await
        .unwrap();
    server
        .connect(request("u2", "p", Uuid::new_v4()))
        .await
        .unwrap();

    let rejected = server.connect(request("u3", "p", Uuid::new_v4())).await;
    assert!(matches!(rejected, Err(ServerError::ConnectionNotAvailable)));
    assert!(!server.connections_available());

    // lifting the limit permits new connects without disconnecting anyone
    server.set_connection_limit(-1);
    server
        .connect(request("u3", "p", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(server.connection_count(), 3);
    server.shutdown().await;
}

#[tokio::test]
async fn reconnect_is_idempotent_and_skips_the_authenticator_chain() {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    let mut plugins: PluginRegistry<TestHandler> = PluginRegistry::new();
    {
        let log = log.clone();
        let closes = closes.clone();
        plugins.register_authenticator("recording", move || {
            Arc::new(RecordingAuthenticator {
                name: "recording",
                client_type: None,
                fail: false,
                log: log.clone(),
                closes: closes.clone(),
            })
        });
    }
    let configuration = ServerConfiguration::builder(0)
        .shared_authenticator("recording")
        .build();
    let server = Server::start(configuration, TestHandler, &plugins)
        .await
        .unwrap();

    let connection_request = request("scott", "tiger", Uuid::new_v4());
    let first = server.connect(connection_request.clone()).await.unwrap();
    let second = server.connect(connection_request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(log.lock().unwrap().len(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn credential_mismatch_leaves_the_existing_connection_untouched() {
    let server = start_server(-1).await;
    let client_id = Uuid::new_v4();
    server
        .connect(request("scott", "tiger", client_id))
        .await
        .unwrap();

    let mismatch = server.connect(request("scott", "lion", client_id)).await;
    assert!(matches!(
        mismatch,
        Err(ServerError::AuthenticationFailed(_))
    ));
    assert_eq!(server.connection_count(), 1);
    let clients = server.clients();
    assert_eq!(clients[0].user().password, "tiger");

    // username matching is case-insensitive
    server
        .connect(request("SCOTT", "tiger", client_id))
        .await
        .unwrap();
    assert_eq!(server.connection_count(), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let server = start_server(-1).await;
    server.disconnect(Uuid::new_v4()).await;
    assert_eq!(server.connection_count(), 0);

    let client_id = Uuid::new_v4();
    server
        .connect(request("scott", "tiger", client_id))
        .await
        .unwrap();
    server.disconnect(client_id).await;
    server.disconnect(client_id).await;
    assert_eq!(server.connection_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn authenticators_run_shared_first_in_order_then_typed() {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let closes = Arc::new(AtomicUsize::new(0));
    let mut plugins: PluginRegistry<TestHandler> = PluginRegistry::new();
    for (id, client_type, fail) in [
        ("A", None, false),
        ("B", None, false),
        ("C", Some("test-client"), false),
        ("A-failing", None, true),
    ] {
        let log = log.clone();
        let closes = closes.clone();
        plugins.register_authenticator(id, move || {
            Arc::new(RecordingAuthenticator {
                name: id,
                client_type,
                fail,
                log: log.clone(),
                closes: closes.clone(),
            })
        });
    }

    let configuration = ServerConfiguration::builder(0)
        .shared_authenticator("A")
        .shared_authenticator("B")
        .authenticator("C")
        .build();
    let server = Server::start(configuration, TestHandler, &plugins)
        .await
        .unwrap();
    server
        .connect(request("scott", "tiger", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
    server.shutdown().await;

    // a failure in the first shared authenticator never invokes the rest
    log.lock().unwrap().clear();
    let configuration = ServerConfiguration::builder(0)
        .shared_authenticator("A-failing")
        .shared_authenticator("B")
        .authenticator("C")
        .build();
    let server = Server::start(configuration, TestHandler, &plugins)
        .await
        .unwrap();
    let rejected = server.connect(request("scott", "tiger", Uuid::new_v4())).await;
    assert!(matches!(rejected, Err(ServerError::LoginFailed(_))));
    assert_eq!(*log.lock().unwrap(), vec!["A-failing"]);
    assert_eq!(server.connection_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_complete_and_single_shot() {
    let closes = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(StdMutex::new(Vec::new()));
    let mut plugins: PluginRegistry<TestHandler> = PluginRegistry::new();
    {
        let log = log.clone();
        let closes = closes.clone();
        plugins.register_authenticator("recording", move || {
            Arc::new(RecordingAuthenticator {
                name: "recording",
                client_type: None,
                fail: false,
                log: log.clone(),
                closes: closes.clone(),
            })
        });
    }
    let configuration = ServerConfiguration::builder(0)
        .shared_authenticator("recording")
        .build();
    let server = Server::start(configuration, TestHandler, &plugins)
        .await
        .unwrap();

    server
        .connect(request("u1", "p", Uuid::new_v4()))
        .await
        .unwrap();
    server
        .connect(request("u2", "p", Uuid::new_v4()))
        .await
        .unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = notified.clone();
        server.on_shutdown(move || {
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }

    server.shutdown().await;
    assert!(server.maintenance_stopped());
    assert_eq!(server.connection_count(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // connects after shutdown fail as a login failure variant
    let refused = server.connect(request("u3", "p", Uuid::new_v4())).await;
    assert!(matches!(refused, Err(ServerError::ShuttingDown)));

    // second shutdown is a no-op
    server.shutdown().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dry_run_filter_flushes_on_shutdown() {
    let target = std::env::temp_dir().join(format!("observed-{}.txt", Uuid::new_v4()));
    let configuration = ServerConfiguration::builder(0)
        .object_input_filter("dryrun-filter")
        .filter_dry_run_file(&target)
        .build();
    let server = Server::start(
        configuration,
        TestHandler,
        &PluginRegistry::with_defaults(),
    )
    .await
    .unwrap();

    let filter = server.filter().unwrap();
    filter.check("com.acme.Y");
    filter.check("com.acme.X");
    filter.check("com.acme.X");
    server.shutdown().await;

    let written = std::fs::read_to_string(&target).unwrap();
    assert_eq!(written, "com.acme.X\ncom.acme.Y\n");
    std::fs::remove_file(&target).unwrap();
}

#[tokio::test]
async fn missing_filter_plugin_fails_startup() {
    let configuration = ServerConfiguration::builder(0)
        .object_input_filter("no-such-filter")
        .filter_required(true)
        .build();
    let result = Server::start(
        configuration,
        TestHandler,
        &PluginRegistry::with_defaults(),
    )
    .await;
    assert!(matches!(result, Err(ServerError::Configuration(_))));
}

#[tokio::test]
async fn idle_connections_are_pruned_by_the_maintenance_task() {
    let configuration = ServerConfiguration::builder(0)
        .maintenance_interval_ms(20)
        .build();
    let server = Server::start(
        configuration,
        SessionService::new(Duration::from_millis(10)),
        &PluginRegistry::new(),
    )
    .await
    .unwrap();

    server
        .connect(request("scott", "tiger", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(server.connection_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.connection_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn end_to_end_capacity_scenario() {
    let server = start_server(2).await;
    let u1 = Uuid::new_v4();
    server.connect(request("u1", "p", u1)).await.unwrap();
    server
        .connect(request("u2", "p", Uuid::new_v4()))
        .await
        .unwrap();

    let rejected = server.connect(request("u3", "p", Uuid::new_v4())).await;
    assert!(matches!(rejected, Err(ServerError::ConnectionNotAvailable)));

    server.disconnect(u1).await;
    server
        .connect(request("u3", "p", Uuid::new_v4()))
        .await
        .unwrap();

    let mut usernames: Vec<String> = server
        .clients()
        .iter()
        .map(|client| client.user().username.clone())
        .collect();
    usernames.sort();
    assert_eq!(usernames, vec!["u2", "u3"]);
    server.shutdown().await;
}

#[tokio::test]
async fn websocket_round_trip_with_filtering() {
    let configuration = ServerConfiguration::builder(0)
        .object_input_filter("allowlist-filter")
        .filter_allowlist("classpath:serialization-allowlist.txt")
        .build();
    let server = Server::start(
        configuration,
        SessionService::new(Duration::from_secs(60)),
        &PluginRegistry::with_defaults(),
    )
    .await
    .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(TransportState {
        server: server.clone(),
        tls_acceptor: None,
    });
    tokio::spawn(handler::serve(listener, state));

    let (ws_stream, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let (mut write, mut read) = ws_stream.split();

    let client_id = Uuid::new_v4();
    let connect_envelope = serde_json::json!({
        "class": "core.client.ConnectionRequest",
        "body": {
            "user": { "username": "scott", "password": "tiger" },
            "client_id": client_id,
            "client_type": "demo-client",
        }
    });
    write
        .send(Message::Text(connect_envelope.to_string()))
        .await
        .unwrap();
    let response: serde_json::Value = match read.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(response["type"], "Connected");
    assert_eq!(server.connection_count(), 1);

    let ping_envelope = serde_json::json!({
        "class": "core.Ping",
        "body": { "client_id": client_id }
    });
    write
        .send(Message::Text(ping_envelope.to_string()))
        .await
        .unwrap();
    let response: serde_json::Value = match read.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(response["type"], "Pong");

    let disconnect_envelope = serde_json::json!({
        "class": "core.client.Disconnect",
        "body": { "client_id": client_id }
    });
    write
        .send(Message::Text(disconnect_envelope.to_string()))
        .await
        .unwrap();
    let response: serde_json::Value = match read.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(response["type"], "Disconnected");
    assert_eq!(server.connection_count(), 0);

    // a class outside the allow-list fails the call
    let (ws_stream, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    let (mut write, mut read) = ws_stream.split();
    let evil_envelope = serde_json::json!({
        "class": "evil.Payload",
        "body": {}
    });
    write
        .send(Message::Text(evil_envelope.to_string()))
        .await
        .unwrap();
    let response: serde_json::Value = match read.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(response["type"], "Error");
    assert_eq!(response["data"]["code"], "deserialization_rejected");

    server.shutdown().await;
}
