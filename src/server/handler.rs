use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};
use tungstenite::Message;

use crate::server::client::ConnectionRequest;
use crate::server::core::{ConnectionHandler, Server};
use crate::server::filter::FilterDecision;
use crate::server::message::{
    DisconnectPayload, Envelope, PingPayload, ServerMessage, CONNECTION_REQUEST_CLASS,
    DISCONNECT_CLASS, PING_CLASS,
};
use crate::server::stream::ServerStream;
use crate::utils::error::ServerError;

/// State shared by the transport accept loop and the per-socket tasks.
pub struct TransportState<H: ConnectionHandler> {
    pub server: Server<H>,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

/// Accepts and handles incoming TCP connections until server shutdown.
///
/// Each accepted connection is upgraded (TLS when configured) and served on
/// its own task.
pub async fn serve<H>(listener: TcpListener, state: Arc<TransportState<H>>)
where
    H: ConnectionHandler,
    H::Handle: Serialize,
{
    let mut shutdown = state.server.shutdown_signal();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Transport listener stopped");
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            match upgrade(stream, &state).await {
                                Ok(stream) => {
                                    if let Err(e) = handle_connection(stream, state, addr).await {
                                        debug!("Connection {} closed: {}", addr, e);
                                    }
                                }
                                Err(e) => error!("TLS handshake failed for {}: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
        }
    }
}

async fn upgrade<H: ConnectionHandler>(
    stream: tokio::net::TcpStream,
    state: &TransportState<H>,
) -> Result<ServerStream, ServerError> {
    match &state.tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| ServerError::Connection(e.to_string()))?;

            Ok(ServerStream::Tls(Box::new(tls_stream)))
        }
        None => Ok(ServerStream::Plain(stream)),
    }
}

/// Handles one WebSocket connection, dispatching request envelopes onto
/// the server core until the peer disconnects.
///
/// # Errors
/// Returns `ServerError` when the handshake fails or an envelope is
/// rejected by the deserialization filter, which fails the connection by
/// design.
#[instrument(skip(stream, state))]
pub async fn handle_connection<H, S>(
    stream: S,
    state: Arc<TransportState<H>>,
    addr: SocketAddr,
) -> Result<(), ServerError>
where
    H: ConnectionHandler,
    H::Handle: Serialize,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
        error!("WebSocket handshake failed: {}", e);
        ServerError::Connection(e.to_string())
    })?;

    let (mut writer, mut reader) = ws_stream.split();

    while let Some(msg) = reader.next().await {
        let msg = msg.map_err(|e| ServerError::Connection(e.to_string()))?;
        match msg {
            Message::Text(text) => {
                match process_envelope(&text, addr, &state).await {
                    Ok(response) => {
                        writer
                            .send(response.try_into()?)
                            .await
                            .map_err(|e| ServerError::Connection(e.to_string()))?;
                    }
                    Err(e) => {
                        let _ = writer.send(ServerMessage::error(&e).try_into()?).await;
                        if let ServerError::DeserializationRejected(_) = e {
                            // fail-closed: a filtered payload kills the call
                            let _ = writer.send(Message::Close(None)).await;
                            return Err(e);
                        }
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = writer.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            _ => debug!("Unhandled message type"),
        }
    }

    Ok(())
}

/// Decodes and dispatches a single request envelope.
///
/// The envelope's declared class name passes the deserialization filter
/// before its body is decoded; anything not explicitly allowed is
/// rejected.
async fn process_envelope<H>(
    text: &str,
    addr: SocketAddr,
    state: &TransportState<H>,
) -> Result<ServerMessage, ServerError>
where
    H: ConnectionHandler,
    H::Handle: Serialize,
{
    let envelope = Envelope::parse(text)?;
    state.server.count_request();

    if let Some(filter) = state.server.filter() {
        if filter.check(&envelope.class) != FilterDecision::Allowed {
            state.server.metrics().rejections.inc();
            warn!("Envelope from {} rejected by filter: {}", addr, envelope.class);
            return Err(ServerError::DeserializationRejected(envelope.class));
        }
    }

    match envelope.class.as_str() {
        CONNECTION_REQUEST_CLASS => {
            let request: ConnectionRequest = serde_json::from_value(envelope.body)?;
            let handle = state.server.connect_from(request, Some(addr.ip())).await?;

            Ok(ServerMessage::Connected {
                handle: serde_json::to_value(handle)?,
            })
        }
        DISCONNECT_CLASS => {
            let payload: DisconnectPayload = serde_json::from_value(envelope.body)?;
            state.server.disconnect(payload.client_id).await;

            Ok(ServerMessage::Disconnected)
        }
        PING_CLASS => {
            let payload = if envelope.body.is_null() {
                PingPayload::default()
            } else {
                serde_json::from_value(envelope.body)?
            };
            if let Some(client_id) = payload.client_id {
                if let Some(handle) = state.server.connection(client_id) {
                    state.server.handler().register_activity(&handle).await;
                }
            }

            Ok(ServerMessage::Pong)
        }
        other => Err(ServerError::InvalidRequest(format!(
            "Unknown request class '{other}'"
        ))),
    }
}
