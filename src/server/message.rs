use serde::{Deserialize, Serialize};
use tungstenite::Message;
use uuid::Uuid;

use crate::utils::error::ServerError;

/// Wire class name of a connection request payload.
pub const CONNECTION_REQUEST_CLASS: &str = "core.client.ConnectionRequest";
/// Wire class name of a disconnect payload.
pub const DISCONNECT_CLASS: &str = "core.client.Disconnect";
/// Wire class name of a ping payload.
pub const PING_CLASS: &str = "core.Ping";

/// An inbound request envelope.
///
/// The declared class name is checked against the active deserialization
/// filter BEFORE the body is deserialized into a payload type; a rejected
/// class never reaches a payload deserializer.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub class: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ServerError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn new(class: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            class: class.into(),
            body,
        }
    }
}

/// Body of a [`DISCONNECT_CLASS`] envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub client_id: Uuid,
}

/// Body of a [`PING_CLASS`] envelope. A ping bearing a client id counts as
/// activity on that client's connection.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PingPayload {
    #[serde(default)]
    pub client_id: Option<Uuid>,
}

/// Represents messages that the server sends to the client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// The handle produced by a successful connect.
    Connected { handle: serde_json::Value },

    /// Acknowledges a disconnect.
    Disconnected,

    /// Response to a ping.
    Pong,

    /// An error outcome, carrying a stable code and a description.
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(error: &ServerError) -> Self {
        ServerMessage::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Converts a `ServerMessage` into a WebSocket `Message`.
impl TryFrom<ServerMessage> for Message {
    type Error = ServerError;

    fn try_from(msg: ServerMessage) -> Result<Self, ServerError> {
        let json = serde_json::to_string(&msg)?;

        Ok(Message::Text(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::new(PING_CLASS, serde_json::json!({}));
        let text = serde_json::to_string(&envelope).unwrap();
        let parsed = Envelope::parse(&text).unwrap();
        assert_eq!(parsed.class, PING_CLASS);
    }

    #[test]
    fn envelope_body_defaults_to_null() {
        let parsed = Envelope::parse(r#"{"class":"core.Ping"}"#).unwrap();
        assert!(parsed.body.is_null());
        let ping: PingPayload = serde_json::from_value(parsed.body).unwrap_or_default();
        assert!(ping.client_id.is_none());
    }

    #[test]
    fn error_messages_carry_the_code() {
        let message = ServerMessage::error(&ServerError::ConnectionNotAvailable);
        match message {
            ServerMessage::Error { code, .. } => assert_eq!(code, "connection_not_available"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
