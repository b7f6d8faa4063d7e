use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio_tungstenite::connect_async;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let (mut ws_stream, _) = connect_async("ws://127.0.0.1:2222") // Change to your server's URL
        .await
        .expect("Failed to connect");

    let client_id = Uuid::new_v4();
    let connect_envelope = serde_json::json!({
        "class": "core.client.ConnectionRequest",
        "body": {
            "user": { "username": "scott", "password": "tiger" },
            "client_id": client_id,
            "client_type": "demo-client",
        }
    });
    ws_stream
        .send(tungstenite::Message::Text(connect_envelope.to_string()))
        .await
        .expect("Failed to send connection request");

    if let Some(Ok(response)) = ws_stream.next().await {
        println!("Server response: {response}");
    }

    let disconnect_envelope = serde_json::json!({
        "class": "core.client.Disconnect",
        "body": { "client_id": client_id }
    });
    ws_stream
        .send(tungstenite::Message::Text(disconnect_envelope.to_string()))
        .await
        .expect("Failed to send disconnect");

    if let Some(Ok(response)) = ws_stream.next().await {
        println!("Server response: {response}");
    }
}
