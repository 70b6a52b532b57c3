//! End-to-end over a real socket with the `tokio-tungstenite` adapter.

#![cfg(feature = "tungstenite")]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tether::transport::TungsteniteTransport;
use tether::{Connection, Handler, Hub, HubConfig};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};

const WAIT: Duration = Duration::from_secs(5);

struct Echo;

impl Handler for Echo {
    fn on_text(&self, _hub: &Hub, conn: &Arc<Connection>, text: String) {
        let _ = conn.write_text(format!("echo: {text}"));
    }
}

#[tokio::test]
async fn echo_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Hub::new(
        HubConfig {
            close_linger_ms: 10,
            ..HubConfig::default()
        },
        Echo,
    );

    let server_hub = hub.clone();
    let server = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let transport = TungsteniteTransport::new(ws).with_remote_addr(peer);
        server_hub.register(transport, HashMap::new()).await
    });

    let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
    client.send(Message::text("hello")).await.unwrap();

    let reply = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::text("echo: hello"));
    assert_eq!(hub.connection_count(), 1);

    client.close(None).await.unwrap();
    let id = timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert!(hub.connection(&id).is_none());
    assert_eq!(hub.connection_count(), 0);
}
