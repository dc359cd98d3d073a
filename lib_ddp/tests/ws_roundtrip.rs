//! The WebSocket transport against a local tokio-tungstenite server.
#![cfg(feature = "ws")]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_ddp::core::{ConnectionState, DdpTrigger, Emitter, Record};
use lib_ddp::error::TriggerError;
use lib_ddp::transport::WsConnector;
use lib_ddp::{ConnectionConfig, StartMode, SubscriptionSpec, TriggerConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

struct ChannelEmitter(mpsc::UnboundedSender<Vec<Record>>);

impl Emitter for ChannelEmitter {
    fn emit(&self, records: Vec<Record>) {
        let _ = self.0.send(records);
    }

    fn emit_error(&self, error: TriggerError) {
        panic!("unexpected error: {}", error);
    }
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame from client")
            .expect("client closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
        }
    }
}

#[tokio::test]
async fn handshake_subscription_heartbeat_and_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        let connect = next_json(&mut ws).await;
        assert_eq!(connect["msg"], "connect");
        assert_eq!(connect["version"], "1");
        assert_eq!(connect["support"], json!(["1", "pre2", "pre1"]));

        ws.send(Message::text(r#"{"server_id":"0"}"#)).await.unwrap();
        ws.send(Message::text(r#"{"msg":"connected","session":"abc"}"#)).await.unwrap();

        let sub = next_json(&mut ws).await;
        assert_eq!(sub["msg"], "sub");
        assert_eq!(sub["name"], "tasks");
        assert_eq!(sub["params"], json!(["open"]));
        let sub_id = sub["id"].as_str().unwrap().to_string();

        ws.send(Message::text(r#"{"msg":"ping","id":"hb-1"}"#)).await.unwrap();
        assert_eq!(next_json(&mut ws).await, json!({"msg": "pong", "id": "hb-1"}));

        let added = json!({"msg": "added", "collection": "tasks", "id": "t1", "fields": {"title": "write tests"}});
        ws.send(Message::text(added.to_string())).await.unwrap();
        let ready = json!({"msg": "ready", "subs": [sub_id]});
        ws.send(Message::text(ready.to_string())).await.unwrap();

        // Runs until the client closes the socket.
        while let Some(Ok(frame)) = ws.next().await {
            if frame.is_close() {
                break;
            }
        }
    });

    let mut spec = SubscriptionSpec::new("tasks");
    spec.params = vec![json!("open")];
    let config = TriggerConfig::new(ConnectionConfig::new(&format!("http://127.0.0.1:{}", port)).unwrap())
        .subscribe(spec)
        .collection("tasks")
        .with_start_mode(StartMode::WaitConnected);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let trigger = DdpTrigger::new(config, WsConnector::new(), ChannelEmitter(tx));

    trigger.start().await.unwrap();
    assert_eq!(trigger.state(), ConnectionState::Connected);

    let pushed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(pushed[0].name, "tasks");
    assert_eq!(pushed[0].data["kind"], "added");

    timeout(Duration::from_secs(5), trigger.fetch()).await.unwrap().unwrap();
    let pulled = rx.recv().await.unwrap();
    assert_eq!(
        pulled,
        vec![Record { name: "tasks".into(), data: json!([{"_id": "t1", "title": "write tests"}]) }]
    );

    trigger.stop().await;
    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
