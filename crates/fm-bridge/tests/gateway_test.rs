use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use fm_bridge::event_bus::EventBus;
use fm_bridge::gateway::{self, GatewayState, PresenceEvent};
use fm_bridge::protocol::{topics, Frame, Method, RpcError};
use fm_bridge::rpc::RpcRouter;

async fn start_gateway(
    state: GatewayState,
) -> (
    String,
    tokio::task::JoinHandle<std::io::Result<()>>,
) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(gateway::serve(listener, Arc::new(state)));
    (format!("ws://{}/ws", addr), handle)
}

async fn next_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("no transport error");
        if let Message::Text(text) = msg {
            let frame: Frame = serde_json::from_str(&text).unwrap();
            // Heartbeats are incidental; skip them.
            if frame.path == "/ping" {
                continue;
            }
            return frame;
        }
    }
}

#[tokio::test]
async fn subscribe_receives_published_events() {
    let bus = EventBus::new();
    let state = GatewayState::new(bus.clone(), Arc::new(RpcRouter::new()));
    let (url, _server) = start_gateway(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let sub = Frame::subscribe(topics::TICKETS);
    ws.send(Message::Text(serde_json::to_string(&sub).unwrap().into()))
        .await
        .unwrap();

    // Give the SUB frame time to register before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    bus.publish(topics::TICKETS, json!({"event": "ticket:created", "data": {"id": "t1"}}))
        .unwrap();

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.method, Some(Method::Pub));
    assert_eq!(frame.path, topics::TICKETS);
    assert_eq!(frame.data["event"], "ticket:created");
    assert_eq!(frame.data["data"]["id"], "t1");
}

#[tokio::test]
async fn rpc_round_trip_over_ws() {
    let router = Arc::new(RpcRouter::new());
    router.register(Method::Get, "/api/tickets/:id", |req| async move {
        match req.param("id") {
            Some("t1") => Ok(json!({"id": "t1", "title": "x"})),
            other => Err(RpcError::not_found(format!("ticket {other:?}"))),
        }
    });
    let state = GatewayState::new(EventBus::new(), router);
    let (url, _server) = start_gateway(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let req = Frame::request(Method::Get, "/api/tickets/t1", Value::Null);
    let req_id = req.id.clone().unwrap();
    ws.send(Message::Text(serde_json::to_string(&req).unwrap().into()))
        .await
        .unwrap();

    let frame = next_frame(&mut ws).await;
    assert!(frame.is_response());
    assert_eq!(frame.id.as_deref(), Some(req_id.as_str()));
    assert_eq!(frame.data["title"], "x");

    let bad = Frame::request(Method::Get, "/api/tickets/nope", Value::Null);
    ws.send(Message::Text(serde_json::to_string(&bad).unwrap().into()))
        .await
        .unwrap();
    let frame = next_frame(&mut ws).await;
    assert!(frame.error.is_some());
}

#[tokio::test]
async fn concurrent_rpcs_pair_by_correlation_id() {
    let router = Arc::new(RpcRouter::new());
    router.register(Method::Get, "/api/echo/:n", |req| async move {
        let n = req.param("n").unwrap_or("?").to_string();
        // Reverse completion order relative to arrival.
        let delay = 50u64.saturating_sub(n.parse::<u64>().unwrap_or(0) * 10);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(json!(n))
    });
    let state = GatewayState::new(EventBus::new(), router);
    let (url, _server) = start_gateway(state).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let mut expected = HashMap::new();
    for n in 0..4 {
        let req = Frame::request(Method::Get, &format!("/api/echo/{n}"), Value::Null);
        expected.insert(req.id.clone().unwrap(), json!(n.to_string()));
        ws.send(Message::Text(serde_json::to_string(&req).unwrap().into()))
            .await
            .unwrap();
    }

    for _ in 0..4 {
        let frame = next_frame(&mut ws).await;
        let id = frame.id.clone().unwrap();
        let want = expected.remove(&id).expect("known correlation id");
        assert_eq!(frame.data, want);
    }
    assert!(expected.is_empty());
}

#[tokio::test]
async fn client_pub_frames_reach_bus_subscribers() {
    let bus = EventBus::new();
    let state = GatewayState::new(bus.clone(), Arc::new(RpcRouter::new()));
    let (url, _server) = start_gateway(state).await;

    let local = bus.subscribe("/agents");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = Frame::publish("/agents", json!({"event": "agent:status", "data": {"agent_id": "a1"}}));
    ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into()))
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), local.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["data"]["agent_id"], "a1");
}

#[tokio::test]
async fn worker_subscription_emits_presence_and_disconnect_clears_it() {
    let (presence_tx, presence_rx) = flume::unbounded();
    let state = GatewayState::new(EventBus::new(), Arc::new(RpcRouter::new()))
        .with_presence(presence_tx);
    let (url, _server) = start_gateway(state).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let sub = Frame::subscribe(topics::agent_tasks("a1"));
    ws.send(Message::Text(serde_json::to_string(&sub).unwrap().into()))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), presence_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        PresenceEvent::Subscribed {
            agent_id: "a1".into()
        }
    );

    // Closing the connection reports the subscription as lost.
    ws.close(None).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), presence_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        PresenceEvent::Unsubscribed {
            agent_id: "a1".into()
        }
    );
}

#[tokio::test]
async fn http_fallback_serves_the_same_router() {
    let router = Arc::new(RpcRouter::new());
    router.register(Method::Get, "/api/agents", |_req| async { Ok(json!([])) });
    let state = GatewayState::new(EventBus::new(), router);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(gateway::serve(listener, Arc::new(state)));

    // A raw HTTP/1.1 request keeps the test free of an HTTP client dependency.
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET /api/agents HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut buf = String::new();
    stream.read_to_string(&mut buf).await.unwrap();
    assert!(buf.starts_with("HTTP/1.1 200"));
    assert!(buf.ends_with("[]"));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET /api/missing HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut buf = String::new();
    stream.read_to_string(&mut buf).await.unwrap();
    assert!(buf.starts_with("HTTP/1.1 404"));
}
