use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::protocol::{topics, Frame, Method, RpcError, RpcErrorKind};
use crate::rpc::RpcRouter;

// ---------------------------------------------------------------------------
// Presence events
// ---------------------------------------------------------------------------

/// Notifications about worker subscriptions on `/agents/{id}/tasks`.
/// The agent-state tracker consumes these to maintain `service_online`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Subscribed { agent_id: String },
    Unsubscribed { agent_id: String },
}

// ---------------------------------------------------------------------------
// GatewayState
// ---------------------------------------------------------------------------

/// Shared state for every gateway connection.
pub struct GatewayState {
    pub bus: EventBus,
    pub router: Arc<RpcRouter>,
    presence: Option<flume::Sender<PresenceEvent>>,
    /// Deadline applied when the caller does not supply one.
    pub default_deadline: Duration,
}

impl GatewayState {
    pub fn new(bus: EventBus, router: Arc<RpcRouter>) -> Self {
        Self {
            bus,
            router,
            presence: None,
            default_deadline: Duration::from_secs(30),
        }
    }

    /// Wire a presence listener (the broker's state tracker).
    pub fn with_presence(mut self, tx: flume::Sender<PresenceEvent>) -> Self {
        self.presence = Some(tx);
        self
    }

    fn notify_presence(&self, event: PresenceEvent) {
        if let Some(tx) = &self.presence {
            let _ = tx.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Build the gateway's axum application: the `/ws` frame endpoint, a health
/// probe, and a plain-HTTP fallback that maps `/api/*` requests onto the
/// same RPC router.
pub fn app(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .fallback(http_rpc)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    |origin: &axum::http::HeaderValue, _| {
                        origin
                            .to_str()
                            .map(|o| {
                                o.starts_with("http://localhost")
                                    || o.starts_with("http://127.0.0.1")
                            })
                            .unwrap_or(false)
                    },
                ))
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                ])
                .allow_headers([axum::http::header::CONTENT_TYPE]),
        )
        .with_state(state)
}

/// Serve the gateway on an already-bound listener.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "gateway listening");
    axum::serve(listener, app(state)).await
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// ---------------------------------------------------------------------------
// WebSocket endpoint
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let actor = query.get("actor").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, actor: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    // All outbound frames (event deliveries and RPC responses) funnel through
    // one channel so the sink is written from a single place.
    let (out_tx, out_rx) = flume::unbounded::<String>();
    let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            out = out_rx.recv_async() => {
                match out {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            _ = heartbeat.tick() => {
                let ping = Frame::publish(
                    "/ping",
                    serde_json::json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
                );
                let text = serde_json::to_string(&ping).unwrap_or_default();
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &actor, &out_tx, &mut forwarders, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // Connection gone: detach every subscription and report lost presence.
    for (topic, handle) in forwarders.drain() {
        handle.abort();
        if let Some(agent_id) = topics::parse_agent_tasks(&topic) {
            state.notify_presence(PresenceEvent::Unsubscribed {
                agent_id: agent_id.to_string(),
            });
        }
    }
    debug!("gateway connection closed");
}

fn handle_frame(
    state: &Arc<GatewayState>,
    actor: &Option<String>,
    out_tx: &flume::Sender<String>,
    forwarders: &mut HashMap<String, tokio::task::JoinHandle<()>>,
    text: &str,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "unparseable frame");
            return;
        }
    };

    match frame.method {
        Some(Method::Sub) => {
            let topic = frame.path.clone();
            if forwarders.contains_key(&topic) {
                return;
            }
            let sub = state.bus.subscribe(&topic);
            let out = out_tx.clone();
            let forward_topic = topic.clone();
            let handle = tokio::spawn(async move {
                while let Some(payload) = sub.recv().await {
                    let frame = Frame::publish(&forward_topic, payload);
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if out.send_async(text).await.is_err() {
                        break;
                    }
                }
            });
            forwarders.insert(topic.clone(), handle);
            if let Some(agent_id) = topics::parse_agent_tasks(&topic) {
                state.notify_presence(PresenceEvent::Subscribed {
                    agent_id: agent_id.to_string(),
                });
            }
        }

        Some(Method::Unsub) => {
            if let Some(handle) = forwarders.remove(&frame.path) {
                handle.abort();
            }
            if let Some(agent_id) = topics::parse_agent_tasks(&frame.path) {
                state.notify_presence(PresenceEvent::Unsubscribed {
                    agent_id: agent_id.to_string(),
                });
            }
        }

        Some(Method::Pub) => {
            if let Err(e) = state.bus.publish(&frame.path, frame.data) {
                warn!(topic = %frame.path, error = %e, "publish rejected");
            }
        }

        Some(method) if method.is_rpc() => {
            let state = state.clone();
            let out = out_tx.clone();
            let actor = actor.clone();
            tokio::spawn(async move {
                let id = frame.id.clone().unwrap_or_default();
                let deadline = frame
                    .query
                    .get("deadline_ms")
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(state.default_deadline);
                let result = state
                    .router
                    .dispatch(method, &frame.path, frame.query, frame.data, actor, Some(deadline))
                    .await;
                let response = match result {
                    Ok(data) => Frame::response(id, data),
                    Err(err) => Frame::error_response(id, err),
                };
                if let Ok(text) = serde_json::to_string(&response) {
                    let _ = out.send_async(text).await;
                }
            });
        }

        _ => {
            debug!(path = %frame.path, "ignoring frame without actionable method");
        }
    }
}

// ---------------------------------------------------------------------------
// Plain-HTTP fallback for the RPC surface
// ---------------------------------------------------------------------------

async fn http_rpc(
    State(state): State<Arc<GatewayState>>,
    req: axum::extract::Request,
) -> Response {
    let method = match req.method().as_str() {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "DELETE" => Method::Delete,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let path = req.uri().path().to_string();
    if !path.starts_with("/api/") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let query = parse_query(req.uri().query().unwrap_or(""));
    let actor = req
        .headers()
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let bytes = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let data: Value = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                return rpc_error_response(RpcError::validation(format!("invalid json body: {e}")))
            }
        }
    };

    let deadline = query
        .get("deadline_ms")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(state.default_deadline);

    match state
        .router
        .dispatch(method, &path, query, data, actor, Some(deadline))
        .await
    {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => rpc_error_response(err),
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

fn rpc_error_response(err: RpcError) -> Response {
    let status = match err.kind {
        RpcErrorKind::Validation => StatusCode::BAD_REQUEST,
        RpcErrorKind::NotFound => StatusCode::NOT_FOUND,
        RpcErrorKind::Conflict => StatusCode::CONFLICT,
        RpcErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        RpcErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        RpcErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
        RpcErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RpcErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err}))).into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing() {
        let q = parse_query("a=1&b=two&skip");
        assert_eq!(q.get("a").map(String::as_str), Some("1"));
        assert_eq!(q.get("b").map(String::as_str), Some("two"));
        assert!(!q.contains_key("skip"));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (RpcError::validation("x"), StatusCode::BAD_REQUEST),
            (RpcError::not_found("x"), StatusCode::NOT_FOUND),
            (RpcError::conflict("x"), StatusCode::CONFLICT),
            (RpcError::unauthorized("x"), StatusCode::UNAUTHORIZED),
            (RpcError::upstream("x"), StatusCode::BAD_GATEWAY),
            (RpcError::transport("x"), StatusCode::SERVICE_UNAVAILABLE),
            (RpcError::timeout("x"), StatusCode::GATEWAY_TIMEOUT),
            (RpcError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(rpc_error_response(err).status(), status);
        }
    }
}
