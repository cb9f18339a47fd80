use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use fm_bridge::protocol::{Frame, Method, RpcError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("rpc error: {0}")]
    Rpc(RpcError),
    #[error("rpc timed out after {0}ms")]
    Timeout(u64),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

// ---------------------------------------------------------------------------
// BrokerClient
// ---------------------------------------------------------------------------

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;
type TopicMap = Arc<Mutex<HashMap<String, flume::Sender<Value>>>>;

/// Worker-side WebSocket client to the broker gateway.
///
/// One reader task demultiplexes incoming frames: responses complete their
/// pending RPC by correlation id, PUB frames fan out to per-topic channels.
/// When the connection dies every pending RPC and topic channel ends, which
/// is how the runner notices it must reconnect.
#[derive(Debug)]
pub struct BrokerClient {
    out_tx: flume::Sender<Message>,
    pending: PendingMap,
    topics: TopicMap,
    alive: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl BrokerClient {
    /// Connect once to a `ws://host:port/ws` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, out_rx) = flume::unbounded::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let topics: TopicMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Ok(msg) = out_rx.recv_async().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_topics = topics.clone();
        let reader_alive = alive.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "unparseable frame from broker");
                        continue;
                    }
                };

                if frame.is_response() {
                    let id = frame.id.clone().unwrap_or_default();
                    let waiter = {
                        let mut pending = reader_pending.lock().expect("pending lock");
                        pending.remove(&id)
                    };
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(frame);
                        }
                        None => debug!(id = %id, "late response discarded"),
                    }
                    continue;
                }

                if frame.method == Some(Method::Pub) {
                    // Heartbeats share the PUB shape; nothing subscribes to them.
                    let tx = {
                        let topics = reader_topics.lock().expect("topics lock");
                        topics.get(&frame.path).cloned()
                    };
                    if let Some(tx) = tx {
                        let _ = tx.send(frame.data);
                    }
                }
            }

            // Connection gone: wake every waiter and end every topic channel.
            reader_alive.store(false, Ordering::Release);
            reader_pending.lock().expect("pending lock").clear();
            reader_topics.lock().expect("topics lock").clear();
            debug!("broker connection reader finished");
        });

        Ok(Self {
            out_tx,
            pending,
            topics,
            alive,
            reader,
            writer,
        })
    }

    /// Connect with exponential backoff. `max_attempts` is clamped to at
    /// least 5.
    pub async fn connect_with_backoff(
        url: &str,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<Self> {
        let max_attempts = max_attempts.max(5);
        let mut last_err = ConnectionError::Connect("no attempt made".into());
        for attempt in 0..max_attempts {
            match Self::connect(url).await {
                Ok(client) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "reconnected to broker");
                    }
                    return Ok(client);
                }
                Err(e) => {
                    let delay = base_delay * 2u32.saturating_pow(attempt).min(64);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker connect failed, backing off"
                    );
                    last_err = e;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let text =
            serde_json::to_string(frame).map_err(|e| ConnectionError::Serialization(e.to_string()))?;
        self.out_tx
            .send(Message::Text(text.into()))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Subscribe to a topic; deliveries arrive on the returned channel. The
    /// channel ends when the connection dies.
    pub fn subscribe(&self, topic: &str) -> Result<flume::Receiver<Value>> {
        let (tx, rx) = flume::unbounded();
        {
            let mut topics = self.topics.lock().expect("topics lock");
            topics.insert(topic.to_string(), tx);
        }
        self.send_frame(&Frame::subscribe(topic))?;
        Ok(rx)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        {
            let mut topics = self.topics.lock().expect("topics lock");
            topics.remove(topic);
        }
        self.send_frame(&Frame::unsubscribe(topic))
    }

    /// Fire-and-forget publish on a topic.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.send_frame(&Frame::publish(topic, payload))
    }

    /// Correlated RPC with a deadline. A response arriving after expiry is
    /// discarded by the reader.
    pub async fn rpc(
        &self,
        method: Method,
        path: &str,
        data: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let mut frame = Frame::request(method, path, data);
        frame.query.insert(
            "deadline_ms".to_string(),
            deadline.as_millis().to_string(),
        );
        let id = frame.id.clone().unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.insert(id.clone(), tx);
        }
        self.send_frame(&frame)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(err) => Err(ConnectionError::Rpc(err)),
                None => Ok(response.data),
            },
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                let mut pending = self.pending.lock().expect("pending lock");
                pending.remove(&id);
                Err(ConnectionError::Timeout(deadline.as_millis() as u64))
            }
        }
    }

    /// Tear down the connection and both pump tasks.
    pub fn close(&self) {
        let _ = self.out_tx.send(Message::Close(None));
        self.alive.store(false, Ordering::Release);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests (gateway round-trips live in tests/worker_flow_test.rs)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_with_backoff_gives_up_after_attempts() {
        let started = std::time::Instant::now();
        let err = BrokerClient::connect_with_backoff(
            "ws://127.0.0.1:1/ws",
            5,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectionError::Connect(_)));
        // 5 attempts with millisecond backoff should fail fast.
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
