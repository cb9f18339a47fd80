use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use fm_bridge::event_bus::EventBus;
use fm_bridge::gateway::PresenceEvent;
use fm_bridge::protocol::{events, topics, EventEnvelope, StatusReport};
use fm_core::store::StoreDb;
use fm_core::task_queue::TaskQueue;
use fm_core::types::{AgentActivity, AgentShadowState, TaskStats};

// ---------------------------------------------------------------------------
// StatePatch
// ---------------------------------------------------------------------------

/// Partial update merged into a stored shadow state.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub service_online: Option<bool>,
    pub activity: Option<AgentActivity>,
    /// `Some(None)` clears the message, `Some(Some(..))` replaces it.
    pub message: Option<Option<String>>,
    pub heartbeat: bool,
}

impl StatePatch {
    pub fn online(online: bool) -> Self {
        Self {
            service_online: Some(online),
            ..Default::default()
        }
    }

    pub fn activity(activity: AgentActivity) -> Self {
        Self {
            activity: Some(activity),
            ..Default::default()
        }
    }

    fn apply(&self, state: &mut AgentShadowState) {
        if let Some(online) = self.service_online {
            state.service_online = online;
            // A worker coming online from cold starts idle until it reports.
            if online && state.activity == AgentActivity::Offline {
                state.activity = AgentActivity::Idle;
            }
        }
        if let Some(activity) = self.activity {
            state.activity = activity;
            state.last_activity = Some(Utc::now());
        }
        if let Some(ref message) = self.message {
            state.message = message.clone();
        }
        if self.heartbeat {
            state.last_heartbeat = Some(Utc::now());
        }
    }
}

// ---------------------------------------------------------------------------
// AgentStateTracker
// ---------------------------------------------------------------------------

struct Inner {
    states: Mutex<HashMap<String, AgentShadowState>>,
    store: Arc<StoreDb>,
    queue: TaskQueue,
    bus: EventBus,
    coalesce: Duration,
    throttle: Duration,
    dirty_tx: flume::Sender<()>,
    last_broadcast: Mutex<Option<Instant>>,
}

/// Broker-side shadow of every agent's liveness and activity.
///
/// Mutations are cheap map merges under one mutex; a debounced publisher
/// task coalesces change bursts and emits a single `/agents/state` snapshot
/// per group window, enriched with fresh task-stat counts. The lock is never
/// held across a broadcast.
#[derive(Clone)]
pub struct AgentStateTracker {
    inner: Arc<Inner>,
}

impl AgentStateTracker {
    /// Create the tracker and start its debounced publisher. Must be called
    /// within a tokio runtime.
    pub fn new(store: Arc<StoreDb>, queue: TaskQueue, bus: EventBus) -> Self {
        Self::with_windows(store, queue, bus, Duration::from_millis(50), Duration::from_secs(2))
    }

    pub fn with_windows(
        store: Arc<StoreDb>,
        queue: TaskQueue,
        bus: EventBus,
        coalesce: Duration,
        throttle: Duration,
    ) -> Self {
        let (dirty_tx, dirty_rx) = flume::unbounded();
        let tracker = Self {
            inner: Arc::new(Inner {
                states: Mutex::new(HashMap::new()),
                store,
                queue,
                bus,
                coalesce,
                throttle,
                dirty_tx,
                last_broadcast: Mutex::new(None),
            }),
        };
        let publisher = tracker.clone();
        tokio::spawn(async move { publisher.debounce_loop(dirty_rx).await });
        tracker
    }

    // -- reads --------------------------------------------------------------

    /// Raw stored state (no offline projection applied).
    pub fn get(&self, agent_id: &str) -> Option<AgentShadowState> {
        let states = self.inner.states.lock().expect("tracker lock poisoned");
        states.get(agent_id).cloned()
    }

    pub fn get_all(&self) -> HashMap<String, AgentShadowState> {
        let states = self.inner.states.lock().expect("tracker lock poisoned");
        states.clone()
    }

    /// The state as clients see it: a dead subscription with no row actually
    /// processing projects as offline; a task still in flight keeps the
    /// recorded status through reconnect flaps. Task stats are refreshed
    /// from the store so the projection follows the task table, not the
    /// cached activity flag.
    pub async fn projected(&self, agent_id: &str) -> AgentShadowState {
        let mut state = self.get(agent_id).unwrap_or_default();
        match self.inner.queue.stats(agent_id).await {
            Ok(stats) => state.stats = stats,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "stats refresh failed, projecting from cache")
            }
        }
        project(state)
    }

    // -- mutations ----------------------------------------------------------

    /// Merge a patch; schedules a coalesced broadcast iff anything observable
    /// changed.
    pub fn update(&self, agent_id: &str, patch: StatePatch) {
        if self.apply_patch(agent_id, &patch) {
            self.mark_dirty();
        }
    }

    /// Apply all patches, then broadcast once.
    pub fn batch_update(&self, updates: Vec<(String, StatePatch)>) {
        let mut changed = false;
        for (agent_id, patch) in &updates {
            changed |= self.apply_patch(agent_id, patch);
        }
        if changed {
            self.mark_dirty();
        }
    }

    pub fn set_service_online(&self, agent_id: &str, online: bool) {
        self.update(agent_id, StatePatch::online(online));
    }

    /// Task-table mutation observed (enqueue or transition): counts changed,
    /// schedule a refresh broadcast.
    pub fn notify_tasks_changed(&self) {
        self.mark_dirty();
    }

    fn apply_patch(&self, agent_id: &str, patch: &StatePatch) -> bool {
        let mut states = self.inner.states.lock().expect("tracker lock poisoned");
        let state = states.entry(agent_id.to_string()).or_default();
        let before = state.clone();
        patch.apply(state);
        *state != before
    }

    fn mark_dirty(&self) {
        let _ = self.inner.dirty_tx.send(());
    }

    // -- broadcasting -------------------------------------------------------

    async fn debounce_loop(self, dirty_rx: flume::Receiver<()>) {
        while dirty_rx.recv_async().await.is_ok() {
            // Mutations arriving within the group window extend it.
            loop {
                match tokio::time::timeout(self.inner.coalesce, dirty_rx.recv_async()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => return,
                    Err(_) => break,
                }
            }
            self.broadcast_now().await;
        }
    }

    /// Publish one `/agents/state` snapshot: every registered agent, cleaned
    /// copy, fresh task stats, offline projection applied.
    pub async fn broadcast_now(&self) {
        let agents = match self.inner.store.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "state broadcast skipped, agent listing failed");
                return;
            }
        };
        let stats: HashMap<String, TaskStats> = match self.inner.queue.stats_all().await {
            Ok(all) => all.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "state broadcast skipped, stats query failed");
                return;
            }
        };

        let mut snapshot = serde_json::Map::new();
        {
            let mut states = self.inner.states.lock().expect("tracker lock poisoned");
            for agent in &agents {
                let entry = states.entry(agent.id.clone()).or_default();
                entry.stats = stats.get(&agent.id).copied().unwrap_or_default();
                let projected = project(entry.clone());
                snapshot.insert(
                    agent.id.clone(),
                    json!({
                        "agent_id": agent.id,
                        "name": agent.name,
                        "kind": agent.kind,
                        "enabled": agent.enabled,
                        "state": projected,
                    }),
                );
            }
        }

        let envelope = EventEnvelope::new(
            "agents:state",
            json!({ "agents": serde_json::Value::Object(snapshot) }),
        );
        if let Err(e) = self.inner.bus.publish(topics::AGENTS_STATE, envelope.to_value()) {
            debug!(error = %e, "state broadcast dropped");
        }
        let mut last = self.inner.last_broadcast.lock().expect("tracker lock poisoned");
        *last = Some(Instant::now());
    }

    /// Broadcast unless one was emitted within the throttle window. Used by
    /// heartbeat paths that would otherwise spam the snapshot topic.
    pub async fn throttled_broadcast(&self) {
        let due = {
            let last = self.inner.last_broadcast.lock().expect("tracker lock poisoned");
            last.map(|t| t.elapsed() >= self.inner.throttle).unwrap_or(true)
        };
        if due {
            self.broadcast_now().await;
        }
    }

    // -- signal listeners ---------------------------------------------------

    /// Consume gateway presence events: worker subscriptions flip
    /// `service_online`.
    pub fn spawn_presence_listener(&self, rx: flume::Receiver<PresenceEvent>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv_async().await {
                match event {
                    PresenceEvent::Subscribed { agent_id } => {
                        debug!(agent_id = %agent_id, "worker subscribed");
                        tracker.set_service_online(&agent_id, true);
                    }
                    PresenceEvent::Unsubscribed { agent_id } => {
                        debug!(agent_id = %agent_id, "worker unsubscribed");
                        tracker.set_service_online(&agent_id, false);
                    }
                }
            }
        });
    }

    /// Consume explicit worker status messages published on `/agents`.
    pub fn spawn_status_listener(&self) {
        let tracker = self.clone();
        let sub = self.inner.bus.subscribe(topics::AGENTS);
        tokio::spawn(async move {
            while let Some(payload) = sub.recv().await {
                let Ok(envelope) = serde_json::from_value::<EventEnvelope>(payload) else {
                    continue;
                };
                match envelope.event.as_str() {
                    events::AGENT_STATUS => {
                        if let Ok(report) = serde_json::from_value::<StatusReport>(envelope.data) {
                            tracker.update(
                                &report.agent_id,
                                StatePatch {
                                    activity: Some(report.activity),
                                    message: Some(report.message),
                                    heartbeat: true,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                    events::AGENT_ERROR => {
                        if let Ok(report) = serde_json::from_value::<StatusReport>(envelope.data) {
                            tracker.update(
                                &report.agent_id,
                                StatePatch {
                                    activity: Some(AgentActivity::Error),
                                    message: Some(report.message),
                                    heartbeat: true,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}

/// Offline iff no live subscription and no task row is processing. The
/// caller must have loaded fresh stats; an in-flight row keeps the recorded
/// status so reconnect flaps never show a busy agent as offline.
fn project(mut state: AgentShadowState) -> AgentShadowState {
    if !state.service_online && state.stats.processing == 0 {
        state.activity = AgentActivity::Offline;
    }
    state
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{AgentKind, AgentRecord};

    struct Fixture {
        store: Arc<StoreDb>,
        bus: EventBus,
        tracker: AgentStateTracker,
    }

    async fn fixture(coalesce_ms: u64) -> Fixture {
        let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
        let bus = EventBus::new();
        let queue = TaskQueue::new(store.clone());
        let tracker = AgentStateTracker::with_windows(
            store.clone(),
            queue,
            bus.clone(),
            Duration::from_millis(coalesce_ms),
            Duration::from_secs(2),
        );
        Fixture { store, bus, tracker }
    }

    async fn seed_agent(store: &StoreDb, name: &str) -> AgentRecord {
        let agent = AgentRecord::new(name, AgentKind::Developer);
        store.insert_agent(&agent).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn burst_of_updates_coalesces_into_one_broadcast() {
        let f = fixture(30).await;
        let agent = seed_agent(&f.store, "Dev").await;
        let sub = f.bus.subscribe(topics::AGENTS_STATE);

        for _ in 0..5 {
            f.tracker.update(&agent.id, StatePatch::activity(AgentActivity::Working));
            f.tracker.update(&agent.id, StatePatch::activity(AgentActivity::Idle));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut count = 0;
        while sub.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "burst must coalesce into a single snapshot");
    }

    #[tokio::test]
    async fn unchanged_patch_does_not_broadcast() {
        let f = fixture(10).await;
        let agent = seed_agent(&f.store, "Dev").await;
        let sub = f.bus.subscribe(topics::AGENTS_STATE);

        f.tracker.set_service_online(&agent.id, true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_some());

        // Same value again: no observable change, no broadcast.
        f.tracker.set_service_online(&agent.id, true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn offline_projection_tracks_live_processing_rows() {
        let f = fixture(10).await;
        let agent = seed_agent(&f.store, "Dev").await;
        let queue = TaskQueue::new(f.store.clone());

        f.tracker.set_service_online(&agent.id, true);
        f.tracker.update(&agent.id, StatePatch::activity(AgentActivity::Idle));
        f.tracker.set_service_online(&agent.id, false);

        // No subscriber and no processing row: offline.
        let projected = f.tracker.projected(&agent.id).await;
        assert_eq!(projected.activity, AgentActivity::Offline);

        // A row actually processing keeps the recorded status through the
        // reconnect flap.
        let task = queue
            .enqueue(&agent.id, fm_core::types::TaskType::Manual, json!({}), 0)
            .await
            .unwrap();
        queue.claim(&task.id).await.unwrap();
        f.tracker.update(&agent.id, StatePatch::activity(AgentActivity::Working));
        let projected = f.tracker.projected(&agent.id).await;
        assert_eq!(projected.activity, AgentActivity::Working);
        assert_eq!(projected.stats.processing, 1);

        // A stale cached "working" with no real processing row still projects
        // offline: the task table is the source of truth.
        queue.mark_completed(&task.id).await.unwrap();
        let projected = f.tracker.projected(&agent.id).await;
        assert_eq!(projected.activity, AgentActivity::Offline);
        assert_eq!(projected.stats.processing, 0);
    }

    #[tokio::test]
    async fn snapshot_contains_fresh_task_stats() {
        let f = fixture(10).await;
        let agent = seed_agent(&f.store, "Dev").await;
        let queue = TaskQueue::new(f.store.clone());
        queue
            .enqueue(&agent.id, fm_core::types::TaskType::Manual, json!({}), 0)
            .await
            .unwrap();

        let sub = f.bus.subscribe(topics::AGENTS_STATE);
        f.tracker.notify_tasks_changed();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = sub.try_recv().expect("snapshot published");
        let state = &payload["data"]["agents"][&agent.id]["state"];
        assert_eq!(state["stats"]["pending"], 1);
    }

    #[tokio::test]
    async fn presence_listener_flips_service_online() {
        let f = fixture(10).await;
        let agent = seed_agent(&f.store, "Dev").await;
        let (tx, rx) = flume::unbounded();
        f.tracker.spawn_presence_listener(rx);

        tx.send(PresenceEvent::Subscribed {
            agent_id: agent.id.clone(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.tracker.get(&agent.id).unwrap().service_online);

        tx.send(PresenceEvent::Unsubscribed {
            agent_id: agent.id.clone(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!f.tracker.get(&agent.id).unwrap().service_online);
    }

    #[tokio::test]
    async fn status_listener_applies_worker_reports() {
        let f = fixture(10).await;
        let agent = seed_agent(&f.store, "Dev").await;
        f.tracker.spawn_status_listener();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = StatusReport {
            agent_id: agent.id.clone(),
            activity: AgentActivity::Working,
            message: Some("processing".into()),
        };
        let envelope = EventEnvelope::new(
            events::AGENT_STATUS,
            serde_json::to_value(&report).unwrap(),
        );
        f.bus.publish(topics::AGENTS, envelope.to_value()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = f.tracker.get(&agent.id).unwrap();
        assert_eq!(state.activity, AgentActivity::Working);
        assert_eq!(state.message.as_deref(), Some("processing"));
        assert!(state.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn throttled_broadcast_respects_window() {
        let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
        let bus = EventBus::new();
        let queue = TaskQueue::new(store.clone());
        let tracker = AgentStateTracker::with_windows(
            store.clone(),
            queue,
            bus.clone(),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        seed_agent(&store, "Dev").await;
        let sub = bus.subscribe(topics::AGENTS_STATE);

        tracker.throttled_broadcast().await;
        assert!(sub.try_recv().is_some());

        // Within the throttle window: suppressed.
        tracker.throttled_broadcast().await;
        assert!(sub.try_recv().is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        tracker.throttled_broadcast().await;
        assert!(sub.try_recv().is_some());
    }
}
