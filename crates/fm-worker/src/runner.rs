use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use fm_bridge::protocol::{events, topics, EventEnvelope, Method, StatusReport, TaskPush};
use fm_core::store::StoreDb;
use fm_core::task_queue::{TaskQueue, TaskQueueError};
use fm_core::types::{AgentActivity, AgentRecord, Task};

use crate::behavior::{AgentBehavior, TaskContext, TaskOutcome, WorkerTools};
use crate::connection::{BrokerClient, ConnectionError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// WorkerPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Connecting,
    Subscribed,
    Idle,
    Processing,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerPhase::Connecting => "connecting",
            WorkerPhase::Subscribed => "subscribed",
            WorkerPhase::Idle => "idle",
            WorkerPhase::Processing => "processing",
            WorkerPhase::Stopping => "stopping",
            WorkerPhase::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

impl WorkerPhase {
    /// Valid phase transitions:
    /// - Connecting  -> Subscribed | Connecting
    /// - Subscribed  -> Idle
    /// - Idle        -> Processing | Stopping | Connecting
    /// - Processing  -> Idle | Stopping | Connecting
    /// - Stopping    -> Stopped
    pub fn can_transition_to(&self, next: WorkerPhase) -> bool {
        matches!(
            (self, next),
            (WorkerPhase::Connecting, WorkerPhase::Subscribed)
                | (WorkerPhase::Connecting, WorkerPhase::Connecting)
                | (WorkerPhase::Subscribed, WorkerPhase::Idle)
                | (WorkerPhase::Idle, WorkerPhase::Processing)
                | (WorkerPhase::Idle, WorkerPhase::Stopping)
                | (WorkerPhase::Idle, WorkerPhase::Connecting)
                | (WorkerPhase::Processing, WorkerPhase::Idle)
                | (WorkerPhase::Processing, WorkerPhase::Stopping)
                | (WorkerPhase::Processing, WorkerPhase::Connecting)
                | (WorkerPhase::Stopping, WorkerPhase::Stopped)
        )
    }
}

// ---------------------------------------------------------------------------
// StatusReporter
// ---------------------------------------------------------------------------

/// Where worker status messages go: the live broker connection, a test
/// channel, or nowhere.
#[derive(Clone)]
pub enum StatusReporter {
    Client(Arc<BrokerClient>),
    Channel(flume::Sender<StatusReport>),
    Silent,
}

impl StatusReporter {
    pub fn report(&self, agent_id: &str, activity: AgentActivity, message: Option<String>) {
        let report = StatusReport {
            agent_id: agent_id.to_string(),
            activity,
            message,
        };
        self.emit(events::AGENT_STATUS, report);
    }

    /// Behavior failures are broadcast as `agent:error` but never terminate
    /// the worker.
    pub fn report_error(&self, agent_id: &str, message: String) {
        let report = StatusReport {
            agent_id: agent_id.to_string(),
            activity: AgentActivity::Error,
            message: Some(message),
        };
        self.emit(events::AGENT_ERROR, report);
    }

    fn emit(&self, event: &str, report: StatusReport) {
        match self {
            StatusReporter::Client(client) => {
                let envelope = EventEnvelope::new(
                    event,
                    serde_json::to_value(&report).unwrap_or(Value::Null),
                );
                if let Err(e) = client.publish(topics::AGENTS, envelope.to_value()) {
                    debug!(error = %e, "status report not delivered");
                }
            }
            StatusReporter::Channel(tx) => {
                let _ = tx.send(report);
            }
            StatusReporter::Silent => {}
        }
    }
}

// ---------------------------------------------------------------------------
// TaskLoop
// ---------------------------------------------------------------------------

/// Why a task loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A stop message arrived; the current task was drained.
    Stopped,
    /// The subscription channels died; the runtime should reconnect.
    ConnectionLost,
}

enum ExecEnd {
    Finished(std::result::Result<TaskOutcome, String>),
    /// The stop grace expired mid-task; the row stays processing and will be
    /// re-claimed on the next run (at-least-once).
    Abandoned,
}

/// The worker's serial task-processing core.
///
/// On start it requeues its own interrupted processing rows, snapshots the
/// pending list (catch-up), and then drains an in-memory queue one task at a
/// time; live pushes append to the same queue. The claim CAS makes replayed
/// pushes harmless, and a task found terminal at claim time is skipped.
pub struct TaskLoop {
    pub agent: AgentRecord,
    pub queue: TaskQueue,
    pub behavior: Arc<dyn AgentBehavior>,
    pub tools: WorkerTools,
    pub reporter: StatusReporter,
    /// Bound on finishing the current task after a stop request.
    pub stop_grace: Duration,
}

impl TaskLoop {
    pub async fn run(
        &self,
        push_rx: flume::Receiver<Value>,
        stop_rx: flume::Receiver<Value>,
    ) -> Result<LoopExit> {
        let requeued = self.queue.reclaim_processing(&self.agent.id).await?;
        let pending = self.queue.list_pending(&self.agent.id).await?;
        let mut backlog: VecDeque<String> = pending.into_iter().map(|t| t.id).collect();
        info!(
            agent_id = %self.agent.id,
            requeued,
            backlog = backlog.len(),
            "catch-up complete"
        );
        self.reporter.report(&self.agent.id, AgentActivity::Idle, None);

        loop {
            if let Some(task_id) = backlog.pop_front() {
                // A stop that landed between tasks wins before the next claim.
                if stop_rx.try_recv().is_ok() {
                    return Ok(LoopExit::Stopped);
                }
                if self.run_one(&task_id, &stop_rx).await? {
                    info!(agent_id = %self.agent.id, "stop honored, exiting task loop");
                    return Ok(LoopExit::Stopped);
                }
                continue;
            }

            tokio::select! {
                push = push_rx.recv_async() => {
                    match push {
                        Ok(payload) => match serde_json::from_value::<TaskPush>(payload) {
                            Ok(push) => backlog.push_back(push.task_id),
                            Err(e) => warn!(agent_id = %self.agent.id, error = %e, "malformed task push"),
                        },
                        Err(_) => return Ok(LoopExit::ConnectionLost),
                    }
                }
                stop = stop_rx.recv_async() => {
                    return match stop {
                        Ok(_) => Ok(LoopExit::Stopped),
                        Err(_) => Ok(LoopExit::ConnectionLost),
                    };
                }
            }
        }
    }

    /// Claim and execute a single task. Returns `true` when a stop message
    /// arrived during execution.
    async fn run_one(&self, task_id: &str, stop_rx: &flume::Receiver<Value>) -> Result<bool> {
        let task = match self.queue.claim(task_id).await {
            Ok(task) => task,
            Err(TaskQueueError::Conflict { status, .. }) => {
                // Already claimed or terminal: a replayed push or catch-up
                // overlap. Skip and continue.
                info!(task_id = %task_id, %status, "skipping non-pending task");
                return Ok(false);
            }
            Err(TaskQueueError::NotFound(_)) => {
                warn!(task_id = %task_id, "pushed task no longer exists");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        info!(task_id = %task.id, task_type = %task.task_type, "task started");
        self.reporter.report(
            &self.agent.id,
            AgentActivity::Working,
            Some(format!("{} task {}", task.task_type, task.id)),
        );

        let exec = self.execute(&task);
        tokio::pin!(exec);
        let mut stop_requested = false;
        let end = tokio::select! {
            result = &mut exec => ExecEnd::Finished(result),
            _ = stop_rx.recv_async() => {
                stop_requested = true;
                info!(task_id = %task.id, grace = ?self.stop_grace, "stop requested, draining current task");
                match tokio::time::timeout(self.stop_grace, &mut exec).await {
                    Ok(result) => ExecEnd::Finished(result),
                    Err(_) => ExecEnd::Abandoned,
                }
            }
        };

        match end {
            ExecEnd::Finished(Ok(outcome)) if outcome.success => {
                self.queue.mark_completed(&task.id).await?;
                info!(task_id = %task.id, summary = outcome.summary.as_deref(), "task completed");
                if !stop_requested {
                    self.reporter.report(&self.agent.id, AgentActivity::Idle, None);
                }
            }
            ExecEnd::Finished(Ok(outcome)) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "behavior reported failure".to_string());
                self.queue.mark_failed(&task.id, &message).await?;
                // The error status stands until the next task reports
                // working; never overwrite it with an idle report.
                self.reporter.report_error(&self.agent.id, message.clone());
                warn!(task_id = %task.id, error = %message, "task failed");
            }
            ExecEnd::Finished(Err(message)) => {
                self.queue.mark_failed(&task.id, &message).await?;
                self.reporter.report_error(&self.agent.id, message.clone());
                error!(task_id = %task.id, error = %message, "task execution errored");
            }
            ExecEnd::Abandoned => {
                warn!(
                    task_id = %task.id,
                    "stop grace expired mid-task; leaving row processing for re-claim"
                );
            }
        }

        Ok(stop_requested)
    }

    /// Run the behavior, converting errors and panics into failure strings.
    async fn execute(&self, task: &Task) -> std::result::Result<TaskOutcome, String> {
        let ctx = TaskContext {
            task_id: task.id.clone(),
            task_type: task.task_type,
            payload: task.payload.clone(),
        };
        let fut = std::panic::AssertUnwindSafe(self.behavior.process(&ctx, &self.tools));
        match fut.catch_unwind().await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("behavior panicked".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerRuntime — connection management around the task loop
// ---------------------------------------------------------------------------

/// One worker process for one agent id.
///
/// Connects to the broker gateway, subscribes to its task and stop topics,
/// binds the subscription via RPC, then hands off to the task loop. Lost
/// connections reconnect with exponential backoff and re-run catch-up.
pub struct WorkerRuntime {
    store: Arc<StoreDb>,
    agent: AgentRecord,
    behavior: Arc<dyn AgentBehavior>,
    broker_url: String,
    stop_grace: Duration,
    reconnect_attempts: u32,
    reconnect_base: Duration,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<StoreDb>,
        agent: AgentRecord,
        behavior: Arc<dyn AgentBehavior>,
        broker_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent,
            behavior,
            broker_url: broker_url.into(),
            stop_grace: Duration::from_secs(30),
            reconnect_attempts: 5,
            reconnect_base: Duration::from_millis(500),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_reconnect(mut self, attempts: u32, base: Duration) -> Self {
        self.reconnect_attempts = attempts.max(5);
        self.reconnect_base = base;
        self
    }

    /// Run until stopped. Returns `Ok(())` on graceful stop; connection
    /// failure past the retry limit is an error.
    pub async fn run(&self) -> Result<()> {
        let mut phase = WorkerPhase::Connecting;
        loop {
            info!(agent_id = %self.agent.id, url = %self.broker_url, phase = %phase, "connecting to broker");
            let client = Arc::new(
                BrokerClient::connect_with_backoff(
                    &self.broker_url,
                    self.reconnect_attempts,
                    self.reconnect_base,
                )
                .await?,
            );

            let push_rx = client.subscribe(&topics::agent_tasks(&self.agent.id))?;
            let stop_rx = client.subscribe(&topics::agent_stop(&self.agent.id))?;

            // Bind the subscription server-side; best-effort, catch-up covers
            // the rest.
            if let Err(e) = client
                .rpc(
                    Method::Post,
                    &format!("/api/agents/{}/subscribe", self.agent.id),
                    Value::Null,
                    Duration::from_secs(10),
                )
                .await
            {
                warn!(agent_id = %self.agent.id, error = %e, "subscription binding failed");
            }
            phase = WorkerPhase::Subscribed;
            info!(agent_id = %self.agent.id, phase = %phase, "worker online");

            let task_loop = TaskLoop {
                agent: self.agent.clone(),
                queue: TaskQueue::new(self.store.clone()),
                behavior: self.behavior.clone(),
                tools: WorkerTools::connected(
                    self.store.clone(),
                    self.agent.clone(),
                    client.clone(),
                ),
                reporter: StatusReporter::Client(client.clone()),
                stop_grace: self.stop_grace,
            };

            match task_loop.run(push_rx, stop_rx).await? {
                LoopExit::Stopped => {
                    phase = WorkerPhase::Stopped;
                    info!(agent_id = %self.agent.id, phase = %phase, "worker stopped gracefully");
                    client.close();
                    return Ok(());
                }
                LoopExit::ConnectionLost => {
                    phase = WorkerPhase::Connecting;
                    warn!(agent_id = %self.agent.id, "broker connection lost, reconnecting");
                    client.close();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::TaskOutcome;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use fm_core::types::{AgentKind, TaskStatus, TaskType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records processing order and flags overlapping executions.
    struct RecordingBehavior {
        order: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail_on: Option<String>,
    }

    impl RecordingBehavior {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                order: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
                fail_on: None,
            })
        }
    }

    #[async_trait]
    impl AgentBehavior for RecordingBehavior {
        async fn process(
            &self,
            ctx: &TaskContext,
            _tools: &WorkerTools,
        ) -> anyhow::Result<TaskOutcome> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.order.lock().unwrap().push(ctx.task_id.clone());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on.as_deref() == Some(ctx.task_id.as_str()) {
                return Ok(TaskOutcome::failed("told to fail"));
            }
            Ok(TaskOutcome::ok("done"))
        }
    }

    struct Fixture {
        store: Arc<StoreDb>,
        queue: TaskQueue,
        agent: AgentRecord,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
        let agent = AgentRecord::new("Dev", AgentKind::Developer);
        store.insert_agent(&agent).await.unwrap();
        let queue = TaskQueue::new(store.clone());
        Fixture { store, queue, agent }
    }

    fn task_loop(f: &Fixture, behavior: Arc<dyn AgentBehavior>, grace: Duration) -> TaskLoop {
        TaskLoop {
            agent: f.agent.clone(),
            queue: f.queue.clone(),
            behavior,
            tools: WorkerTools::local(f.store.clone(), f.agent.clone()),
            reporter: StatusReporter::Silent,
            stop_grace: grace,
        }
    }

    #[tokio::test]
    async fn catch_up_processes_in_priority_then_age_order() {
        let f = fixture().await;
        let base = Utc::now();
        let mut high = fm_core::types::Task::new(&f.agent.id, TaskType::Mention, json!({}), 100);
        let mut mid = fm_core::types::Task::new(&f.agent.id, TaskType::Refinement, json!({}), 50);
        let mut late = fm_core::types::Task::new(&f.agent.id, TaskType::Manual, json!({}), 50);
        high.created_at = base;
        mid.created_at = base + ChronoDuration::seconds(1);
        late.created_at = base + ChronoDuration::seconds(2);
        for t in [&high, &mid, &late] {
            f.store.insert_task(t).await.unwrap();
        }

        let behavior = RecordingBehavior::new(Duration::from_millis(5));
        let task_loop = task_loop(&f, behavior.clone(), Duration::from_secs(30));
        let (_push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();

        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        // Wait for the backlog to drain, then stop.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if behavior.order.lock().unwrap().len() == 3 {
                break;
            }
        }
        stop_tx.send(json!({})).unwrap();
        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, LoopExit::Stopped);

        let order = behavior.order.lock().unwrap().clone();
        assert_eq!(order, vec![high.id.clone(), mid.id.clone(), late.id.clone()]);
        assert_eq!(behavior.max_in_flight.load(Ordering::SeqCst), 1);

        for t in [&high, &mid, &late] {
            let stored = f.store.get_task(&t.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn live_pushes_append_to_queue() {
        let f = fixture().await;
        let behavior = RecordingBehavior::new(Duration::from_millis(5));
        let task_loop = task_loop(&f, behavior.clone(), Duration::from_secs(30));
        let (push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        let task = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();
        push_tx
            .send(json!({"task_id": task.id, "task_type": "manual", "task_data": {}}))
            .unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !behavior.order.lock().unwrap().is_empty() {
                break;
            }
        }
        stop_tx.send(json!({})).unwrap();
        handle.await.unwrap().unwrap();

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn stop_drains_current_task_and_claims_no_more() {
        let f = fixture().await;
        let slow = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 10)
            .await
            .unwrap();
        let starved = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();

        let behavior = RecordingBehavior::new(Duration::from_millis(200));
        let task_loop = task_loop(&f, behavior.clone(), Duration::from_secs(30));
        let (_push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        // Let the first task start, then stop mid-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(json!({})).unwrap();
        let exit = handle.await.unwrap().unwrap();
        assert_eq!(exit, LoopExit::Stopped);

        let stored = f.store.get_task(&slow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed, "current task drains");
        let stored = f.store.get_task(&starved.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending, "no new work after stop");
    }

    #[tokio::test]
    async fn stop_grace_expiry_leaves_task_processing() {
        let f = fixture().await;
        let task = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();

        let behavior = RecordingBehavior::new(Duration::from_secs(5));
        let task_loop = task_loop(&f, behavior, Duration::from_millis(50));
        let (_push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        stop_tx.send(json!({})).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, LoopExit::Stopped);

        // Not finished within the grace: left processing for re-claim.
        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_task_push_is_skipped() {
        let f = fixture().await;
        let task = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();
        f.queue.mark_completed(&task.id).await.unwrap();

        let behavior = RecordingBehavior::new(Duration::from_millis(1));
        let task_loop = task_loop(&f, behavior.clone(), Duration::from_secs(30));
        let (push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        push_tx
            .send(json!({"task_id": task.id, "task_type": "manual", "task_data": {}}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(json!({})).unwrap();
        handle.await.unwrap().unwrap();

        assert!(behavior.order.lock().unwrap().is_empty(), "terminal task never executes");
    }

    #[tokio::test]
    async fn interrupted_processing_rows_are_reclaimed_on_start() {
        let f = fixture().await;
        let task = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();
        // Simulate a crash on a previous run: claimed but never finished.
        f.queue.claim(&task.id).await.unwrap();

        let behavior = RecordingBehavior::new(Duration::from_millis(1));
        let task_loop = task_loop(&f, behavior.clone(), Duration::from_secs(30));
        let (_push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !behavior.order.lock().unwrap().is_empty() {
                break;
            }
        }
        stop_tx.send(json!({})).unwrap();
        handle.await.unwrap().unwrap();

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_outcome_records_error_and_reports_it() {
        let f = fixture().await;
        let task = f
            .queue
            .enqueue(&f.agent.id, TaskType::Manual, json!({}), 0)
            .await
            .unwrap();

        let behavior = Arc::new(RecordingBehavior {
            order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
            fail_on: Some(task.id.clone()),
        });
        let (report_tx, report_rx) = flume::unbounded();
        let mut task_loop = task_loop(&f, behavior, Duration::from_secs(30));
        task_loop.reporter = StatusReporter::Channel(report_tx);

        let (_push_tx, push_rx) = flume::unbounded();
        let (stop_tx, stop_rx) = flume::unbounded();
        let handle = tokio::spawn(async move { task_loop.run(push_rx, stop_rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(json!({})).unwrap();
        handle.await.unwrap().unwrap();

        let stored = f.store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("told to fail"));

        // The error report is the final status: no trailing idle report may
        // overwrite it before the next task starts.
        let reports: Vec<StatusReport> = report_rx.drain().collect();
        let last = reports.last().expect("at least one report");
        assert_eq!(last.activity, AgentActivity::Error);
        assert_eq!(last.message.as_deref(), Some("told to fail"));
    }

    #[test]
    fn worker_phase_transitions() {
        assert!(WorkerPhase::Connecting.can_transition_to(WorkerPhase::Subscribed));
        assert!(WorkerPhase::Subscribed.can_transition_to(WorkerPhase::Idle));
        assert!(WorkerPhase::Idle.can_transition_to(WorkerPhase::Processing));
        assert!(WorkerPhase::Processing.can_transition_to(WorkerPhase::Stopping));
        assert!(WorkerPhase::Stopping.can_transition_to(WorkerPhase::Stopped));
        assert!(!WorkerPhase::Stopped.can_transition_to(WorkerPhase::Idle));
        assert!(!WorkerPhase::Idle.can_transition_to(WorkerPhase::Stopped));
    }
}
