//! Agent runtime: parallel instance lifecycle and task dispatch.
//!
//! The runtime hosts many [`AgentInstance`]s (one worker task each) and is
//! the only component that mutates instance records. Each instance is a
//! state machine:
//!
//! ```text
//!   start ──▶ idle ──task dispatched──▶ running ──task done──▶ idle
//!               │ ▲                        │
//!             pause resume               fatal
//!               ▼ │                        ▼
//!             paused                     error
//!               │                          │
//!               └───────── stop ───────────┴──▶ stopped (terminal)
//! ```
//!
//! Tasks are cooperative: cancellation and pause take effect at the next
//! suspension point (after the in-flight LLM turn), never mid-call. A
//! persistence failure during a state write is fatal to the instance —
//! it parks in `error` until stopped, so in-memory and durable state can
//! never silently diverge.
//!
//! Dispatch back-pressure: every instance carries a bounded event queue.
//! A full queue drops for on-demand agents and (configurably) evicts the
//! oldest buffered entry for continuous agents.

use crate::autoqa::config::{AutoQAConfig, OverflowPolicy};
use crate::autoqa::event::{event_types, Event, EventPriority};
use crate::autoqa::event_bus::{EventBus, EventHandler, SubscriptionToken};
use crate::autoqa::llm::{LlmClient, TokenUsage};
use crate::autoqa::lock_manager::LockManager;
use crate::autoqa::registry::{AgentDefinition, AgentRegistry, GoalKind, RegistryError};
use crate::autoqa::result_cache::ToolResultCache;
use crate::autoqa::session_context::SessionContext;
use crate::autoqa::skill::SkillRegistry;
use crate::autoqa::store::{Store, StoreError};
use crate::autoqa::task_loop::{self, TaskEnv};
use crate::autoqa::tool::ToolDispatcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};

/// Lifecycle states of an agent instance. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Idle,
    Running,
    Paused,
    Error,
    Stopped,
}

/// Durable snapshot of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRow {
    pub instance_id: String,
    pub agent_id: String,
    pub version: String,
    pub state: InstanceState,
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_outcome: Option<String>,
}

/// One execution-history row, written when a task reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    pub instance_id: String,
    pub agent_id: String,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub tool_calls: usize,
    pub outcome: String,
}

/// What started a task.
#[derive(Debug, Clone)]
pub enum TaskTrigger {
    Event(Event),
    UserMessage(String),
}

impl TaskTrigger {
    /// The text handed to the LLM as the task's user message.
    pub fn message(&self) -> String {
        match self {
            TaskTrigger::UserMessage(text) => text.clone(),
            TaskTrigger::Event(event) => format!(
                "Handle event '{}' (priority {}) with payload:\n{}",
                event.event_type, event.priority, event.payload
            ),
        }
    }

    fn label(&self) -> String {
        match self {
            TaskTrigger::UserMessage(_) => "user_message".to_string(),
            TaskTrigger::Event(event) => format!("event:{}", event.event_type),
        }
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Terminal result of a task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed { text: String },
    Failed { reason: String },
    Cancelled,
}

impl TaskOutcome {
    pub fn label(&self) -> String {
        match self {
            TaskOutcome::Completed { .. } => "completed".to_string(),
            TaskOutcome::Failed { reason } => format!("failed: {}", reason),
            TaskOutcome::Cancelled => "cancelled".to_string(),
        }
    }

    pub fn task_state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed { .. } => TaskState::Completed,
            TaskOutcome::Failed { .. } => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

/// One entry in a task's tool-call log.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool: String,
    pub params: serde_json::Value,
    pub success: bool,
    pub cached: bool,
    pub at: DateTime<Utc>,
}

/// One unit of work dispatched to an instance.
pub struct Task {
    pub task_id: String,
    pub trigger: TaskTrigger,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub usage: TokenUsage,
    pub tool_call_log: Vec<ToolCallRecord>,
    pub child_tasks: Vec<String>,
    pub outcome: Option<TaskOutcome>,
    /// Delegated child tasks run against a clean session.
    pub delegated: bool,
    /// Agent ids already in the delegation chain (cycle detection).
    pub visited: HashSet<String>,
    completion: Option<oneshot::Sender<TaskOutcome>>,
}

impl Task {
    pub fn new(trigger: TaskTrigger) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            trigger,
            state: TaskState::Queued,
            started_at: None,
            ended_at: None,
            usage: TokenUsage::default(),
            tool_call_log: Vec::new(),
            child_tasks: Vec::new(),
            outcome: None,
            delegated: false,
            visited: HashSet::new(),
            completion: None,
        }
    }

    fn with_completion(mut self, tx: oneshot::Sender<TaskOutcome>) -> Self {
        self.completion = Some(tx);
        self
    }
}

/// Pause/cancel flags watched by every suspension point.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlSignal {
    pub paused: bool,
    pub cancelled: bool,
}

/// Shared state of one instance, owned by the runtime and its worker.
pub(crate) struct InstanceShared {
    pub instance_id: String,
    pub definition: AgentDefinition,
    pub state: RwLock<InstanceState>,
    pub current_task: RwLock<Option<String>>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: RwLock<DateTime<Utc>>,
    pub last_outcome: RwLock<Option<String>>,
    pub queue: Mutex<VecDeque<Task>>,
    pub queue_notify: Notify,
    pub control: watch::Sender<ControlSignal>,
    pub cache: ToolResultCache,
    pub session: Mutex<SessionContext>,
    pub subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl InstanceShared {
    pub async fn touch_heartbeat(&self) {
        *self.last_heartbeat.write().await = Utc::now();
    }

    async fn snapshot(&self) -> InstanceRow {
        InstanceRow {
            instance_id: self.instance_id.clone(),
            agent_id: self.definition.id.clone(),
            version: self.definition.version.clone(),
            state: *self.state.read().await,
            current_task: self.current_task.read().await.clone(),
            started_at: self.started_at,
            last_heartbeat: *self.last_heartbeat.read().await,
            last_outcome: self.last_outcome.read().await.clone(),
        }
    }
}

/// Point-in-time view of an instance, returned by `status`/`list_instances`.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub agent_id: String,
    pub version: String,
    pub state: InstanceState,
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub queued: usize,
    pub last_outcome: Option<String>,
}

/// Where a dispatch attempt landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Enqueued,
    /// Refused at capacity (on-demand policy, or DropNewest overflow).
    Dropped,
}

/// How the router's assignment attempt was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Dispatched to an idle instance (possibly freshly started).
    Dispatched { instance_id: String },
    /// All instances busy; buffered on an instance queue.
    Buffered { instance_id: String },
    /// Dropped at capacity.
    Dropped,
}

/// Runtime errors.
#[derive(Debug)]
pub enum RuntimeError {
    NotFound(String),
    Conflict(String),
    Registry(RegistryError),
    Storage(StoreError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotFound(what) => write!(f, "Not found: {}", what),
            RuntimeError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            RuntimeError::Registry(err) => write!(f, "Registry failure: {}", err),
            RuntimeError::Storage(err) => write!(f, "Storage failure: {}", err),
        }
    }
}

impl Error for RuntimeError {}

impl From<RegistryError> for RuntimeError {
    fn from(err: RegistryError) -> Self {
        RuntimeError::Registry(err)
    }
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Storage(err)
    }
}

impl RuntimeError {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::Conflict(_) => "conflict",
            RuntimeError::Registry(err) => err.kind(),
            RuntimeError::Storage(_) => "storage",
        }
    }
}

/// The agent runtime. Construct once with [`AgentRuntime::new`] and share
/// as `Arc`.
pub struct AgentRuntime {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillRegistry>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolDispatcher>,
    locks: Arc<LockManager>,
    config: AutoQAConfig,
    instances: RwLock<HashMap<String, Arc<InstanceShared>>>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillRegistry>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolDispatcher>,
        locks: Arc<LockManager>,
        config: AutoQAConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            skills,
            llm,
            tools,
            locks,
            config,
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Start a fresh instance of an agent. Returns the new instance id.
    pub async fn start_agent(
        self: &Arc<Self>,
        agent_id: &str,
        version: Option<&str>,
    ) -> Result<String, RuntimeError> {
        let record = self.registry.get(agent_id, version).await?;
        self.start_instance(record.definition).await
    }

    fn start_instance(
        self: &Arc<Self>,
        definition: AgentDefinition,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, RuntimeError>> + Send + '_>> {
        Box::pin(async move {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let (control, _) = watch::channel(ControlSignal::default());

        let shared = Arc::new(InstanceShared {
            instance_id: instance_id.clone(),
            definition,
            state: RwLock::new(InstanceState::Idle),
            current_task: RwLock::new(None),
            started_at: now,
            last_heartbeat: RwLock::new(now),
            last_outcome: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            control,
            cache: ToolResultCache::new(),
            session: Mutex::new(SessionContext::new()),
            subscriptions: Mutex::new(Vec::new()),
        });

        // The instance exists durably before it can observe anything.
        self.store.put_instance(shared.snapshot().await).await?;

        // Tools the dispatcher cannot describe are still advertised with a
        // bare name, but worth a trace per agent.
        for tool in &shared.definition.default_tools {
            if self.tools.describe(tool).await.is_none() {
                log::debug!(
                    "agent {} declares tool {} the dispatcher cannot describe",
                    shared.definition.id,
                    tool
                );
            }
        }

        // Subscribe the instance to its named event pools.
        {
            let mut tokens = shared.subscriptions.lock().await;
            for pool in &shared.definition.event_pools {
                let handler = Arc::new(PoolSubscriber {
                    runtime: Arc::downgrade(self),
                    instance_id: instance_id.clone(),
                });
                tokens.push(self.bus.subscribe(pool.clone(), handler).await);
            }
        }

        self.instances
            .write()
            .await
            .insert(instance_id.clone(), Arc::clone(&shared));

        let runtime = Arc::downgrade(self);
        let worker_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            worker_loop(runtime, worker_shared).await;
        });

        self.publish_lifecycle(
            event_types::AGENT_STARTED,
            &instance_id,
            &shared.definition.id,
            None,
        )
        .await;
        log::info!(
            "started instance {} of agent {} v{}",
            instance_id,
            shared.definition.id,
            shared.definition.version
        );
        Ok(instance_id)
        })
    }

    /// Request cooperative cancellation and teardown of an instance.
    pub async fn stop_agent(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let shared = self.get_shared(instance_id).await?;
        shared.control.send_modify(|signal| signal.cancelled = true);
        shared.queue_notify.notify_one();
        Ok(())
    }

    /// Park the instance at its next safe suspension point.
    pub async fn pause_agent(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let shared = self.get_shared(instance_id).await?;
        let state = *shared.state.read().await;
        if state == InstanceState::Stopped || state == InstanceState::Error {
            return Err(RuntimeError::Conflict(format!(
                "instance {} is {:?} and cannot be paused",
                instance_id, state
            )));
        }
        shared.control.send_modify(|signal| signal.paused = true);
        shared.queue_notify.notify_one();
        Ok(())
    }

    /// Continue a paused instance from its parked suspension point.
    pub async fn resume_agent(&self, instance_id: &str) -> Result<(), RuntimeError> {
        let shared = self.get_shared(instance_id).await?;
        shared.control.send_modify(|signal| signal.paused = false);
        shared.queue_notify.notify_one();
        Ok(())
    }

    /// Enqueue a task on a specific instance, honoring the queue bound.
    pub async fn dispatch(
        &self,
        instance_id: &str,
        task: Task,
    ) -> Result<DispatchOutcome, RuntimeError> {
        let shared = self.get_shared(instance_id).await?;
        self.dispatch_shared(&shared, task).await
    }

    async fn dispatch_shared(
        &self,
        shared: &Arc<InstanceShared>,
        task: Task,
    ) -> Result<DispatchOutcome, RuntimeError> {
        let state = *shared.state.read().await;
        if state == InstanceState::Stopped || state == InstanceState::Error {
            return Err(RuntimeError::Conflict(format!(
                "instance {} is {:?} and accepts no tasks",
                shared.instance_id, state
            )));
        }

        let depth = self.config.router.instance_queue_depth;
        let mut queue = shared.queue.lock().await;
        if queue.len() >= depth {
            match (shared.definition.goal.kind, self.config.router.continuous_overflow) {
                (GoalKind::OnDemand, _) | (GoalKind::Continuous, OverflowPolicy::DropNewest) => {
                    return Ok(DispatchOutcome::Dropped);
                }
                (GoalKind::Continuous, OverflowPolicy::DropOldest) => {
                    if let Some(evicted) = queue.pop_front() {
                        log::warn!(
                            "instance {} queue full; evicted oldest task {}",
                            shared.instance_id,
                            evicted.task_id
                        );
                    }
                }
            }
        }
        queue.push_back(task);
        drop(queue);
        shared.queue_notify.notify_one();
        Ok(DispatchOutcome::Enqueued)
    }

    /// Router entry point: pick or start an instance for `definition` and
    /// hand it the event.
    pub async fn assign(
        self: &Arc<Self>,
        definition: &AgentDefinition,
        event: Event,
    ) -> Result<AssignOutcome, RuntimeError> {
        let task = Task::new(TaskTrigger::Event(event));
        let candidates = self.instances_of(&definition.id).await;

        // An idle instance with an empty queue takes the task immediately.
        for shared in &candidates {
            if *shared.state.read().await == InstanceState::Idle
                && shared.queue.lock().await.is_empty()
            {
                let instance_id = shared.instance_id.clone();
                return match self.dispatch_shared(shared, task).await? {
                    DispatchOutcome::Enqueued => Ok(AssignOutcome::Dispatched { instance_id }),
                    DispatchOutcome::Dropped => Ok(AssignOutcome::Dropped),
                };
            }
        }

        if candidates.len() < definition.config.max_parallel_tasks {
            let instance_id = self.start_instance(definition.clone()).await?;
            let shared = self.get_shared(&instance_id).await?;
            return match self.dispatch_shared(&shared, task).await? {
                DispatchOutcome::Enqueued => Ok(AssignOutcome::Dispatched { instance_id }),
                DispatchOutcome::Dropped => Ok(AssignOutcome::Dropped),
            };
        }

        // At capacity. Continuous agents buffer; on-demand agents drop.
        if definition.goal.kind == GoalKind::OnDemand {
            return Ok(AssignOutcome::Dropped);
        }
        let mut shortest: Option<(usize, Arc<InstanceShared>)> = None;
        for shared in candidates {
            let len = shared.queue.lock().await.len();
            let better = shortest.as_ref().map(|(best, _)| len < *best).unwrap_or(true);
            if better {
                shortest = Some((len, shared));
            }
        }
        match shortest {
            Some((_, shared)) => {
                let instance_id = shared.instance_id.clone();
                match self.dispatch_shared(&shared, task).await? {
                    DispatchOutcome::Enqueued => Ok(AssignOutcome::Buffered { instance_id }),
                    DispatchOutcome::Dropped => Ok(AssignOutcome::Dropped),
                }
            }
            None => Ok(AssignOutcome::Dropped),
        }
    }

    /// Dispatch a user message and await the task's terminal outcome.
    pub async fn dispatch_and_wait(
        &self,
        instance_id: &str,
        message: impl Into<String>,
    ) -> Result<TaskOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        let task = Task::new(TaskTrigger::UserMessage(message.into())).with_completion(tx);
        match self.dispatch(instance_id, task).await? {
            DispatchOutcome::Enqueued => {}
            DispatchOutcome::Dropped => {
                return Err(RuntimeError::Conflict(format!(
                    "instance {} refused the task at capacity",
                    instance_id
                )))
            }
        }
        rx.await.map_err(|_| {
            RuntimeError::Conflict(format!(
                "instance {} terminated before the task completed",
                instance_id
            ))
        })
    }

    /// Run a delegated child task on the named agent and return its final
    /// text. The child sees only `message` — never the parent history.
    pub(crate) async fn delegate(
        self: &Arc<Self>,
        child_agent_id: &str,
        message: String,
        visited: HashSet<String>,
    ) -> Result<(String, String), RuntimeError> {
        if visited.contains(child_agent_id) {
            return Err(RuntimeError::Conflict(format!(
                "delegation cycle detected at agent {}",
                child_agent_id
            )));
        }

        let instance_id = match self.idle_instance_of(child_agent_id).await {
            Some(id) => id,
            None => self.start_agent(child_agent_id, None).await?,
        };

        let (tx, rx) = oneshot::channel();
        let mut task = Task::new(TaskTrigger::UserMessage(message)).with_completion(tx);
        task.delegated = true;
        task.visited = visited;
        let task_id = task.task_id.clone();

        match self.dispatch(&instance_id, task).await? {
            DispatchOutcome::Enqueued => {}
            DispatchOutcome::Dropped => {
                return Err(RuntimeError::Conflict(format!(
                    "child instance {} refused the delegated task",
                    instance_id
                )))
            }
        }

        let outcome = rx.await.map_err(|_| {
            RuntimeError::Conflict(format!(
                "child instance {} terminated before the delegated task completed",
                instance_id
            ))
        })?;
        let text = match outcome {
            TaskOutcome::Completed { text } => text,
            TaskOutcome::Failed { reason } => format!("Delegated task failed: {}", reason),
            TaskOutcome::Cancelled => "Delegated task was cancelled.".to_string(),
        };
        Ok((task_id, text))
    }

    async fn idle_instance_of(&self, agent_id: &str) -> Option<String> {
        for shared in self.instances_of(agent_id).await {
            if *shared.state.read().await == InstanceState::Idle
                && shared.queue.lock().await.is_empty()
            {
                return Some(shared.instance_id.clone());
            }
        }
        None
    }

    async fn instances_of(&self, agent_id: &str) -> Vec<Arc<InstanceShared>> {
        let instances = self.instances.read().await;
        let mut found = Vec::new();
        for shared in instances.values() {
            if shared.definition.id != agent_id {
                continue;
            }
            let state = *shared.state.read().await;
            if state != InstanceState::Stopped && state != InstanceState::Error {
                found.push(Arc::clone(shared));
            }
        }
        found
    }

    async fn get_shared(&self, instance_id: &str) -> Result<Arc<InstanceShared>, RuntimeError> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("instance {}", instance_id)))
    }

    /// Snapshot every instance, optionally filtered by state.
    pub async fn list_instances(&self, filter: Option<InstanceState>) -> Vec<InstanceStatus> {
        let instances = self.instances.read().await;
        let mut out = Vec::new();
        for shared in instances.values() {
            let status = self.status_of(shared).await;
            if filter.map(|f| status.state == f).unwrap_or(true) {
                out.push(status);
            }
        }
        out
    }

    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus, RuntimeError> {
        let shared = self.get_shared(instance_id).await?;
        Ok(self.status_of(&shared).await)
    }

    async fn status_of(&self, shared: &Arc<InstanceShared>) -> InstanceStatus {
        InstanceStatus {
            instance_id: shared.instance_id.clone(),
            agent_id: shared.definition.id.clone(),
            version: shared.definition.version.clone(),
            state: *shared.state.read().await,
            current_task: shared.current_task.read().await.clone(),
            started_at: shared.started_at,
            last_heartbeat: *shared.last_heartbeat.read().await,
            queued: shared.queue.lock().await.len(),
            last_outcome: shared.last_outcome.read().await.clone(),
        }
    }

    async fn publish_lifecycle(
        &self,
        event_type: &str,
        instance_id: &str,
        agent_id: &str,
        task_id: Option<&str>,
    ) {
        let mut payload = serde_json::json!({
            "instance_id": instance_id,
            "agent_id": agent_id,
        });
        if let Some(task_id) = task_id {
            payload["task_id"] = serde_json::json!(task_id);
        }
        let event = Event::new(event_type, payload, EventPriority::Normal);
        if let Err(err) = self.bus.publish(event).await {
            log::warn!("could not publish {} for {}: {}", event_type, instance_id, err);
        }
    }

    fn task_env(self: &Arc<Self>) -> TaskEnv {
        TaskEnv {
            llm: Arc::clone(&self.llm),
            tools: Arc::clone(&self.tools),
            skills: Arc::clone(&self.skills),
            config: self.config.task_loop.clone(),
            runtime: Arc::downgrade(self),
        }
    }
}

/// Bus handler that feeds an instance's event-pool subscriptions into its
/// task queue. Idempotent per event id: the instance's queue and session
/// only ever see one task per event because dispatch is keyed off this
/// single subscription.
struct PoolSubscriber {
    runtime: Weak<AgentRuntime>,
    instance_id: String,
}

#[async_trait]
impl EventHandler for PoolSubscriber {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        let runtime = match self.runtime.upgrade() {
            Some(runtime) => runtime,
            None => return Ok(()),
        };
        let task = Task::new(TaskTrigger::Event(event.clone()));
        match runtime.dispatch(&self.instance_id, task).await {
            Ok(_) => Ok(()),
            Err(err) => Err(Box::new(err) as Box<dyn Error + Send + Sync>),
        }
    }
}

/// Persist the instance snapshot; `Err` is the fatal divergence case.
async fn persist(shared: &Arc<InstanceShared>, store: &Arc<dyn Store>) -> Result<(), StoreError> {
    store.put_instance(shared.snapshot().await).await
}

async fn set_state(
    shared: &Arc<InstanceShared>,
    store: &Arc<dyn Store>,
    state: InstanceState,
) -> Result<(), StoreError> {
    *shared.state.write().await = state;
    persist(shared, store).await
}

/// The per-instance worker: pops tasks, runs the task loop, and owns every
/// state transition of its instance.
async fn worker_loop(runtime: Weak<AgentRuntime>, shared: Arc<InstanceShared>) {
    let mut control = shared.control.subscribe();
    let mut fatal = false;

    loop {
        shared.touch_heartbeat().await;
        let signal = *control.borrow();
        if signal.cancelled {
            break;
        }

        let runtime = match runtime.upgrade() {
            Some(runtime) => runtime,
            None => return,
        };

        if signal.paused {
            if *shared.state.read().await != InstanceState::Paused {
                if set_state(&shared, &runtime.store, InstanceState::Paused)
                    .await
                    .is_err()
                {
                    fatal = true;
                    break;
                }
            }
            drop(runtime);
            let _ = control.changed().await;
            continue;
        }

        if *shared.state.read().await == InstanceState::Paused {
            if set_state(&shared, &runtime.store, InstanceState::Idle)
                .await
                .is_err()
            {
                fatal = true;
                break;
            }
        }

        let next = shared.queue.lock().await.pop_front();
        let mut task = match next {
            Some(task) => task,
            None => {
                drop(runtime);
                tokio::select! {
                    _ = shared.queue_notify.notified() => {}
                    _ = control.changed() => {}
                }
                continue;
            }
        };

        // idle → running
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        *shared.current_task.write().await = Some(task.task_id.clone());
        if set_state(&shared, &runtime.store, InstanceState::Running)
            .await
            .is_err()
        {
            fatal = true;
            break;
        }
        runtime
            .publish_lifecycle(
                event_types::TASK_STARTED,
                &shared.instance_id,
                &shared.definition.id,
                Some(&task.task_id),
            )
            .await;

        let env = runtime.task_env();
        let outcome = task_loop::run_task(&env, &shared, &mut task, control.clone()).await;

        task.ended_at = Some(Utc::now());
        task.state = outcome.task_state();
        task.outcome = Some(outcome.clone());
        *shared.last_outcome.write().await = Some(outcome.label());

        let record = ExecutionRecord {
            task_id: task.task_id.clone(),
            instance_id: shared.instance_id.clone(),
            agent_id: shared.definition.id.clone(),
            trigger: task.trigger.label(),
            started_at: task.started_at.unwrap_or(shared.started_at),
            ended_at: task.ended_at.unwrap_or_else(Utc::now),
            input_tokens: task.usage.input_tokens,
            output_tokens: task.usage.output_tokens,
            tool_calls: task.tool_call_log.len(),
            outcome: outcome.label(),
        };
        if let Err(err) = runtime.store.append_execution(record).await {
            log::error!(
                "instance {} could not record execution history: {}",
                shared.instance_id,
                err
            );
            fatal = true;
        }

        if let TaskTrigger::Event(event) = &task.trigger {
            runtime
                .bus
                .mark_processed(&event.id, &shared.definition.id)
                .await;
        }

        let lifecycle = match &outcome {
            TaskOutcome::Completed { .. } => event_types::TASK_COMPLETED,
            _ => event_types::TASK_FAILED,
        };
        runtime
            .publish_lifecycle(
                lifecycle,
                &shared.instance_id,
                &shared.definition.id,
                Some(&task.task_id),
            )
            .await;

        if let Some(tx) = task.completion.take() {
            let _ = tx.send(outcome.clone());
        }

        if fatal {
            break;
        }

        // running → idle (failure stays on the task, not the instance)
        *shared.current_task.write().await = None;
        if set_state(&shared, &runtime.store, InstanceState::Idle)
            .await
            .is_err()
        {
            fatal = true;
            break;
        }
    }

    let runtime = runtime.upgrade();

    if fatal {
        *shared.state.write().await = InstanceState::Error;
        log::error!(
            "instance {} entered error state after a persistence failure; stop_agent required",
            shared.instance_id
        );
        // Park until stopped; durable state is already suspect, so no
        // further writes are attempted.
        loop {
            if control.borrow().cancelled {
                break;
            }
            if control.changed().await.is_err() {
                break;
            }
        }
    }

    // Teardown: release locks, drop subscriptions, terminal state.
    if let Some(runtime) = runtime {
        if let Err(err) = runtime.locks.release_owned(&shared.instance_id).await {
            log::warn!(
                "instance {} could not release owned locks: {}",
                shared.instance_id,
                err
            );
        }
        for token in shared.subscriptions.lock().await.drain(..) {
            runtime.bus.unsubscribe(&token).await;
        }

        // Drain queued tasks as cancelled so waiters are not left hanging.
        let mut queue = shared.queue.lock().await;
        while let Some(mut task) = queue.pop_front() {
            task.state = TaskState::Cancelled;
            if let Some(tx) = task.completion.take() {
                let _ = tx.send(TaskOutcome::Cancelled);
            }
        }
        drop(queue);

        *shared.state.write().await = InstanceState::Stopped;
        *shared.current_task.write().await = None;
        if let Err(err) = persist(&shared, &runtime.store).await {
            log::warn!(
                "instance {} could not persist terminal state: {}",
                shared.instance_id,
                err
            );
        }
        runtime
            .publish_lifecycle(
                event_types::AGENT_STOPPED,
                &shared.instance_id,
                &shared.definition.id,
                None,
            )
            .await;
        log::info!("instance {} stopped", shared.instance_id);
    } else {
        *shared.state.write().await = InstanceState::Stopped;
    }
}
