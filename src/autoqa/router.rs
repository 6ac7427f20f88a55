//! Event → agent routing.
//!
//! For each incoming event the router resolves eligible published agents
//! through the registry, asks the runtime for a target instance (an idle
//! one when available, a fresh one while under `max_parallel_tasks`), and
//! dispatches the event as a task. Capacity overflow follows the agent's
//! goal kind: continuous agents buffer on a bounded per-instance queue,
//! on-demand agents drop with an `event.unhandled` emission — the same
//! emission a zero-match event gets, so observers can detect coverage gaps.

use crate::autoqa::event::{event_types, Event, EventPriority};
use crate::autoqa::event_bus::{EventBus, EventBusError, EventHandler};
use crate::autoqa::registry::{AgentRegistry, RegistryError};
use crate::autoqa::runtime::{AgentRuntime, AssignOutcome, RuntimeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Routing counters surfaced by [`EventRouter::stats`].
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub matched: u64,
    pub unmatched: u64,
    pub dropped: u64,
    pub per_type: HashMap<String, u64>,
}

/// Router errors.
#[derive(Debug)]
pub enum RouterError {
    Registry(RegistryError),
    Runtime(RuntimeError),
    Bus(EventBusError),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Registry(err) => write!(f, "Registry failure: {}", err),
            RouterError::Runtime(err) => write!(f, "Runtime failure: {}", err),
            RouterError::Bus(err) => write!(f, "Bus failure: {}", err),
        }
    }
}

impl Error for RouterError {}

impl RouterError {
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Registry(err) => err.kind(),
            RouterError::Runtime(err) => err.kind(),
            RouterError::Bus(err) => err.kind(),
        }
    }
}

/// The routing layer between the bus and the runtime.
pub struct EventRouter {
    registry: Arc<AgentRegistry>,
    runtime: Arc<AgentRuntime>,
    bus: Arc<EventBus>,
    stats: Mutex<RouterStats>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        runtime: Arc<AgentRuntime>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            runtime,
            bus,
            stats: Mutex::new(RouterStats::default()),
        })
    }

    /// Subscribe the router to every published event. Call once at startup.
    pub async fn attach(self: &Arc<Self>) {
        let handler = Arc::new(RouterHandler {
            router: Arc::downgrade(self),
        });
        self.bus.subscribe_all(handler).await;
    }

    /// Route one event to every eligible agent.
    pub async fn route(&self, event: &Event) -> Result<(), RouterError> {
        {
            let mut stats = self.stats.lock().await;
            *stats.per_type.entry(event.event_type.clone()).or_insert(0) += 1;
        }

        let definitions = self
            .registry
            .resolve_for_event(event)
            .await
            .map_err(RouterError::Registry)?;

        if definitions.is_empty() {
            self.stats.lock().await.unmatched += 1;
            self.emit_unhandled(event, "no matching agent").await?;
            return Ok(());
        }

        for definition in definitions {
            match self
                .runtime
                .assign(&definition, event.clone())
                .await
                .map_err(RouterError::Runtime)?
            {
                AssignOutcome::Dispatched { instance_id } => {
                    log::debug!(
                        "routed {} ({}) to instance {} of {}",
                        event.event_type,
                        event.id,
                        instance_id,
                        definition.id
                    );
                    self.stats.lock().await.matched += 1;
                }
                AssignOutcome::Buffered { instance_id } => {
                    log::debug!(
                        "buffered {} ({}) on instance {} of {}",
                        event.event_type,
                        event.id,
                        instance_id,
                        definition.id
                    );
                    self.stats.lock().await.matched += 1;
                }
                AssignOutcome::Dropped => {
                    log::warn!(
                        "dropped {} ({}) for {} at capacity",
                        event.event_type,
                        event.id,
                        definition.id
                    );
                    self.stats.lock().await.dropped += 1;
                    self.emit_unhandled(event, "instance queues at capacity")
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn emit_unhandled(&self, event: &Event, reason: &str) -> Result<(), RouterError> {
        // Never re-announce core chatter: an unhandled emission about an
        // unhandled (or lifecycle) event would feed back into the router
        // forever.
        if event.event_type == event_types::EVENT_UNHANDLED
            || event.event_type.starts_with("resource.")
            || event.event_type.starts_with("agent.")
        {
            return Ok(());
        }
        self.bus
            .publish(Event::new(
                event_types::EVENT_UNHANDLED,
                serde_json::json!({
                    "original_type": event.event_type,
                    "original_id": event.id,
                    "reason": reason,
                }),
                EventPriority::Low,
            ))
            .await
            .map(|_| ())
            .map_err(RouterError::Bus)
    }

    pub async fn stats(&self) -> RouterStats {
        self.stats.lock().await.clone()
    }
}

struct RouterHandler {
    router: Weak<EventRouter>,
}

#[async_trait]
impl EventHandler for RouterHandler {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        let router = match self.router.upgrade() {
            Some(router) => router,
            None => return Ok(()),
        };
        router
            .route(event)
            .await
            .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)
    }
}
