//! Priority event bus with durable logging and pub/sub delivery.
//!
//! `publish` is **persist-then-fanout**: the event row is appended to the
//! store before any subscriber sees it, so post-crash `replay` can always
//! reconstruct what was delivered. Delivery is at-least-once per
//! subscriber; handlers must be idempotent with respect to the event id.
//!
//! Priority is metadata — the bus never reorders fan-out on it. Handlers
//! for one event run concurrently with no cross-handler ordering; a
//! subscriber that needs publish-order observation registers with
//! [`subscribe_serial`](EventBus::subscribe_serial), which drains its
//! events through a dedicated worker.
//!
//! An optional [`EventTransport`] relays every published event to other
//! runtime processes. The transport is treated as lossy: relay failures are
//! retried with bounded backoff and then dropped — the persisted log, not
//! the transport, is the source of truth.
//!
//! # Example
//!
//! ```rust,no_run
//! use autoqa::event::{Event, EventPriority};
//! use autoqa::event_bus::{EventBus, EventHandler};
//! use autoqa::store::MemoryStore;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn handle(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!         println!("{} -> {}", event.event_type, event.payload);
//!         Ok(())
//!     }
//! }
//!
//! # async {
//! let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
//! bus.subscribe("alert.blackscreen", Arc::new(Printer)).await;
//! bus.publish(Event::new(
//!     "alert.blackscreen",
//!     serde_json::json!({"device_id": "d1"}),
//!     EventPriority::Critical,
//! )).await.unwrap();
//! # };
//! ```

use crate::autoqa::config::BusConfig;
use crate::autoqa::event::Event;
use crate::autoqa::store::{Store, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// Key under which routing-layer subscribers observe every event.
const WILDCARD: &str = "*";

/// Receives events from the bus. Errors are logged and isolated to the
/// failing subscriber.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// External pub/sub relay so other runtime processes observe publishes.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn relay(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Handle returned by the subscribe calls; pass to
/// [`unsubscribe`](EventBus::unsubscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionToken {
    id: String,
    event_type: String,
}

enum DeliveryMode {
    Concurrent(Arc<dyn EventHandler>),
    Serial(mpsc::UnboundedSender<Event>),
}

struct Subscriber {
    id: String,
    mode: DeliveryMode,
}

/// Counters surfaced by [`EventBus::stats`].
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub per_type: HashMap<String, u64>,
}

/// Errors surfaced by `publish`/`replay`.
#[derive(Debug)]
pub enum EventBusError {
    StorageUnavailable(StoreError),
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBusError::StorageUnavailable(err) => {
                write!(f, "Storage unavailable: {}", err)
            }
        }
    }
}

impl Error for EventBusError {}

impl EventBusError {
    pub fn kind(&self) -> &'static str {
        "storage_unavailable"
    }
}

/// The in-process event bus.
pub struct EventBus {
    store: Arc<dyn Store>,
    transport: RwLock<Option<Arc<dyn EventTransport>>>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    stats: Arc<Mutex<BusStats>>,
    config: BusConfig,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, config: BusConfig) -> Self {
        Self {
            store,
            transport: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            stats: Arc::new(Mutex::new(BusStats::default())),
            config,
        }
    }

    /// Attach the external relay. May be set once at startup.
    pub async fn set_transport(&self, transport: Arc<dyn EventTransport>) {
        *self.transport.write().await = Some(transport);
    }

    /// Persist and fan out an event. Returns the event id.
    ///
    /// Persistence failure aborts the publish ("storage unavailable") and
    /// nothing is delivered. Transport failure after successful persistence
    /// never fails the publish: in-process delivery proceeds and the relay
    /// retries in the background with doubling backoff.
    pub async fn publish(&self, event: Event) -> Result<String, EventBusError> {
        self.store
            .append_event(&event)
            .await
            .map_err(EventBusError::StorageUnavailable)?;

        {
            let mut stats = self.stats.lock().await;
            stats.published += 1;
            *stats.per_type.entry(event.event_type.clone()).or_insert(0) += 1;
        }

        self.fan_out(&event).await;
        self.relay(&event).await;
        Ok(event.id)
    }

    async fn fan_out(&self, event: &Event) {
        let subscribers = self.subscribers.read().await;
        let exact = subscribers.get(&event.event_type);
        let wildcard = subscribers.get(WILDCARD);
        for subscriber in exact.iter().chain(wildcard.iter()).flat_map(|v| v.iter()) {
            let delivered = match &subscriber.mode {
                DeliveryMode::Concurrent(handler) => {
                    let handler = Arc::clone(handler);
                    let event = event.clone();
                    let stats = Arc::clone(&self.stats);
                    let sub_id = subscriber.id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler.handle(&event).await {
                            log::warn!(
                                "subscriber {} failed handling {} ({}): {}",
                                sub_id,
                                event.event_type,
                                event.id,
                                err
                            );
                            stats.lock().await.handler_errors += 1;
                        }
                    });
                    true
                }
                DeliveryMode::Serial(tx) => {
                    if tx.send(event.clone()).is_err() {
                        log::warn!(
                            "serial subscriber {} dropped its channel; event {} not delivered",
                            subscriber.id,
                            event.id
                        );
                        false
                    } else {
                        true
                    }
                }
            };
            if delivered {
                self.stats.lock().await.delivered += 1;
            }
        }
    }

    async fn relay(&self, event: &Event) {
        let transport = match self.transport.read().await.clone() {
            Some(t) => t,
            None => return,
        };
        let event = event.clone();
        let retries = self.config.transport_retries;
        let mut backoff = self.config.transport_backoff;
        tokio::spawn(async move {
            for attempt in 0..=retries {
                match transport.relay(&event).await {
                    Ok(()) => return,
                    Err(err) => {
                        if attempt == retries {
                            log::error!(
                                "transport relay of {} gave up after {} attempts: {}",
                                event.id,
                                retries + 1,
                                err
                            );
                            return;
                        }
                        log::debug!("transport relay of {} failed, retrying: {}", event.id, err);
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        });
    }

    /// Register a handler for one exact event type; invocations for
    /// distinct events run concurrently.
    pub async fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionToken {
        self.register(event_type.into(), DeliveryMode::Concurrent(handler))
            .await
    }

    /// Register a handler with serial semantics: events it observes are
    /// processed one at a time in arrival order by a dedicated worker.
    pub async fn subscribe_serial(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionToken {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = handler.handle(&event).await {
                    log::warn!(
                        "serial subscriber failed handling {} ({}): {}",
                        event.event_type,
                        event.id,
                        err
                    );
                    stats.lock().await.handler_errors += 1;
                }
            }
        });
        self.register(event_type.into(), DeliveryMode::Serial(tx))
            .await
    }

    /// Observe every published event regardless of type. This is the hook
    /// the routing layer uses; ordinary consumers subscribe by exact type.
    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        self.register(WILDCARD.to_string(), DeliveryMode::Concurrent(handler))
            .await
    }

    async fn register(&self, event_type: String, mode: DeliveryMode) -> SubscriptionToken {
        let id = Uuid::new_v4().to_string();
        let token = SubscriptionToken {
            id: id.clone(),
            event_type: event_type.clone(),
        };
        self.subscribers
            .write()
            .await
            .entry(event_type)
            .or_insert_with(Vec::new)
            .push(Subscriber { id, mode });
        token
    }

    /// Remove a subscription. Returns false when the token is unknown
    /// (already removed).
    pub async fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(&token.event_type) {
            let before = list.len();
            list.retain(|s| s.id != token.id);
            return list.len() != before;
        }
        false
    }

    /// Read the durable log back, optionally filtered by exact type.
    pub async fn replay(
        &self,
        since: DateTime<Utc>,
        type_filter: Option<&str>,
    ) -> Result<Vec<Event>, EventBusError> {
        self.store
            .events_since(since, type_filter)
            .await
            .map_err(EventBusError::StorageUnavailable)
    }

    /// Annotate the log row once a consumer has finished with the event.
    pub async fn mark_processed(&self, event_id: &str, agent_id: &str) {
        if let Err(err) = self.store.mark_event_processed(event_id, agent_id).await {
            log::debug!("could not mark event {} processed: {}", event_id, err);
        }
    }

    pub async fn stats(&self) -> BusStats {
        self.stats.lock().await.clone()
    }
}
