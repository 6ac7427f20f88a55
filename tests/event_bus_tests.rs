use async_trait::async_trait;
use autoqa::analysis::{AnalysisTask, ResultClassification};
use autoqa::config::BusConfig;
use autoqa::lock_manager::{LockRow, WaiterRow};
use autoqa::registry::DefinitionRecord;
use autoqa::runtime::{ExecutionRecord, InstanceRow};
use autoqa::store::StoreError;
use autoqa::{Event, EventBus, EventHandler, EventPriority, EventTransport, MemoryStore, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.seen.lock().await.push(event.id.clone());
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        Err("handler exploded".into())
    }
}

/// Transport that fails a configured number of times before accepting.
struct FlakyTransport {
    failures_left: AtomicUsize,
    relayed: Mutex<Vec<String>>,
}

#[async_trait]
impl EventTransport for FlakyTransport {
    async fn relay(&self, event: &Event) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("transport down".into());
        }
        self.relayed.lock().await.push(event.id.clone());
        Ok(())
    }
}

/// Store wrapper whose event-log append can be switched off.
struct FailStore {
    inner: MemoryStore,
    fail_appends: AtomicBool,
}

#[async_trait]
impl Store for FailStore {
    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("event log offline".into()));
        }
        self.inner.append_event(event).await
    }
    async fn mark_event_processed(&self, e: &str, a: &str) -> Result<(), StoreError> {
        self.inner.mark_event_processed(e, a).await
    }
    async fn events_since(
        &self,
        since: DateTime<Utc>,
        filter: Option<&str>,
    ) -> Result<Vec<Event>, StoreError> {
        self.inner.events_since(since, filter).await
    }
    async fn get_lock(&self, r: &str) -> Result<Option<LockRow>, StoreError> {
        self.inner.get_lock(r).await
    }
    async fn put_lock(&self, row: LockRow) -> Result<(), StoreError> {
        self.inner.put_lock(row).await
    }
    async fn delete_lock(&self, r: &str) -> Result<(), StoreError> {
        self.inner.delete_lock(r).await
    }
    async fn list_locks(&self) -> Result<Vec<LockRow>, StoreError> {
        self.inner.list_locks().await
    }
    async fn push_waiter(&self, row: WaiterRow) -> Result<(), StoreError> {
        self.inner.push_waiter(row).await
    }
    async fn remove_waiter(&self, r: &str, o: &str) -> Result<(), StoreError> {
        self.inner.remove_waiter(r, o).await
    }
    async fn waiters_for(&self, r: &str) -> Result<Vec<WaiterRow>, StoreError> {
        self.inner.waiters_for(r).await
    }
    async fn put_definition(&self, record: DefinitionRecord) -> Result<(), StoreError> {
        self.inner.put_definition(record).await
    }
    async fn get_definition(
        &self,
        a: &str,
        v: &str,
    ) -> Result<Option<DefinitionRecord>, StoreError> {
        self.inner.get_definition(a, v).await
    }
    async fn list_definitions(
        &self,
        a: Option<&str>,
    ) -> Result<Vec<DefinitionRecord>, StoreError> {
        self.inner.list_definitions(a).await
    }
    async fn list_versions(&self, a: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_versions(a).await
    }
    async fn delete_definition(&self, a: &str, v: &str) -> Result<(), StoreError> {
        self.inner.delete_definition(a, v).await
    }
    async fn definitions_for_trigger(
        &self,
        t: &str,
    ) -> Result<Vec<DefinitionRecord>, StoreError> {
        self.inner.definitions_for_trigger(t).await
    }
    async fn put_instance(&self, row: InstanceRow) -> Result<(), StoreError> {
        self.inner.put_instance(row).await
    }
    async fn get_instance(&self, i: &str) -> Result<Option<InstanceRow>, StoreError> {
        self.inner.get_instance(i).await
    }
    async fn list_instances(&self) -> Result<Vec<InstanceRow>, StoreError> {
        self.inner.list_instances().await
    }
    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.inner.append_execution(record).await
    }
    async fn executions_for(&self, i: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.executions_for(i).await
    }
    async fn enqueue_analysis(&self, q: &str, task: AnalysisTask) -> Result<(), StoreError> {
        self.inner.enqueue_analysis(q, task).await
    }
    async fn pop_analysis(&self, q: &str) -> Result<Option<AnalysisTask>, StoreError> {
        self.inner.pop_analysis(q).await
    }
    async fn analysis_queue_len(&self, q: &str) -> Result<usize, StoreError> {
        self.inner.analysis_queue_len(q).await
    }
    async fn put_classification(&self, row: ResultClassification) -> Result<(), StoreError> {
        self.inner.put_classification(row).await
    }
    async fn get_classification(
        &self,
        s: &str,
    ) -> Result<Option<ResultClassification>, StoreError> {
        self.inner.get_classification(s).await
    }
}

fn event(event_type: &str) -> Event {
    Event::new(event_type, serde_json::json!({"n": 1}), EventPriority::Normal)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn publish_persists_before_fanout_and_replay_returns_the_event() {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(store, Default::default());
    let before = Utc::now() - ChronoDuration::seconds(1);

    let id = bus.publish(event("alert.blackscreen")).await.unwrap();

    let replayed = bus.replay(before, None).await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].id, id);
    assert_eq!(replayed[0].event_type, "alert.blackscreen");

    let filtered = bus.replay(before, Some("alert.blackscreen")).await.unwrap();
    assert_eq!(filtered.len(), 1);
    assert!(bus.replay(before, Some("other.type")).await.unwrap().is_empty());
}

#[tokio::test]
async fn storage_failure_fails_publish_and_delivers_nothing() {
    let store = Arc::new(FailStore {
        inner: MemoryStore::new(),
        fail_appends: AtomicBool::new(true),
    });
    let bus = EventBus::new(store, Default::default());
    let recorder = Recorder::new();
    bus.subscribe("alert.blackscreen", recorder.clone()).await;

    let err = bus.publish(event("alert.blackscreen")).await.unwrap_err();
    assert_eq!(err.kind(), "storage_unavailable");

    settle().await;
    assert!(recorder.seen.lock().await.is_empty());
}

#[tokio::test]
async fn delivery_is_keyed_by_exact_event_type() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let alerts = Recorder::new();
    let builds = Recorder::new();
    bus.subscribe("alert.blackscreen", alerts.clone()).await;
    bus.subscribe("build.deployed", builds.clone()).await;

    bus.publish(event("alert.blackscreen")).await.unwrap();
    settle().await;

    assert_eq!(alerts.seen.lock().await.len(), 1);
    assert!(builds.seen.lock().await.is_empty());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let recorder = Recorder::new();
    let token = bus.subscribe("alert.blackscreen", recorder.clone()).await;

    bus.publish(event("alert.blackscreen")).await.unwrap();
    settle().await;
    assert_eq!(recorder.seen.lock().await.len(), 1);

    assert!(bus.unsubscribe(&token).await);
    assert!(!bus.unsubscribe(&token).await);

    bus.publish(event("alert.blackscreen")).await.unwrap();
    settle().await;
    assert_eq!(recorder.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn serial_subscribers_observe_publish_order() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let recorder = Recorder::new();
    bus.subscribe_serial("alert.blackscreen", recorder.clone()).await;

    let mut published = Vec::new();
    for _ in 0..20 {
        published.push(bus.publish(event("alert.blackscreen")).await.unwrap());
    }
    settle().await;

    assert_eq!(*recorder.seen.lock().await, published);
}

#[tokio::test]
async fn failing_subscriber_does_not_affect_others() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let recorder = Recorder::new();
    bus.subscribe("alert.blackscreen", Arc::new(FailingHandler)).await;
    bus.subscribe("alert.blackscreen", recorder.clone()).await;

    bus.publish(event("alert.blackscreen")).await.unwrap();
    settle().await;

    assert_eq!(recorder.seen.lock().await.len(), 1);
    let stats = bus.stats().await;
    assert_eq!(stats.handler_errors, 1);
}

#[tokio::test]
async fn transport_failure_is_retried_and_never_blocks_local_delivery() {
    let bus = EventBus::new(
        Arc::new(MemoryStore::new()),
        BusConfig {
            transport_retries: 5,
            transport_backoff: Duration::from_millis(5),
        },
    );
    let transport = Arc::new(FlakyTransport {
        failures_left: AtomicUsize::new(2),
        relayed: Mutex::new(Vec::new()),
    });
    bus.set_transport(transport.clone()).await;

    let recorder = Recorder::new();
    bus.subscribe("alert.blackscreen", recorder.clone()).await;

    let id = bus.publish(event("alert.blackscreen")).await.unwrap();
    settle().await;
    assert_eq!(recorder.seen.lock().await.len(), 1);

    // The relay succeeds after its bounded retries.
    for _ in 0..50 {
        if !transport.relayed.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*transport.relayed.lock().await, vec![id]);
}

#[tokio::test]
async fn stats_count_publishes_and_deliveries() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let recorder = Recorder::new();
    bus.subscribe("alert.blackscreen", recorder.clone()).await;

    bus.publish(event("alert.blackscreen")).await.unwrap();
    bus.publish(event("build.deployed")).await.unwrap();
    settle().await;

    let stats = bus.stats().await;
    assert_eq!(stats.published, 2);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.per_type.get("alert.blackscreen"), Some(&1));
    assert_eq!(stats.per_type.get("build.deployed"), Some(&1));
}

#[tokio::test]
async fn wildcard_subscribers_observe_every_type() {
    let bus = EventBus::new(Arc::new(MemoryStore::new()), Default::default());
    let recorder = Recorder::new();
    bus.subscribe_all(recorder.clone()).await;

    bus.publish(event("alert.blackscreen")).await.unwrap();
    bus.publish(event("build.deployed")).await.unwrap();
    settle().await;

    assert_eq!(recorder.seen.lock().await.len(), 2);
}
