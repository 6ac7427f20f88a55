//! Persistence adapter.
//!
//! Typed CRUD over the event log, lock rows, the definition registry,
//! instance records, execution history, and the analysis queue. The real
//! driver (Postgres, SQLite, whatever the deployment uses) lives outside
//! the core behind the [`Store`] trait; [`MemoryStore`] is the bundled
//! in-process implementation used by tests and single-node setups.
//!
//! Components never reach across each other's rows: the bus owns the event
//! log, the lock manager owns lock/waiter rows, the registry owns
//! definition rows, the runtime owns instance and execution rows.

use crate::autoqa::analysis::{AnalysisTask, ResultClassification};
use crate::autoqa::event::Event;
use crate::autoqa::lock_manager::{LockRow, WaiterRow};
use crate::autoqa::registry::DefinitionRecord;
use crate::autoqa::runtime::{ExecutionRecord, InstanceRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use tokio::sync::RwLock;

/// Persistence failures. `Unavailable` is the fatal kind: a state write
/// that hits it poisons the owning instance (see the runtime).
#[derive(Debug, Clone)]
pub enum StoreError {
    Unavailable(String),
    NotFound(String),
    Conflict(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            StoreError::NotFound(what) => write!(f, "Row not found: {}", what),
            StoreError::Conflict(msg) => write!(f, "Storage conflict: {}", msg),
        }
    }
}

impl Error for StoreError {}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "storage_unavailable",
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
        }
    }
}

/// Typed CRUD surface over the core's persisted state.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Event log (append-only) ──────────────────────────────────────────
    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;
    async fn mark_event_processed(&self, event_id: &str, agent_id: &str)
        -> Result<(), StoreError>;
    async fn events_since(
        &self,
        since: DateTime<Utc>,
        type_filter: Option<&str>,
    ) -> Result<Vec<Event>, StoreError>;

    // ── Resource locks ───────────────────────────────────────────────────
    async fn get_lock(&self, resource_id: &str) -> Result<Option<LockRow>, StoreError>;
    async fn put_lock(&self, row: LockRow) -> Result<(), StoreError>;
    async fn delete_lock(&self, resource_id: &str) -> Result<(), StoreError>;
    async fn list_locks(&self) -> Result<Vec<LockRow>, StoreError>;
    async fn push_waiter(&self, row: WaiterRow) -> Result<(), StoreError>;
    async fn remove_waiter(&self, resource_id: &str, owner_id: &str) -> Result<(), StoreError>;
    /// Waiters for a resource in strict `(priority rank asc, queued_at asc)`
    /// order.
    async fn waiters_for(&self, resource_id: &str) -> Result<Vec<WaiterRow>, StoreError>;

    // ── Agent registry ───────────────────────────────────────────────────
    async fn put_definition(&self, record: DefinitionRecord) -> Result<(), StoreError>;
    async fn get_definition(
        &self,
        agent_id: &str,
        version: &str,
    ) -> Result<Option<DefinitionRecord>, StoreError>;
    async fn list_definitions(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<DefinitionRecord>, StoreError>;
    async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>, StoreError>;
    async fn delete_definition(&self, agent_id: &str, version: &str) -> Result<(), StoreError>;
    /// Definitions carrying a trigger on `event_type` (denormalized index).
    async fn definitions_for_trigger(
        &self,
        event_type: &str,
    ) -> Result<Vec<DefinitionRecord>, StoreError>;

    // ── Instances and execution history ──────────────────────────────────
    async fn put_instance(&self, row: InstanceRow) -> Result<(), StoreError>;
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRow>, StoreError>;
    async fn list_instances(&self) -> Result<Vec<InstanceRow>, StoreError>;
    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), StoreError>;
    async fn executions_for(&self, instance_id: &str)
        -> Result<Vec<ExecutionRecord>, StoreError>;

    // ── Analysis queue and classifications ───────────────────────────────
    async fn enqueue_analysis(&self, queue: &str, task: AnalysisTask) -> Result<(), StoreError>;
    async fn pop_analysis(&self, queue: &str) -> Result<Option<AnalysisTask>, StoreError>;
    async fn analysis_queue_len(&self, queue: &str) -> Result<usize, StoreError>;
    async fn put_classification(&self, row: ResultClassification) -> Result<(), StoreError>;
    async fn get_classification(
        &self,
        script_result_id: &str,
    ) -> Result<Option<ResultClassification>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    events: Vec<Event>,
    locks: HashMap<String, LockRow>,
    waiters: Vec<WaiterRow>,
    definitions: HashMap<(String, String), DefinitionRecord>,
    /// event_type → (agent_id, version) keys, kept in sync with
    /// `definitions` for fast trigger resolution.
    trigger_index: HashMap<String, Vec<(String, String)>>,
    instances: HashMap<String, InstanceRow>,
    executions: Vec<ExecutionRecord>,
    analysis_queues: HashMap<String, VecDeque<AnalysisTask>>,
    classifications: HashMap<String, ResultClassification>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        self.inner.write().await.events.push(event.clone());
        Ok(())
    }

    async fn mark_event_processed(
        &self,
        event_id: &str,
        agent_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", event_id)))?;
        row.processed_by = Some(agent_id.to_string());
        row.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn events_since(
        &self,
        since: DateTime<Utc>,
        type_filter: Option<&str>,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.timestamp >= since)
            .filter(|e| type_filter.map(|t| e.event_type == t).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_lock(&self, resource_id: &str) -> Result<Option<LockRow>, StoreError> {
        Ok(self.inner.read().await.locks.get(resource_id).cloned())
    }

    async fn put_lock(&self, row: LockRow) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .locks
            .insert(row.resource_id.clone(), row);
        Ok(())
    }

    async fn delete_lock(&self, resource_id: &str) -> Result<(), StoreError> {
        self.inner.write().await.locks.remove(resource_id);
        Ok(())
    }

    async fn list_locks(&self) -> Result<Vec<LockRow>, StoreError> {
        Ok(self.inner.read().await.locks.values().cloned().collect())
    }

    async fn push_waiter(&self, row: WaiterRow) -> Result<(), StoreError> {
        self.inner.write().await.waiters.push(row);
        Ok(())
    }

    async fn remove_waiter(&self, resource_id: &str, owner_id: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .waiters
            .retain(|w| !(w.resource_id == resource_id && w.owner_id == owner_id));
        Ok(())
    }

    async fn waiters_for(&self, resource_id: &str) -> Result<Vec<WaiterRow>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<WaiterRow> = inner
            .waiters
            .iter()
            .filter(|w| w.resource_id == resource_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.queued_at.cmp(&b.queued_at))
        });
        Ok(rows)
    }

    async fn put_definition(&self, record: DefinitionRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (
            record.definition.id.clone(),
            record.definition.version.clone(),
        );
        for trigger in &record.definition.triggers {
            let keys = inner
                .trigger_index
                .entry(trigger.event_type.clone())
                .or_insert_with(Vec::new);
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        }
        inner.definitions.insert(key, record);
        Ok(())
    }

    async fn get_definition(
        &self,
        agent_id: &str,
        version: &str,
    ) -> Result<Option<DefinitionRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .definitions
            .get(&(agent_id.to_string(), version.to_string()))
            .cloned())
    }

    async fn list_definitions(
        &self,
        agent_id: Option<&str>,
    ) -> Result<Vec<DefinitionRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .values()
            .filter(|r| agent_id.map(|id| r.definition.id == id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .keys()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, version)| version.clone())
            .collect())
    }

    async fn delete_definition(&self, agent_id: &str, version: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (agent_id.to_string(), version.to_string());
        if inner.definitions.remove(&key).is_none() {
            return Err(StoreError::NotFound(format!(
                "agent {} v{}",
                agent_id, version
            )));
        }
        for keys in inner.trigger_index.values_mut() {
            keys.retain(|k| *k != key);
        }
        Ok(())
    }

    async fn definitions_for_trigger(
        &self,
        event_type: &str,
    ) -> Result<Vec<DefinitionRecord>, StoreError> {
        let inner = self.inner.read().await;
        let keys = match inner.trigger_index.get(event_type) {
            Some(keys) => keys,
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .iter()
            .filter_map(|k| inner.definitions.get(k))
            .cloned()
            .collect())
    }

    async fn put_instance(&self, row: InstanceRow) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .instances
            .insert(row.instance_id.clone(), row);
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRow>, StoreError> {
        Ok(self.inner.read().await.instances.get(instance_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRow>, StoreError> {
        Ok(self.inner.read().await.instances.values().cloned().collect())
    }

    async fn append_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.inner.write().await.executions.push(record);
        Ok(())
    }

    async fn executions_for(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .executions
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn enqueue_analysis(&self, queue: &str, task: AnalysisTask) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .analysis_queues
            .entry(queue.to_string())
            .or_insert_with(VecDeque::new)
            .push_back(task);
        Ok(())
    }

    async fn pop_analysis(&self, queue: &str) -> Result<Option<AnalysisTask>, StoreError> {
        Ok(self
            .inner
            .write()
            .await
            .analysis_queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }

    async fn analysis_queue_len(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .analysis_queues
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0))
    }

    async fn put_classification(&self, row: ResultClassification) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .classifications
            .insert(row.script_result_id.clone(), row);
        Ok(())
    }

    async fn get_classification(
        &self,
        script_result_id: &str,
    ) -> Result<Option<ResultClassification>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .classifications
            .get(script_result_id)
            .cloned())
    }
}
