//! Exclusive resource locks with priority-ordered waiters.
//!
//! Devices are the only contested resource in the platform and every claim
//! on one goes through this manager. At most one live lock exists per
//! resource; contenders queue as waiters ordered by `(priority rank asc,
//! queued_at asc)` and are promoted in that order on release. Expired
//! leases are reaped by a background sweeper that synthesizes a release.
//!
//! There is no holder preemption: a queued critical waiter outranks the
//! rest of the queue but the current holder always runs until it releases
//! or its lease expires.
//!
//! All lock transitions are announced on the event bus as
//! `resource.acquired` / `resource.queued` / `resource.released`.

use crate::autoqa::config::LockConfig;
use crate::autoqa::event::{event_types, Event, EventPriority};
use crate::autoqa::event_bus::EventBus;
use crate::autoqa::store::{Store, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Who holds or wants a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerKind {
    AgentInstance,
    User,
    System,
}

/// One live lock row. Unique per `resource_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub resource_id: String,
    pub resource_kind: String,
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub priority: EventPriority,
}

impl LockRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// One queued contender for a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiterRow {
    pub resource_id: String,
    pub resource_kind: String,
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub priority: EventPriority,
    pub queued_at: DateTime<Utc>,
    /// Lease the waiter wants once promoted.
    pub lease_seconds: u64,
}

/// Outcome of an [`acquire`](LockManager::acquire) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Queued behind the holder; `position` is 1-based within the waiter
    /// list at enqueue time.
    Queued { position: usize },
    /// The caller supplied a wait budget and it elapsed; the waiter row has
    /// been deleted.
    TimedOut,
}

/// Snapshot answer for [`status`](LockManager::status).
#[derive(Debug, Clone, PartialEq)]
pub enum LockStatus {
    Available,
    Held {
        owner_id: String,
        owner_kind: OwnerKind,
        expires_at: DateTime<Utc>,
        waiters: usize,
    },
}

/// Parameters for one acquire attempt.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource_id: String,
    pub resource_kind: String,
    pub owner_id: String,
    pub owner_kind: OwnerKind,
    pub lease: Duration,
    pub priority: EventPriority,
    /// How long to wait for promotion when queued. `None` returns
    /// `Queued` immediately.
    pub wait: Option<Duration>,
}

impl AcquireRequest {
    pub fn new(
        resource_id: impl Into<String>,
        resource_kind: impl Into<String>,
        owner_id: impl Into<String>,
        owner_kind: OwnerKind,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_kind: resource_kind.into(),
            owner_id: owner_id.into(),
            owner_kind,
            lease: Duration::from_secs(300),
            priority: EventPriority::Normal,
            wait: None,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }
}

/// Lock manager errors.
#[derive(Debug)]
pub enum LockError {
    /// Release attempted by someone other than the holder; the lock is
    /// untouched.
    NotOwner { resource_id: String, owner_id: String },
    /// Release of a resource that has no live lock.
    NotHeld(String),
    Storage(StoreError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::NotOwner {
                resource_id,
                owner_id,
            } => write!(f, "{} does not own the lock on {}", owner_id, resource_id),
            LockError::NotHeld(resource_id) => {
                write!(f, "No live lock on {}", resource_id)
            }
            LockError::Storage(err) => write!(f, "Storage failure: {}", err),
        }
    }
}

impl Error for LockError {}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        LockError::Storage(err)
    }
}

impl LockError {
    pub fn kind(&self) -> &'static str {
        match self {
            LockError::NotOwner { .. } => "conflict",
            LockError::NotHeld(_) => "not_found",
            LockError::Storage(_) => "storage",
        }
    }
}

/// The resource lock manager.
pub struct LockManager {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    config: LockConfig,
    /// Per-resource critical sections; acquire/release/reap for one
    /// resource are serialized so double-acquire is impossible.
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Promotion signals for in-process waiters that asked to block.
    signals: Mutex<HashMap<(String, String), Arc<Notify>>>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, config: LockConfig) -> Self {
        Self {
            store,
            bus,
            config,
            guards: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    async fn guard_for(&self, resource_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Try to take the lock described by `request`.
    ///
    /// Re-acquire by the current owner extends the lease. An expired holder
    /// is reaped first (release semantics, including waiter promotion)
    /// before the caller contends.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<AcquireOutcome, LockError> {
        let guard = self.guard_for(&request.resource_id).await;
        {
            let _held = guard.lock().await;

            let now = Utc::now();
            if let Some(row) = self.store.get_lock(&request.resource_id).await? {
                if row.owner_id == request.owner_id {
                    let mut extended = row;
                    extended.expires_at = now + chrono_lease(request.lease);
                    self.store.put_lock(extended).await?;
                    return Ok(AcquireOutcome::Acquired);
                }
                if row.is_expired(now) {
                    self.reap_locked(&row).await?;
                } else {
                    return self.enqueue_waiter(&request).await;
                }
            }

            // Reaping may have promoted a waiter; re-check before taking it.
            if self.store.get_lock(&request.resource_id).await?.is_some() {
                return self.enqueue_waiter(&request).await;
            }

            let row = LockRow {
                resource_id: request.resource_id.clone(),
                resource_kind: request.resource_kind.clone(),
                owner_id: request.owner_id.clone(),
                owner_kind: request.owner_kind,
                acquired_at: now,
                expires_at: now + chrono_lease(request.lease),
                priority: request.priority,
            };
            self.store.put_lock(row).await?;
        }

        self.announce(
            event_types::RESOURCE_ACQUIRED,
            &request.resource_id,
            &request.owner_id,
            serde_json::json!({
                "resource_id": request.resource_id,
                "resource_kind": request.resource_kind,
                "owner_id": request.owner_id,
            }),
        )
        .await;
        Ok(AcquireOutcome::Acquired)
    }

    /// Insert the caller into the waiter list and register a promotion
    /// signal. Runs with the per-resource guard held by the caller; any
    /// blocking wait happens afterwards in
    /// [`acquire_and_wait`](LockManager::acquire_and_wait), once the guard
    /// is dropped.
    async fn enqueue_waiter(
        &self,
        request: &AcquireRequest,
    ) -> Result<AcquireOutcome, LockError> {
        let row = WaiterRow {
            resource_id: request.resource_id.clone(),
            resource_kind: request.resource_kind.clone(),
            owner_id: request.owner_id.clone(),
            owner_kind: request.owner_kind,
            priority: request.priority,
            queued_at: Utc::now(),
            lease_seconds: request.lease.as_secs(),
        };
        self.store.push_waiter(row).await?;

        let waiters = self.store.waiters_for(&request.resource_id).await?;
        let position = waiters
            .iter()
            .position(|w| w.owner_id == request.owner_id)
            .map(|i| i + 1)
            .unwrap_or(waiters.len());

        self.signals.lock().await.insert(
            (request.resource_id.clone(), request.owner_id.clone()),
            Arc::new(Notify::new()),
        );

        self.announce(
            event_types::RESOURCE_QUEUED,
            &request.resource_id,
            &request.owner_id,
            serde_json::json!({
                "resource_id": request.resource_id,
                "owner_id": request.owner_id,
                "position": position,
            }),
        )
        .await;

        Ok(AcquireOutcome::Queued { position })
    }

    /// Acquire with blocking semantics: when queued, await promotion up to
    /// `request.wait`; on expiry the waiter row is deleted and
    /// [`AcquireOutcome::TimedOut`] is returned.
    pub async fn acquire_and_wait(
        &self,
        request: AcquireRequest,
    ) -> Result<AcquireOutcome, LockError> {
        let wait = match request.wait {
            Some(wait) => wait,
            None => return self.acquire(request).await,
        };
        let resource_id = request.resource_id.clone();
        let owner_id = request.owner_id.clone();

        match self.acquire(request).await? {
            AcquireOutcome::Acquired => return Ok(AcquireOutcome::Acquired),
            AcquireOutcome::TimedOut => return Ok(AcquireOutcome::TimedOut),
            AcquireOutcome::Queued { .. } => {}
        }

        let notify = {
            let signals = self.signals.lock().await;
            signals.get(&(resource_id.clone(), owner_id.clone())).cloned()
        };
        // A missing signal means promotion already consumed it; fall
        // through to the ownership check either way.
        if let Some(notify) = notify {
            let promoted = tokio::time::timeout(wait, notify.notified()).await.is_ok();
            self.signals
                .lock()
                .await
                .remove(&(resource_id.clone(), owner_id.clone()));
            if promoted {
                return Ok(AcquireOutcome::Acquired);
            }
        }

        // Raced promotion: the notify may have fired between timeout and
        // cleanup. The lock row is authoritative.
        let guard = self.guard_for(&resource_id).await;
        let _held = guard.lock().await;
        if let Some(row) = self.store.get_lock(&resource_id).await? {
            if row.owner_id == owner_id {
                return Ok(AcquireOutcome::Acquired);
            }
        }
        self.store.remove_waiter(&resource_id, &owner_id).await?;
        Ok(AcquireOutcome::TimedOut)
    }

    /// Release a lock held by `owner_id`, promoting the next waiter.
    pub async fn release(&self, resource_id: &str, owner_id: &str) -> Result<(), LockError> {
        let guard = self.guard_for(resource_id).await;
        let row = {
            let _held = guard.lock().await;
            let row = self
                .store
                .get_lock(resource_id)
                .await?
                .ok_or_else(|| LockError::NotHeld(resource_id.to_string()))?;
            if row.owner_id != owner_id {
                return Err(LockError::NotOwner {
                    resource_id: resource_id.to_string(),
                    owner_id: owner_id.to_string(),
                });
            }
            self.reap_locked(&row).await?;
            row
        };
        self.announce(
            event_types::RESOURCE_RELEASED,
            resource_id,
            &row.owner_id,
            serde_json::json!({
                "resource_id": resource_id,
                "owner_id": row.owner_id,
            }),
        )
        .await;
        Ok(())
    }

    /// Release every lock held by `owner_id` (instance teardown).
    pub async fn release_owned(&self, owner_id: &str) -> Result<usize, LockError> {
        let mut released = 0;
        for row in self.store.list_locks().await? {
            if row.owner_id == owner_id {
                match self.release(&row.resource_id, owner_id).await {
                    Ok(()) => released += 1,
                    Err(LockError::NotHeld(_)) | Err(LockError::NotOwner { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(released)
    }

    /// Delete the lock row and promote the next waiter, if any. Must run
    /// with the per-resource guard held.
    async fn reap_locked(&self, row: &LockRow) -> Result<(), LockError> {
        self.store.delete_lock(&row.resource_id).await?;

        let waiters = self.store.waiters_for(&row.resource_id).await?;
        if let Some(next) = waiters.into_iter().next() {
            let now = Utc::now();
            let promoted = LockRow {
                resource_id: next.resource_id.clone(),
                resource_kind: next.resource_kind.clone(),
                owner_id: next.owner_id.clone(),
                owner_kind: next.owner_kind,
                acquired_at: now,
                expires_at: now
                    + chrono_lease(if next.lease_seconds == 0 {
                        self.config.default_lease
                    } else {
                        Duration::from_secs(next.lease_seconds)
                    }),
                priority: next.priority,
            };
            self.store
                .remove_waiter(&next.resource_id, &next.owner_id)
                .await?;
            self.store.put_lock(promoted).await?;

            if let Some(notify) = self
                .signals
                .lock()
                .await
                .remove(&(next.resource_id.clone(), next.owner_id.clone()))
            {
                notify.notify_one();
            }

            self.announce(
                event_types::RESOURCE_ACQUIRED,
                &next.resource_id,
                &next.owner_id,
                serde_json::json!({
                    "resource_id": next.resource_id,
                    "resource_kind": next.resource_kind,
                    "owner_id": next.owner_id,
                    "promoted": true,
                }),
            )
            .await;
        }
        Ok(())
    }

    /// Current holder and queue depth for a resource. An expired holder
    /// reads as held until the sweeper or the next acquire reaps it.
    pub async fn status(&self, resource_id: &str) -> Result<LockStatus, LockError> {
        match self.store.get_lock(resource_id).await? {
            None => Ok(LockStatus::Available),
            Some(row) => {
                let waiters = self.store.waiters_for(resource_id).await?.len();
                Ok(LockStatus::Held {
                    owner_id: row.owner_id,
                    owner_kind: row.owner_kind,
                    expires_at: row.expires_at,
                    waiters,
                })
            }
        }
    }

    /// One sweep pass: reap every expired lock as a synthesized release.
    pub async fn sweep_expired(&self) -> Result<usize, LockError> {
        let now = Utc::now();
        let mut reaped = 0;
        for row in self.store.list_locks().await? {
            if !row.is_expired(now) {
                continue;
            }
            let guard = self.guard_for(&row.resource_id).await;
            let _held = guard.lock().await;
            // Re-read under the guard; the holder may have released or
            // extended meanwhile.
            if let Some(current) = self.store.get_lock(&row.resource_id).await? {
                if current.owner_id == row.owner_id && current.is_expired(now) {
                    log::info!(
                        "reaping expired lock on {} held by {}",
                        row.resource_id,
                        row.owner_id
                    );
                    self.reap_locked(&current).await?;
                    drop(_held);
                    self.announce(
                        event_types::RESOURCE_RELEASED,
                        &row.resource_id,
                        &row.owner_id,
                        serde_json::json!({
                            "resource_id": row.resource_id,
                            "owner_id": row.owner_id,
                            "expired": true,
                        }),
                    )
                    .await;
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    /// Spawn the background sweeper. Runs until the handle is aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.sweeper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.sweep_expired().await {
                    log::error!("lock sweeper pass failed: {}", err);
                }
            }
        })
    }

    async fn announce(
        &self,
        event_type: &str,
        resource_id: &str,
        owner_id: &str,
        payload: serde_json::Value,
    ) {
        let event = Event::new(event_type, payload, EventPriority::Normal);
        if let Err(err) = self.bus.publish(event).await {
            log::warn!(
                "could not announce {} for {} ({}): {}",
                event_type,
                resource_id,
                owner_id,
                err
            );
        }
    }
}

fn chrono_lease(lease: Duration) -> ChronoDuration {
    ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::seconds(300))
}
