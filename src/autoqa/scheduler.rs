//! Cron-driven event source.
//!
//! Each job pairs a cron expression with a payload; at every firing the
//! scheduler publishes a `schedule.<name>` event. There is no drift
//! correction beyond the underlying timer, and missed fires are never
//! replayed: on (re)start every job schedules from the current instant
//! forward (see `SchedulerConfig::catch_up_missed`).

use crate::autoqa::config::SchedulerConfig;
use crate::autoqa::event::{Event, EventPriority};
use crate::autoqa::event_bus::EventBus;
use chrono::Utc;
use cron::Schedule;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Scheduler errors.
#[derive(Debug)]
pub enum ScheduleError {
    InvalidExpression { name: String, message: String },
    DuplicateJob(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidExpression { name, message } => {
                write!(f, "Invalid cron expression for job '{}': {}", name, message)
            }
            ScheduleError::DuplicateJob(name) => write!(f, "Duplicate job name: {}", name),
        }
    }
}

impl Error for ScheduleError {}

impl ScheduleError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::InvalidExpression { .. } => "validation",
            ScheduleError::DuplicateJob(_) => "conflict",
        }
    }
}

struct CronJob {
    name: String,
    expression: String,
    schedule: Schedule,
    payload: serde_json::Value,
    priority: EventPriority,
    /// Precomputed next fire; refreshed after every firing. `None` for
    /// schedules with no future occurrence.
    next_at: Option<chrono::DateTime<Utc>>,
}

/// The scheduler source. Construct, add jobs, then [`start`](CronScheduler::start).
pub struct CronScheduler {
    bus: Arc<EventBus>,
    jobs: Mutex<Vec<CronJob>>,
    changed: Notify,
    #[allow(dead_code)]
    config: SchedulerConfig,
}

impl CronScheduler {
    pub fn new(bus: Arc<EventBus>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            jobs: Mutex::new(Vec::new()),
            changed: Notify::new(),
            config,
        })
    }

    /// Register a job. The emitted event type is `schedule.<name>`.
    pub async fn add_job(
        &self,
        name: impl Into<String>,
        expression: &str,
        payload: serde_json::Value,
    ) -> Result<(), ScheduleError> {
        self.add_job_with_priority(name, expression, payload, EventPriority::Normal)
            .await
    }

    pub async fn add_job_with_priority(
        &self,
        name: impl Into<String>,
        expression: &str,
        payload: serde_json::Value,
        priority: EventPriority,
    ) -> Result<(), ScheduleError> {
        let name = name.into();
        let schedule =
            Schedule::from_str(expression).map_err(|e| ScheduleError::InvalidExpression {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let mut jobs = self.jobs.lock().await;
        if jobs.iter().any(|j| j.name == name) {
            return Err(ScheduleError::DuplicateJob(name));
        }
        // Missed fires are never replayed: scheduling starts from now.
        let next_at = schedule.upcoming(Utc).next();
        jobs.push(CronJob {
            name,
            expression: expression.to_string(),
            schedule,
            payload,
            priority,
            next_at,
        });
        drop(jobs);
        self.changed.notify_one();
        Ok(())
    }

    /// Remove a job by name. Returns false when no such job exists.
    pub async fn remove_job(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| j.name != name);
        let removed = jobs.len() != before;
        drop(jobs);
        if removed {
            self.changed.notify_one();
        }
        removed
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.lock().await.iter().map(|j| j.name.clone()).collect()
    }

    /// Spawn the tick loop. Runs until the handle is aborted.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = scheduler.next_fire().await;
                match next {
                    None => scheduler.changed.notified().await,
                    Some(at) => {
                        let now = Utc::now();
                        if at > now {
                            let wait = (at - now)
                                .to_std()
                                .unwrap_or_else(|_| std::time::Duration::from_millis(10));
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = scheduler.changed.notified() => continue,
                            }
                        }
                        scheduler.fire_due().await;
                    }
                }
            }
        })
    }

    async fn next_fire(&self) -> Option<chrono::DateTime<Utc>> {
        let jobs = self.jobs.lock().await;
        jobs.iter().filter_map(|j| j.next_at).min()
    }

    /// Publish an event for every job whose fire time has arrived, then
    /// advance each fired job to its next occurrence.
    async fn fire_due(&self) {
        let now = Utc::now();
        let due: Vec<(String, String, serde_json::Value, EventPriority)> = {
            let mut jobs = self.jobs.lock().await;
            let mut due = Vec::new();
            for job in jobs.iter_mut() {
                match job.next_at {
                    Some(at) if at <= now => {
                        due.push((
                            job.name.clone(),
                            job.expression.clone(),
                            job.payload.clone(),
                            job.priority,
                        ));
                        job.next_at = job.schedule.upcoming(Utc).next();
                    }
                    _ => {}
                }
            }
            due
        };

        for (name, expression, payload, priority) in due {
            let mut body = serde_json::json!({
                "schedule": name,
                "cron": expression,
                "fired_at": now.to_rfc3339(),
            });
            if let (Some(target), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
            let event = Event::new(format!("schedule.{}", name), body, priority);
            if let Err(err) = self.bus.publish(event).await {
                log::error!("schedule.{} publish failed: {}", name, err);
            } else {
                log::debug!("schedule.{} fired", name);
            }
        }
    }
}
