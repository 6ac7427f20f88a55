//! Configuration for the orchestration core.
//!
//! Plain structs constructed in code — no config-file parsing. Every field
//! has a sensible default so `AutoQAConfig::default()` yields a working
//! setup for tests and small deployments.

use std::time::Duration;

/// What to do when a continuous agent's instance queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered event to make room (default).
    DropOldest,
    /// Refuse the incoming event instead.
    DropNewest,
}

/// Event bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded retries for the external pub/sub relay.
    pub transport_retries: u32,
    /// Initial backoff between relay retries; doubles per attempt.
    pub transport_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport_retries: 3,
            transport_backoff: Duration::from_millis(200),
        }
    }
}

/// Lock manager tuning.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Interval between expiry sweeps.
    pub sweeper_interval: Duration,
    /// Lease applied when a waiter is promoted without a fresh ttl request.
    pub default_lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            sweeper_interval: Duration::from_secs(30),
            default_lease: Duration::from_secs(300),
        }
    }
}

/// Router and per-instance queue tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bound on each instance's buffered event queue.
    pub instance_queue_depth: usize,
    /// Overflow behaviour for continuous agents at capacity.
    pub continuous_overflow: OverflowPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            instance_queue_depth: 64,
            continuous_overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Task-loop tuning shared by every instance.
#[derive(Debug, Clone)]
pub struct TaskLoopConfig {
    /// Literal prior turns carried into each prompt.
    pub keep_last_turns: usize,
    /// Rolling-summary line cap.
    pub summary_max_lines: usize,
    /// Model context window used by the empty-response heuristic.
    pub context_window: usize,
    /// Hard cap on LLM turns per task; the per-task timeout usually fires
    /// first.
    pub max_turns: usize,
    /// Score user messages against skill trigger keyphrases and load the
    /// best match before the first turn, instead of waiting for the LLM
    /// to ask for it.
    pub preselect_skills: bool,
}

impl Default for TaskLoopConfig {
    fn default() -> Self {
        Self {
            keep_last_turns: 2,
            summary_max_lines: 3,
            context_window: 128_000,
            max_turns: 32,
            preselect_skills: false,
        }
    }
}

/// Analysis worker tuning.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Durable queue drained by the worker.
    pub queue: String,
    /// Poll interval when the queue is empty.
    pub poll_interval: Duration,
    /// Bounded re-delivery attempts per task.
    pub max_attempts: u32,
    /// Parallel classifications allowed at once.
    pub concurrency: usize,
    /// Push room for live progress frames.
    pub progress_room: String,
    /// Skill used to classify results.
    pub classifier_skill: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            queue: "script_completions".to_string(),
            poll_interval: Duration::from_secs(5),
            max_attempts: 3,
            concurrency: 2,
            progress_room: crate::autoqa::control::BACKGROUND_TASKS_ROOM.to_string(),
            classifier_skill: "result-analysis".to_string(),
        }
    }
}

/// Scheduler source tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Missed fires are never replayed: each job schedules from "now" at
    /// loop start. The field records the policy; the scheduler does not
    /// implement catch-up.
    pub catch_up_missed: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            catch_up_missed: false,
        }
    }
}

/// Top-level configuration for the core's components.
#[derive(Debug, Clone, Default)]
pub struct AutoQAConfig {
    pub bus: BusConfig,
    pub lock: LockConfig,
    pub router: RouterConfig,
    pub task_loop: TaskLoopConfig,
    pub analysis: AnalysisConfig,
    pub scheduler: SchedulerConfig,
}
