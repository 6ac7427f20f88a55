//! Core event model.
//!
//! Every signal flowing through the orchestration core — alerts, build
//! notifications, schedule fires, completion signals, lock transitions,
//! agent lifecycle — is an [`Event`]: a dotted-namespace type string, a
//! structured JSON payload, and a [`EventPriority`].
//!
//! Priority is *metadata*: the bus never reorders fan-out on it. It is
//! consumed downstream by the lock manager (wait-queue ordering) and the
//! router/runtime (capacity decisions). See the `event_bus` module for
//! delivery semantics.
//!
//! # Example
//!
//! ```rust
//! use autoqa::event::{Event, EventPriority};
//!
//! let event = Event::new(
//!     "alert.blackscreen",
//!     serde_json::json!({"device_id": "d1", "severity": "high"}),
//!     EventPriority::Critical,
//! );
//! assert_eq!(event.event_type, "alert.blackscreen");
//! assert!(event.processed_by.is_none());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Well-known event types recognized by the core. Consumers define more;
/// anything dotted-namespace shaped routes fine.
pub mod event_types {
    /// Emitted by the lock manager when a lock is granted (fresh or promoted).
    pub const RESOURCE_ACQUIRED: &str = "resource.acquired";
    /// Emitted by the lock manager when a lock is released or reaped.
    pub const RESOURCE_RELEASED: &str = "resource.released";
    /// Emitted by the lock manager when an acquire request is queued.
    pub const RESOURCE_QUEUED: &str = "resource.queued";

    /// Emitted by the runtime when an instance starts.
    pub const AGENT_STARTED: &str = "agent.started";
    /// Emitted by the runtime when an instance reaches its terminal state.
    pub const AGENT_STOPPED: &str = "agent.stopped";
    /// Emitted when a task begins executing on an instance.
    pub const TASK_STARTED: &str = "agent.task.started";
    /// Emitted when a task completes normally.
    pub const TASK_COMPLETED: &str = "agent.task.completed";
    /// Emitted when a task fails or is cancelled.
    pub const TASK_FAILED: &str = "agent.task.failed";

    /// Emitted by the router when a published event matches zero agents
    /// or is dropped at capacity. Payload carries the original type and id.
    pub const EVENT_UNHANDLED: &str = "event.unhandled";

    /// Completion signal for a scripted execution run.
    pub const SCRIPT_COMPLETED: &str = "script.completed";
    /// Completion signal for a test-case execution.
    pub const TESTCASE_COMPLETED: &str = "testcase.completed";
    /// Completion signal for a deployment-driven execution.
    pub const DEPLOYMENT_EXECUTION_DONE: &str = "deployment.execution_done";

    /// Build lifecycle signals from CI/CD.
    pub const BUILD_DEPLOYED: &str = "build.deployed";
    pub const BUILD_FAILED: &str = "build.failed";

    /// The completion signals that feed the analysis queue.
    pub const COMPLETION_SIGNALS: [&str; 3] = [
        SCRIPT_COMPLETED,
        TESTCASE_COMPLETED,
        DEPLOYMENT_EXECUTION_DONE,
    ];
}

/// Urgency attached to an event at publish time.
///
/// Lower [`rank`](EventPriority::rank) means more urgent; the lock manager
/// orders its wait queues by `(rank asc, queued_at asc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl EventPriority {
    /// Numeric rank used for ordering. `Critical` = 0 through `Low` = 3.
    pub fn rank(&self) -> u8 {
        match self {
            EventPriority::Critical => 0,
            EventPriority::High => 1,
            EventPriority::Normal => 2,
            EventPriority::Low => 3,
        }
    }

    /// Lowercase wire label (`"critical"`, `"high"`, `"normal"`, `"low"`).
    pub fn label(&self) -> &'static str {
        match self {
            EventPriority::Critical => "critical",
            EventPriority::High => "high",
            EventPriority::Normal => "normal",
            EventPriority::Low => "low",
        }
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A typed, prioritized message published to the bus and routed to agents.
///
/// The id is generated at publish time; `processed_by` / `processed_at` are
/// filled in as consumers mark the event handled (append-only semantics —
/// the log row is never rewritten, only annotated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Opaque identifier generated at construction.
    pub id: String,
    /// Dotted-namespace type string, e.g. `alert.blackscreen`.
    pub event_type: String,
    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
    /// Urgency metadata; never reorders bus fan-out.
    pub priority: EventPriority,
    /// Origin timestamp (UTC, set at construction).
    pub timestamp: DateTime<Utc>,
    /// Agent id that routed/consumed this event, once processed.
    pub processed_by: Option<String>,
    /// When the consumer marked the event processed.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create an event with a fresh id and the current timestamp.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        priority: EventPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            priority,
            timestamp: Utc::now(),
            processed_by: None,
            processed_at: None,
        }
    }

    /// True when the event is one of the execution-completion signals that
    /// feed the analysis queue.
    pub fn is_completion_signal(&self) -> bool {
        event_types::COMPLETION_SIGNALS
            .iter()
            .any(|t| *t == self.event_type)
    }

    /// Equality-match every `filters` entry against this event's payload.
    ///
    /// A filter `{platform: "mobile"}` matches only payloads whose
    /// `platform` key equals `"mobile"`. An empty filter set matches
    /// everything; a filter against a missing key matches nothing.
    pub fn matches_filters(&self, filters: &HashMap<String, serde_json::Value>) -> bool {
        filters
            .iter()
            .all(|(key, expected)| self.payload.get(key) == Some(expected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_ordering() {
        assert!(EventPriority::Critical.rank() < EventPriority::High.rank());
        assert!(EventPriority::High.rank() < EventPriority::Normal.rank());
        assert!(EventPriority::Normal.rank() < EventPriority::Low.rank());
    }

    #[test]
    fn filter_matching() {
        let event = Event::new(
            "alert.blackscreen",
            serde_json::json!({"platform": "mobile", "device_id": "d1"}),
            EventPriority::Critical,
        );

        let mut filters = HashMap::new();
        filters.insert("platform".to_string(), serde_json::json!("mobile"));
        assert!(event.matches_filters(&filters));

        filters.insert("device_id".to_string(), serde_json::json!("d2"));
        assert!(!event.matches_filters(&filters));

        let mut missing = HashMap::new();
        missing.insert("region".to_string(), serde_json::json!("eu"));
        assert!(!event.matches_filters(&missing));

        assert!(event.matches_filters(&HashMap::new()));
    }

    #[test]
    fn completion_signal_detection() {
        let done = Event::new(
            event_types::SCRIPT_COMPLETED,
            serde_json::json!({}),
            EventPriority::Normal,
        );
        assert!(done.is_completion_signal());

        let alert = Event::new("alert.no_signal", serde_json::json!({}), EventPriority::High);
        assert!(!alert.is_completion_signal());
    }

    #[test]
    fn priority_serde_roundtrip() {
        let json = serde_json::to_string(&EventPriority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: EventPriority = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventPriority::Critical);
    }
}
