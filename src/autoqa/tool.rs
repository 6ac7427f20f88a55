//! Uniform tool dispatch seam.
//!
//! Tools are uniformly `(name, params) → result_or_error`. The tool runtime
//! itself (MCP bridges, device controllers, HTTP action endpoints) is an
//! external collaborator behind [`ToolDispatcher`]; the task loop never
//! embeds tool-specific logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

/// How a tool invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Failed { message: String },
}

/// What came back from one tool invocation against the device estate.
///
/// A settled invocation carries structured `data` (an action list, a
/// screen dump, a navigation summary); a failed one carries a message the
/// task loop feeds back to the model as the tool turn. `annotations` holds
/// execution hints the tool runtime reports alongside the payload —
/// action-chain tools declare their settle time there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    status: ToolStatus,
    /// Structured payload produced by the tool. `Null` when it failed.
    pub data: serde_json::Value,
    /// Runtime-reported execution hints: timings, retry counts,
    /// `final_wait_time` for action chains.
    pub annotations: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    /// A settled invocation with its payload.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: ToolStatus::Ok,
            data,
            annotations: HashMap::new(),
        }
    }

    /// A failed invocation. The message reaches the model verbatim.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Failed {
                message: message.into(),
            },
            data: serde_json::Value::Null,
            annotations: HashMap::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    /// The failure message, when the invocation failed.
    pub fn failure_message(&self) -> Option<&str> {
        match &self.status {
            ToolStatus::Ok => None,
            ToolStatus::Failed { message } => Some(message),
        }
    }

    /// Attach an execution hint (builder pattern).
    pub fn annotate(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.annotations.insert(key.into(), value);
        self
    }

    /// Declared settle time after an action chain, when present.
    ///
    /// Action-style tools report `final_wait_time` (seconds) as an
    /// annotation or inside their payload; the task loop yields for that
    /// long before the next LLM turn so the device state has settled.
    pub fn final_wait_time(&self) -> Option<Duration> {
        let value = self
            .annotations
            .get("final_wait_time")
            .or_else(|| self.data.get("final_wait_time"))?;
        let secs = value.as_f64()?;
        if secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        }
    }
}

/// Identity and schema for a dispatchable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    /// Parameter shape as a JSON Schema object.
    pub parameters_schema: serde_json::Value,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema: serde_json::json!({"type": "object", "properties": {}}),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameters_schema = schema;
        self
    }
}

/// External tool runtime: executes a named tool with JSON parameters.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Execute `name` with `params`. A tool-level failure is an
    /// `Ok(ToolResult)` with failed status; an `Err` means the dispatch
    /// itself broke (transport down, unknown tool).
    async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>>;

    /// Describe a tool so it can be surfaced in the LLM tool catalog.
    /// Dispatchers that cannot describe a name return `None`; the runtime
    /// then advertises the bare name with an empty schema.
    async fn describe(&self, name: &str) -> Option<ToolMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_and_failed_accessors() {
        let ok = ToolResult::ok(serde_json::json!({"actions": ["up"]}));
        assert!(ok.succeeded());
        assert!(ok.failure_message().is_none());

        let failed = ToolResult::failed("device unreachable");
        assert!(!failed.succeeded());
        assert_eq!(failed.failure_message(), Some("device unreachable"));
        assert!(failed.data.is_null());
    }

    #[test]
    fn final_wait_time_from_payload() {
        let result = ToolResult::ok(serde_json::json!({"final_wait_time": 1.5}));
        assert_eq!(result.final_wait_time(), Some(Duration::from_secs_f64(1.5)));
    }

    #[test]
    fn final_wait_time_annotation_wins() {
        let result = ToolResult::ok(serde_json::json!({"final_wait_time": 9.0}))
            .annotate("final_wait_time", serde_json::json!(2.0));
        assert_eq!(result.final_wait_time(), Some(Duration::from_secs_f64(2.0)));
    }

    #[test]
    fn no_wait_declared() {
        assert_eq!(ToolResult::ok(serde_json::json!({})).final_wait_time(), None);
        let zero = ToolResult::ok(serde_json::json!({"final_wait_time": 0}));
        assert_eq!(zero.final_wait_time(), None);
    }
}
