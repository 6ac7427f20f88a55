//! Control surface contracts.
//!
//! The HTTP/WebSocket serving layer lives outside the core; what the core
//! provides is the request/response vocabulary ([`ControlRequest`] /
//! [`ControlResponse`]), the streaming frame vocabulary ([`PushEvent`]),
//! the outbound push seams ([`PushSink`], [`Notifier`]), and a thin
//! [`ControlSurface`] façade that routes requests to the owning
//! components. Consumers join the push stream by session id or by the
//! well-known [`BACKGROUND_TASKS_ROOM`] for analysis-worker progress.

use crate::autoqa::event::{Event, EventPriority};
use crate::autoqa::event_bus::EventBus;
use crate::autoqa::registry::{AgentRegistry, DefinitionStatus, DocumentFormat};
use crate::autoqa::runtime::{AgentRuntime, InstanceState, InstanceStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

/// Room every analysis-progress frame is pushed to.
pub const BACKGROUND_TASKS_ROOM: &str = "background_tasks";

/// Frames delivered over the streaming push surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    Thinking {
        session_id: String,
        text: String,
    },
    ToolCall {
        session_id: String,
        tool: String,
        params: serde_json::Value,
    },
    ToolResult {
        session_id: String,
        tool: String,
        success: bool,
        output: serde_json::Value,
    },
    Message {
        session_id: String,
        text: String,
    },
    SkillLoaded {
        session_id: String,
        skill: String,
    },
    SkillUnloaded {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
    },
    Error {
        session_id: String,
        kind: String,
        message: String,
    },
    /// Generic envelope for anything else (analysis progress, lifecycle).
    AgentEvent {
        payload: serde_json::Value,
    },
}

/// Outbound streaming channel (WebSocket rooms, SSE, …).
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn push(&self, room: &str, event: &PushEvent);
}

/// Optional side-channel notifications (team chat).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Requests the serving layer forwards into the core.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    RegisterAgent {
        document: String,
        format: DocumentFormat,
    },
    PublishAgent {
        agent_id: String,
        version: String,
    },
    DeprecateAgent {
        agent_id: String,
        version: String,
    },
    DeleteAgent {
        agent_id: String,
        version: String,
    },
    ExportAgent {
        agent_id: String,
        version: Option<String>,
        format: DocumentFormat,
    },
    ListAgents {
        status: Option<DefinitionStatus>,
    },
    StartAgent {
        agent_id: String,
        version: Option<String>,
    },
    StopAgent {
        instance_id: String,
    },
    PauseAgent {
        instance_id: String,
    },
    ResumeAgent {
        instance_id: String,
    },
    ListInstances {
        state: Option<InstanceState>,
    },
    InstanceStatus {
        instance_id: String,
    },
    /// Manual event injection.
    PublishEvent {
        event_type: String,
        payload: serde_json::Value,
        priority: EventPriority,
    },
}

/// Summary row for agent listings.
#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub agent_id: String,
    pub version: String,
    pub name: String,
    pub status: DefinitionStatus,
}

/// Responses returned to the serving layer.
#[derive(Debug)]
pub enum ControlResponse {
    Ok,
    AgentRegistered { agent_id: String, version: String },
    Document(String),
    Agents(Vec<AgentSummary>),
    InstanceStarted { instance_id: String },
    Instances(Vec<InstanceStatus>),
    Status(InstanceStatus),
    EventPublished { event_id: String },
    Error { kind: String, message: String },
}

/// Thin request router over the core components.
pub struct ControlSurface {
    registry: Arc<AgentRegistry>,
    runtime: Arc<AgentRuntime>,
    bus: Arc<EventBus>,
}

impl ControlSurface {
    pub fn new(
        registry: Arc<AgentRegistry>,
        runtime: Arc<AgentRuntime>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            runtime,
            bus,
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::RegisterAgent { document, format } => {
                match self.registry.import_from_text(&document, format).await {
                    Ok((agent_id, version)) => {
                        ControlResponse::AgentRegistered { agent_id, version }
                    }
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::PublishAgent { agent_id, version } => {
                match self.registry.publish(&agent_id, &version).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::DeprecateAgent { agent_id, version } => {
                match self.registry.deprecate(&agent_id, &version).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::DeleteAgent { agent_id, version } => {
                match self.registry.delete(&agent_id, &version).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::ExportAgent {
                agent_id,
                version,
                format,
            } => {
                match self
                    .registry
                    .export_to_text(&agent_id, version.as_deref(), format)
                    .await
                {
                    Ok(document) => ControlResponse::Document(document),
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::ListAgents { status } => match self.registry.list(status).await {
                Ok(records) => ControlResponse::Agents(
                    records
                        .into_iter()
                        .map(|r| AgentSummary {
                            agent_id: r.definition.id,
                            version: r.definition.version,
                            name: r.definition.name,
                            status: r.status,
                        })
                        .collect(),
                ),
                Err(err) => error_response(err.kind(), err.to_string()),
            },
            ControlRequest::StartAgent { agent_id, version } => {
                match self.runtime.start_agent(&agent_id, version.as_deref()).await {
                    Ok(instance_id) => ControlResponse::InstanceStarted { instance_id },
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::StopAgent { instance_id } => {
                match self.runtime.stop_agent(&instance_id).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::PauseAgent { instance_id } => {
                match self.runtime.pause_agent(&instance_id).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::ResumeAgent { instance_id } => {
                match self.runtime.resume_agent(&instance_id).await {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::ListInstances { state } => {
                ControlResponse::Instances(self.runtime.list_instances(state).await)
            }
            ControlRequest::InstanceStatus { instance_id } => {
                match self.runtime.status(&instance_id).await {
                    Ok(status) => ControlResponse::Status(status),
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
            ControlRequest::PublishEvent {
                event_type,
                payload,
                priority,
            } => {
                match self
                    .bus
                    .publish(Event::new(event_type, payload, priority))
                    .await
                {
                    Ok(event_id) => ControlResponse::EventPublished { event_id },
                    Err(err) => error_response(err.kind(), err.to_string()),
                }
            }
        }
    }
}

fn error_response(kind: &str, message: String) -> ControlResponse {
    ControlResponse::Error {
        kind: kind.to_string(),
        message,
    }
}

/// Progress frame helper used by the analysis worker.
pub fn analysis_progress(payload: serde_json::Value) -> PushEvent {
    PushEvent::AgentEvent { payload }
}
