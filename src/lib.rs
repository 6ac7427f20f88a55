// src/lib.rs

// Import the top-level `autoqa` module.
pub mod autoqa;

// Surface the component modules at the crate root so callers write
// autoqa::lock_manager::AcquireRequest instead of walking the hierarchy.
pub use autoqa::{
    analysis, config, control, event, event_bus, llm, lock_manager, registry, result_cache,
    router, runtime, scheduler, session_context, skill, store, task_loop, tool,
};

// Re-exporting key items for easier external access.
pub use autoqa::analysis::{AnalysisWorker, ArtifactFetcher, Classification, HttpArtifactFetcher};
pub use autoqa::config::AutoQAConfig;
pub use autoqa::control::{ControlRequest, ControlResponse, ControlSurface, PushEvent, PushSink};
pub use autoqa::event::{Event, EventPriority};
pub use autoqa::event_bus::{EventBus, EventHandler, EventTransport};
pub use autoqa::llm::{ChatMessage, LlmClient, LlmResponse, Role, StopReason, TokenUsage};
pub use autoqa::lock_manager::{AcquireOutcome, AcquireRequest, LockManager, LockStatus, OwnerKind};
pub use autoqa::registry::{AgentDefinition, AgentRegistry, DefinitionStatus, DocumentFormat};
pub use autoqa::router::EventRouter;
pub use autoqa::runtime::{AgentRuntime, InstanceState, Task, TaskOutcome, TaskTrigger};
pub use autoqa::scheduler::CronScheduler;
pub use autoqa::skill::{SkillDefinition, SkillRegistry};
pub use autoqa::store::{MemoryStore, Store};
pub use autoqa::tool::{ToolDispatcher, ToolMetadata, ToolResult, ToolStatus};
