//! Versioned agent registry.
//!
//! Agents are declared as human-editable YAML (or JSON) documents and
//! registered as immutable `(agent_id, semver)` versions. Event routing
//! only ever resolves `published` versions; the latest semver per agent is
//! the default. Validation is strict on structure (semver shape, trigger
//! priorities, non-empty event pools, resolvable sub-agent references) and
//! lenient on capability names: unknown skills are warnings tracked on the
//! record, never errors — the runtime simply does not expose them.
//!
//! # Document shape
//!
//! ```yaml
//! id: qa-mobile
//! name: QA Mobile Agent
//! version: 1.2.0
//! goal:
//!   type: continuous
//!   description: Watch mobile alerts and investigate
//! triggers:
//!   - event_type: alert.blackscreen
//!     priority: critical
//!     filters: {platform: mobile}
//! event_pools: [mobile_tasks]
//! subagents:
//!   - id: qa-mobile-manager
//!     delegate_for: [mobile_navigation]
//! available_skills: [exploration-mobile]
//! default_tools: [list_interfaces]
//! config:
//!   max_parallel_tasks: 2
//!   timeout_seconds: 600
//! ```

use crate::autoqa::event::{Event, EventPriority};
use crate::autoqa::skill::SkillRegistry;
use crate::autoqa::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Minimal semantic version triple. The registry needs validity and
/// ordering, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Semver(pub u64, pub u64, pub u64);

impl FromStr for Semver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected MAJOR.MINOR.PATCH, got '{}'", s));
        }
        let parse = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| format!("non-numeric component '{}' in '{}'", p, s))
        };
        Ok(Semver(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Publication status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Deprecated,
}

/// How the agent runs its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalKind {
    #[serde(rename = "continuous")]
    Continuous,
    #[serde(rename = "on-demand")]
    OnDemand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSpec {
    #[serde(rename = "type")]
    pub kind: GoalKind,
    #[serde(default)]
    pub description: Option<String>,
}

/// One event subscription rule declared by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub event_type: String,
    #[serde(default)]
    pub priority: EventPriority,
    /// Equality filters applied against the event payload.
    #[serde(default)]
    pub filters: HashMap<String, serde_json::Value>,
}

/// Reference to a sub-agent this agent may delegate to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRef {
    pub id: String,
    /// Free-form version constraint; `None` means latest published.
    #[serde(default)]
    pub version: Option<String>,
    /// Delegation tags the child accepts work for.
    #[serde(default)]
    pub delegate_for: Vec<String>,
    /// Explicit forward-declaration: the referenced agent need not be
    /// registered yet.
    #[serde(default)]
    pub forward: bool,
}

/// Execution limits and flags for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub auto_retry: bool,
    /// Tags whose actions require out-of-band approval.
    #[serde(default)]
    pub approval_required: Vec<String>,
}

fn default_max_parallel_tasks() -> usize {
    1
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel_tasks(),
            timeout_seconds: default_timeout_seconds(),
            auto_retry: false,
            approval_required: Vec::new(),
        }
    }
}

/// A complete, immutable agent document (one version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub selectable: bool,
    #[serde(rename = "default", default)]
    pub is_default: bool,
    pub goal: GoalSpec,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub event_pools: Vec<String>,
    #[serde(default)]
    pub subagents: Vec<SubAgentRef>,
    #[serde(default)]
    pub available_skills: Vec<String>,
    /// Router-mode tool set, available before any skill loads.
    #[serde(default)]
    pub default_tools: Vec<String>,
    /// Permissions grouped by resource class.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

impl AgentDefinition {
    pub fn semver(&self) -> Result<Semver, String> {
        self.version.parse()
    }

    /// Whether `agent_id` is declared as a sub-agent of this definition.
    pub fn declares_subagent(&self, agent_id: &str) -> bool {
        self.subagents.iter().any(|s| s.id == agent_id)
    }
}

fn default_true() -> bool {
    true
}

/// A registered definition plus registry-side bookkeeping.
#[derive(Debug, Clone)]
pub struct DefinitionRecord {
    pub definition: AgentDefinition,
    pub status: DefinitionStatus,
    pub registered_at: DateTime<Utc>,
    /// Skill names the definition declares but the skill registry does not
    /// know. Warnings only; the runtime will not expose them.
    pub unknown_skills: Vec<String>,
}

/// Text formats accepted by import/export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

/// Registry errors, tagged for programmatic handling.
#[derive(Debug)]
pub enum RegistryError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Parse(String),
    Storage(StoreError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Validation(msg) => write!(f, "Invalid definition: {}", msg),
            RegistryError::NotFound(what) => write!(f, "Not found: {}", what),
            RegistryError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            RegistryError::Parse(msg) => write!(f, "Failed to parse document: {}", msg),
            RegistryError::Storage(err) => write!(f, "Storage failure: {}", err),
        }
    }
}

impl Error for RegistryError {}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::Storage(err)
    }
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation(_) => "validation",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Conflict(_) => "conflict",
            RegistryError::Parse(_) => "validation",
            RegistryError::Storage(_) => "storage",
        }
    }
}

/// The versioned agent registry.
pub struct AgentRegistry {
    store: Arc<dyn Store>,
    skills: Arc<SkillRegistry>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, skills: Arc<SkillRegistry>) -> Self {
        Self { store, skills }
    }

    /// Validate and store a new definition version in `Draft` status.
    ///
    /// Returns the `(agent_id, version)` key. Registering an existing
    /// version is a conflict — versions are immutable.
    pub async fn register(
        &self,
        definition: AgentDefinition,
    ) -> Result<(String, String), RegistryError> {
        self.validate(&definition).await?;

        if self
            .store
            .get_definition(&definition.id, &definition.version)
            .await?
            .is_some()
        {
            return Err(RegistryError::Conflict(format!(
                "agent {} version {} is already registered",
                definition.id, definition.version
            )));
        }

        let unknown_skills: Vec<String> = definition
            .available_skills
            .iter()
            .filter(|name| !self.skills.contains(name))
            .cloned()
            .collect();
        if !unknown_skills.is_empty() {
            log::warn!(
                "agent {} v{} references unknown skills: {}",
                definition.id,
                definition.version,
                unknown_skills.join(", ")
            );
        }

        let key = (definition.id.clone(), definition.version.clone());
        self.store
            .put_definition(DefinitionRecord {
                definition,
                status: DefinitionStatus::Draft,
                registered_at: Utc::now(),
                unknown_skills,
            })
            .await?;
        Ok(key)
    }

    async fn validate(&self, definition: &AgentDefinition) -> Result<(), RegistryError> {
        if definition.id.trim().is_empty() {
            return Err(RegistryError::Validation("agent id must be non-empty".into()));
        }
        definition
            .semver()
            .map_err(|e| RegistryError::Validation(format!("bad semver: {}", e)))?;
        if definition
            .event_pools
            .iter()
            .any(|pool| pool.trim().is_empty())
        {
            return Err(RegistryError::Validation(
                "event_pools entries must be non-empty strings".into(),
            ));
        }
        for sub in &definition.subagents {
            if sub.forward {
                continue;
            }
            let known = !self.store.list_versions(&sub.id).await?.is_empty();
            if !known && sub.id != definition.id {
                return Err(RegistryError::Validation(format!(
                    "sub-agent '{}' is not registered and not forward-declared",
                    sub.id
                )));
            }
        }
        Ok(())
    }

    /// Fetch a definition. `version = None` resolves the latest semver.
    pub async fn get(
        &self,
        agent_id: &str,
        version: Option<&str>,
    ) -> Result<DefinitionRecord, RegistryError> {
        match version {
            Some(v) => self
                .store
                .get_definition(agent_id, v)
                .await?
                .ok_or_else(|| RegistryError::NotFound(format!("agent {} v{}", agent_id, v))),
            None => {
                let latest = self
                    .latest_version(agent_id, None)
                    .await?
                    .ok_or_else(|| RegistryError::NotFound(format!("agent {}", agent_id)))?;
                self.store
                    .get_definition(agent_id, &latest)
                    .await?
                    .ok_or_else(|| RegistryError::NotFound(format!("agent {}", agent_id)))
            }
        }
    }

    async fn latest_version(
        &self,
        agent_id: &str,
        status: Option<DefinitionStatus>,
    ) -> Result<Option<String>, RegistryError> {
        let mut best: Option<(Semver, String)> = None;
        for record in self.store.list_definitions(Some(agent_id)).await? {
            if let Some(wanted) = status {
                if record.status != wanted {
                    continue;
                }
            }
            if let Ok(sv) = record.definition.semver() {
                let newer = best.as_ref().map(|(top, _)| *top < sv).unwrap_or(true);
                if newer {
                    best = Some((sv, record.definition.version.clone()));
                }
            }
        }
        Ok(best.map(|(_, v)| v))
    }

    /// List records, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<DefinitionStatus>,
    ) -> Result<Vec<DefinitionRecord>, RegistryError> {
        let mut records = self.store.list_definitions(None).await?;
        if let Some(wanted) = status {
            records.retain(|r| r.status == wanted);
        }
        Ok(records)
    }

    /// All registered versions of one agent, ascending by semver.
    pub async fn list_versions(&self, agent_id: &str) -> Result<Vec<String>, RegistryError> {
        let mut versions: Vec<(Semver, String)> = self
            .store
            .list_versions(agent_id)
            .await?
            .into_iter()
            .filter_map(|v| v.parse::<Semver>().ok().map(|sv| (sv, v)))
            .collect();
        versions.sort();
        Ok(versions.into_iter().map(|(_, v)| v).collect())
    }

    pub async fn publish(&self, agent_id: &str, version: &str) -> Result<(), RegistryError> {
        self.set_status(agent_id, version, DefinitionStatus::Published)
            .await
    }

    pub async fn deprecate(&self, agent_id: &str, version: &str) -> Result<(), RegistryError> {
        self.set_status(agent_id, version, DefinitionStatus::Deprecated)
            .await
    }

    async fn set_status(
        &self,
        agent_id: &str,
        version: &str,
        status: DefinitionStatus,
    ) -> Result<(), RegistryError> {
        let mut record = self
            .store
            .get_definition(agent_id, version)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {} v{}", agent_id, version)))?;
        record.status = status;
        self.store.put_definition(record).await?;
        Ok(())
    }

    pub async fn delete(&self, agent_id: &str, version: &str) -> Result<(), RegistryError> {
        self.store
            .delete_definition(agent_id, version)
            .await
            .map_err(RegistryError::from)
    }

    /// All published definitions whose triggers match the event's type and
    /// whose payload filters all hold. One definition per agent id — the
    /// latest published semver. Ties between agents are not broken; every
    /// match receives the event.
    pub async fn resolve_for_event(
        &self,
        event: &Event,
    ) -> Result<Vec<AgentDefinition>, RegistryError> {
        let candidates = self
            .store
            .definitions_for_trigger(&event.event_type)
            .await?;

        let mut latest: HashMap<String, (Semver, AgentDefinition)> = HashMap::new();
        for record in candidates {
            if record.status != DefinitionStatus::Published {
                continue;
            }
            let matches = record
                .definition
                .triggers
                .iter()
                .any(|t| t.event_type == event.event_type && event.matches_filters(&t.filters));
            if !matches {
                continue;
            }
            let sv = match record.definition.semver() {
                Ok(sv) => sv,
                Err(_) => continue,
            };
            let newer = latest
                .get(&record.definition.id)
                .map(|(top, _)| *top < sv)
                .unwrap_or(true);
            if newer {
                latest.insert(record.definition.id.clone(), (sv, record.definition));
            }
        }
        Ok(latest.into_iter().map(|(_, (_, def))| def).collect())
    }

    /// Parse a textual document and register it.
    pub async fn import_from_text(
        &self,
        text: &str,
        format: DocumentFormat,
    ) -> Result<(String, String), RegistryError> {
        let definition: AgentDefinition = match format {
            DocumentFormat::Yaml => {
                serde_yaml::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))?
            }
            DocumentFormat::Json => {
                serde_json::from_str(text).map_err(|e| RegistryError::Parse(e.to_string()))?
            }
        };
        self.register(definition).await
    }

    /// Serialize a registered definition back to text.
    pub async fn export_to_text(
        &self,
        agent_id: &str,
        version: Option<&str>,
        format: DocumentFormat,
    ) -> Result<String, RegistryError> {
        let record = self.get(agent_id, version).await?;
        match format {
            DocumentFormat::Yaml => serde_yaml::to_string(&record.definition)
                .map_err(|e| RegistryError::Parse(e.to_string())),
            DocumentFormat::Json => serde_json::to_string_pretty(&record.definition)
                .map_err(|e| RegistryError::Parse(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_parsing() {
        assert_eq!("1.2.3".parse::<Semver>().unwrap(), Semver(1, 2, 3));
        assert!("1.2".parse::<Semver>().is_err());
        assert!("1.2.x".parse::<Semver>().is_err());
        assert!(Semver(1, 10, 0) > Semver(1, 9, 9));
    }

    #[test]
    fn definition_yaml_defaults() {
        let doc = r#"
id: qa-mobile
name: QA Mobile Agent
version: 1.0.0
goal:
  type: continuous
triggers:
  - event_type: alert.blackscreen
    priority: critical
    filters: {platform: mobile}
"#;
        let def: AgentDefinition = serde_yaml::from_str(doc).unwrap();
        assert!(def.selectable);
        assert!(!def.is_default);
        assert_eq!(def.config.max_parallel_tasks, 1);
        assert_eq!(def.config.timeout_seconds, 300);
        assert_eq!(def.goal.kind, GoalKind::Continuous);
        assert_eq!(def.triggers[0].priority, EventPriority::Critical);
    }

    #[test]
    fn goal_kind_wire_labels() {
        let on_demand: GoalKind = serde_yaml::from_str("on-demand").unwrap();
        assert_eq!(on_demand, GoalKind::OnDemand);
    }
}
