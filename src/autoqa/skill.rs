//! Declarative skills: named capability bundles.
//!
//! A skill packages a system prompt, a tool list, a per-tool cache policy,
//! a platform tag, and a timeout. Skills are loaded once at startup from
//! YAML documents and are immutable for the lifetime of the process; agents
//! reference them by name through `available_skills`.
//!
//! An instance runs in **router mode** (the agent's small default tool set,
//! with a prompt that invites `LOAD SKILL <name>`) until the task loop
//! switches it into **skill mode**, at which point the skill's prompt and
//! tool list replace the router's. See the `task_loop` module.
//!
//! # YAML shape
//!
//! ```yaml
//! name: exploration-web
//! version: 1.0.0
//! description: Explore a web interface and map its navigation tree
//! triggers:
//!   - explore
//!   - web app
//! system_prompt: |
//!   You explore web interfaces...
//! tools:
//!   - navigate_to
//!   - list_actions
//! tool_cache:
//!   list_actions: {enabled: true, ttl_seconds: 300, prompt_cache: true}
//! platform: web
//! requires_device: true
//! timeout_seconds: 600
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Per-tool result-cache policy declared by a skill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCachePolicy {
    /// When false the cache is bypassed entirely for this tool.
    pub enabled: bool,
    /// Hit window in seconds. Zero means "session-only": entries never age
    /// out and die with the owning instance.
    #[serde(default)]
    pub ttl_seconds: u64,
    /// Mark the tool entry for the provider's upstream prompt cache.
    #[serde(default)]
    pub prompt_cache: bool,
}

/// Target platform a skill operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Mobile,
    Stb,
}

/// A declarative capability bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDefinition {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Keyphrases used by the optional pre-selection scorer.
    #[serde(default)]
    pub triggers: Vec<String>,
    pub system_prompt: String,
    pub tools: Vec<String>,
    #[serde(default)]
    pub tool_cache: HashMap<String, ToolCachePolicy>,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub requires_device: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SkillDefinition {
    /// The cache policy for `tool`, when one is declared and enabled.
    pub fn cache_policy(&self, tool: &str) -> Option<&ToolCachePolicy> {
        self.tool_cache.get(tool)
    }

    /// Whether `tool` should be flagged for the upstream prompt cache.
    pub fn prompt_cache(&self, tool: &str) -> bool {
        self.tool_cache
            .get(tool)
            .map(|p| p.prompt_cache)
            .unwrap_or(false)
    }
}

/// Errors raised while loading skill documents.
#[derive(Debug)]
pub enum SkillError {
    /// A YAML document failed to parse.
    Parse(String),
    /// Two documents declared the same skill name.
    Duplicate(String),
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::Parse(msg) => write!(f, "Failed to parse skill document: {}", msg),
            SkillError::Duplicate(name) => write!(f, "Duplicate skill name: {}", name),
        }
    }
}

impl Error for SkillError {}

impl SkillError {
    /// Stable kind tag for programmatic handling.
    pub fn kind(&self) -> &'static str {
        match self {
            SkillError::Parse(_) => "validation",
            SkillError::Duplicate(_) => "conflict",
        }
    }
}

/// Registry of all skills known to the process.
///
/// Loaded once at startup and shared as `Arc<SkillRegistry>`; insertion
/// order is preserved so the keyphrase scorer can break ties on it.
#[derive(Debug, Default)]
pub struct SkillRegistry {
    skills: Vec<SkillDefinition>,
    by_name: HashMap<String, usize>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one skill; rejects duplicate names.
    pub fn add(&mut self, skill: SkillDefinition) -> Result<(), SkillError> {
        if self.by_name.contains_key(&skill.name) {
            return Err(SkillError::Duplicate(skill.name));
        }
        self.by_name.insert(skill.name.clone(), self.skills.len());
        self.skills.push(skill);
        Ok(())
    }

    /// Load every document in a multi-document YAML string (`---`
    /// separated) into the registry.
    pub fn load_from_yaml(&mut self, text: &str) -> Result<usize, SkillError> {
        let mut loaded = 0;
        for document in serde_yaml::Deserializer::from_str(text) {
            let skill = SkillDefinition::deserialize(document)
                .map_err(|e| SkillError::Parse(e.to_string()))?;
            self.add(skill)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<&SkillDefinition> {
        self.by_name.get(name).map(|i| &self.skills[*i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.iter().map(|s| s.name.as_str())
    }

    /// Pre-select a skill from a user message.
    ///
    /// Score = Σ len(keyphrase) over trigger keyphrases present in the
    /// message (case-insensitive). Only skills named in `candidates` are
    /// considered; ties go to the earliest-registered skill. Zero score
    /// means "no match; stay in router mode".
    pub fn match_message(&self, message: &str, candidates: &[String]) -> Option<&SkillDefinition> {
        let haystack = message.to_lowercase();
        let mut best: Option<(&SkillDefinition, usize)> = None;
        for skill in &self.skills {
            if !candidates.iter().any(|c| c == &skill.name) {
                continue;
            }
            let score: usize = skill
                .triggers
                .iter()
                .filter(|phrase| haystack.contains(&phrase.to_lowercase()))
                .map(|phrase| phrase.len())
                .sum();
            if score > 0 {
                match best {
                    Some((_, top)) if top >= score => {}
                    _ => best = Some((skill, score)),
                }
            }
        }
        best.map(|(skill, _)| skill)
    }
}
