//! The per-task LLM turn loop.
//!
//! A running task is a bounded, interpreter-style loop around the provider:
//! compose the prompt (mode system prompt with context slots injected, the
//! rolling summary, the last literal turns, the current message), call the
//! LLM, execute any requested tools through the per-instance result cache,
//! then act on the assistant's output parsed as an [`AgentOutput`]:
//! plain text ends the task; `DELEGATE TO <agent>` runs a child task with a
//! clean history; `LOAD SKILL <name>` / `UNLOAD SKILL` switch the
//! instance's operating mode.
//!
//! Suspension points — the only places the loop yields — are the LLM call,
//! tool dispatch, the declared `final_wait_time` after action chains,
//! delegation, and the cancellation/pause check after each turn. An
//! in-flight LLM call always completes; cancellation and pause act between
//! turns.
//!
//! An empty provider response with `end_turn` is an operational hazard,
//! not a retry case: the task fails with a diagnostic carrying tool count,
//! prompt size, and token totals (flagged "context overload probable" when
//! usage is near the model window).

use crate::autoqa::config::TaskLoopConfig;
use crate::autoqa::llm::{ChatMessage, LlmClient, LlmResponse, StopReason, ToolCallRequest, ToolSpec};
use crate::autoqa::registry::AgentDefinition;
use crate::autoqa::runtime::{
    AgentRuntime, ControlSignal, InstanceShared, InstanceState, Task, TaskOutcome, ToolCallRecord,
};
use crate::autoqa::session_context::SessionContext;
use crate::autoqa::skill::{SkillDefinition, SkillRegistry};
use crate::autoqa::tool::{ToolDispatcher, ToolResult};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Everything the task loop needs from the runtime, bundled so the worker
/// can hand it down without exposing the runtime internals.
pub(crate) struct TaskEnv {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolDispatcher>,
    pub skills: Arc<SkillRegistry>,
    pub config: TaskLoopConfig,
    pub runtime: Weak<AgentRuntime>,
}

/// The assistant's output for one turn, parsed into its control meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Text(String),
    Delegate(String),
    LoadSkill(String),
    UnloadSkill,
}

/// Parse directives out of the assistant's final text. The first directive
/// found wins; text with no directive is plain [`AgentOutput::Text`].
pub fn parse_output(text: &str) -> AgentOutput {
    if let Some(target) = token_after(text, "DELEGATE TO ") {
        return AgentOutput::Delegate(target);
    }
    if let Some(name) = token_after(text, "LOAD SKILL ") {
        return AgentOutput::LoadSkill(name);
    }
    if text.contains("UNLOAD SKILL") {
        return AgentOutput::UnloadSkill;
    }
    AgentOutput::Text(text.to_string())
}

fn token_after(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    let token: String = text[start..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.' || c == ',')
        .to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Build the router-mode system prompt for an agent.
fn router_prompt(definition: &AgentDefinition, skills: &SkillRegistry) -> String {
    let mut prompt = format!("You are {}, an autonomous QA agent.\n", definition.name);
    if let Some(description) = definition
        .goal
        .description
        .as_deref()
        .or(definition.description.as_deref())
    {
        prompt.push_str(description);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nAnswer trivial requests directly. When a request needs a specialized \
         capability, respond with exactly `LOAD SKILL <name>` and nothing else. \
         To hand work to a declared sub-agent, respond with `DELEGATE TO <agent_id>`.\n",
    );
    let known: Vec<&str> = definition
        .available_skills
        .iter()
        .filter(|name| skills.contains(name))
        .map(|name| name.as_str())
        .collect();
    if !known.is_empty() {
        prompt.push_str("\nAvailable skills:\n");
        for name in known {
            match skills.get(name).and_then(|s| s.description.clone()) {
                Some(description) => {
                    prompt.push_str(&format!("- {}: {}\n", name, description))
                }
                None => prompt.push_str(&format!("- {}\n", name)),
            }
        }
    }
    if !definition.subagents.is_empty() {
        prompt.push_str("\nDeclared sub-agents:\n");
        for sub in &definition.subagents {
            if sub.delegate_for.is_empty() {
                prompt.push_str(&format!("- {}\n", sub.id));
            } else {
                prompt.push_str(&format!("- {} ({})\n", sub.id, sub.delegate_for.join(", ")));
            }
        }
    }
    prompt
}

/// Assemble the provider tool catalog for the current mode.
async fn build_tool_specs(
    env: &TaskEnv,
    tool_names: &[String],
    skill: Option<&SkillDefinition>,
) -> Vec<ToolSpec> {
    let mut specs = Vec::with_capacity(tool_names.len());
    for name in tool_names {
        let prompt_cache = skill.map(|s| s.prompt_cache(name)).unwrap_or(false);
        match env.tools.describe(name).await {
            Some(meta) => specs.push(ToolSpec {
                name: meta.name,
                description: meta.description,
                parameters_schema: meta.parameters_schema,
                prompt_cache,
            }),
            None => specs.push(ToolSpec {
                name: name.clone(),
                description: String::new(),
                parameters_schema: serde_json::json!({"type": "object", "properties": {}}),
                prompt_cache,
            }),
        }
    }
    specs
}

/// Wait out pause and report cancellation. Returns true when the task
/// should stop.
async fn check_control(
    shared: &Arc<InstanceShared>,
    control: &mut watch::Receiver<ControlSignal>,
) -> bool {
    loop {
        let signal = *control.borrow();
        if signal.cancelled {
            return true;
        }
        if signal.paused {
            // Park at this suspension point; held locks are kept.
            *shared.state.write().await = InstanceState::Paused;
            if control.changed().await.is_err() {
                return true;
            }
            continue;
        }
        if *shared.state.read().await == InstanceState::Paused {
            *shared.state.write().await = InstanceState::Running;
        }
        return false;
    }
}

/// Run one tool call through the cache and the dispatcher.
async fn run_tool_call(
    env: &TaskEnv,
    shared: &Arc<InstanceShared>,
    skill: Option<&SkillDefinition>,
    auto_retry: bool,
    call: &ToolCallRequest,
) -> (ToolResult, bool) {
    let policy = skill.and_then(|s| s.cache_policy(&call.name)).cloned();
    if let Some(policy) = &policy {
        if let Some(hit) = shared.cache.get(&call.name, &call.arguments, policy) {
            log::debug!("cache hit for tool {} on {}", call.name, shared.instance_id);
            return (hit, true);
        }
    }

    let mut attempt = env.tools.execute(&call.name, call.arguments.clone()).await;
    if attempt.is_err() && auto_retry {
        log::warn!(
            "tool {} dispatch failed, retrying once (auto_retry): {}",
            call.name,
            attempt.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
        );
        attempt = env.tools.execute(&call.name, call.arguments.clone()).await;
    }

    let result = match attempt {
        Ok(result) => result,
        Err(err) => ToolResult::failed(format!("tool dispatch error: {}", err)),
    };
    if let Some(policy) = &policy {
        shared
            .cache
            .put(&call.name, &call.arguments, result.clone(), policy);
    }
    (result, false)
}

fn tool_result_message(call: &ToolCallRequest, result: &ToolResult) -> ChatMessage {
    let content = if result.succeeded() {
        format!(
            "Tool '{}' returned: {}",
            call.name,
            serde_json::to_string(&result.data).unwrap_or_else(|_| "<unserializable>".into())
        )
    } else {
        format!(
            "Tool '{}' failed: {}",
            call.name,
            result.failure_message().unwrap_or("unknown error")
        )
    };
    ChatMessage::tool_result(call.id.clone(), content)
}

/// Drive `task` to a terminal outcome on `shared`.
pub(crate) async fn run_task(
    env: &TaskEnv,
    shared: &Arc<InstanceShared>,
    task: &mut Task,
    mut control: watch::Receiver<ControlSignal>,
) -> TaskOutcome {
    let definition = shared.definition.clone();
    let message = task.trigger.message();

    // Delegated child tasks get a clean history; everything else shares
    // the instance session.
    let mut local_session = SessionContext::for_delegation();
    let mut session_guard = if task.delegated {
        None
    } else {
        Some(shared.session.lock().await)
    };
    let session: &mut SessionContext = match session_guard.as_deref_mut() {
        Some(session) => session,
        None => &mut local_session,
    };

    // Optional keyphrase pre-selection: enter skill mode straight away
    // when the message scores against a declared skill's triggers.
    if env.config.preselect_skills && !task.delegated && session.active_skill.is_none() {
        if let Some(skill) = env
            .skills
            .match_message(&message, &definition.available_skills)
        {
            log::info!(
                "instance {} pre-selected skill {} from message",
                shared.instance_id,
                skill.name
            );
            session.active_skill = Some(skill.name.clone());
        }
    }

    let started = task.started_at.unwrap_or_else(Utc::now);
    let mut working: Vec<ChatMessage> = session.compose_history(&message, env.config.keep_last_turns);
    let mut first_tool: Option<String> = None;
    let mut turn: usize = 0;

    let final_text = loop {
        if check_control(shared, &mut control).await {
            return TaskOutcome::Cancelled;
        }

        // Effective timeout follows the active skill's override when set.
        let active_skill = session
            .active_skill
            .as_deref()
            .and_then(|name| env.skills.get(name));
        let timeout_seconds = active_skill
            .and_then(|s| s.timeout_seconds)
            .unwrap_or(definition.config.timeout_seconds);
        let elapsed = Utc::now().signed_duration_since(started);
        if elapsed.num_seconds() >= 0 && elapsed.num_seconds() as u64 >= timeout_seconds {
            return TaskOutcome::Failed {
                reason: format!("timeout after {}s", timeout_seconds),
            };
        }

        turn += 1;
        if turn > env.config.max_turns {
            return TaskOutcome::Failed {
                reason: format!("turn budget of {} exhausted", env.config.max_turns),
            };
        }

        let (system_prompt, tool_names) = match active_skill {
            Some(skill) => (skill.system_prompt.clone(), skill.tools.clone()),
            None => (
                router_prompt(&definition, &env.skills),
                definition.default_tools.clone(),
            ),
        };
        let system = session.slots.inject(&system_prompt);
        let specs = build_tool_specs(env, &tool_names, active_skill).await;

        let mut messages = Vec::with_capacity(working.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(working.iter().cloned());

        shared.touch_heartbeat().await;
        let response: LlmResponse = match env.llm.complete(&messages, &specs).await {
            Ok(response) => response,
            Err(err) => {
                return TaskOutcome::Failed {
                    reason: format!("LLM call failed: {}", err),
                }
            }
        };
        if let Some(usage) = &response.usage {
            task.usage.absorb(usage);
        }

        if response.is_empty() && response.stop_reason == StopReason::EndTurn {
            let near_limit =
                task.usage.total_tokens >= env.config.context_window.saturating_mul(9) / 10;
            let mut reason = format!(
                "empty LLM response with end_turn ({} tools offered, {} prompt messages, {} total tokens)",
                specs.len(),
                messages.len(),
                task.usage.total_tokens
            );
            if near_limit {
                reason.push_str("; context overload probable");
            }
            log::error!("task {} failed: {}", task.task_id, reason);
            return TaskOutcome::Failed { reason };
        }

        let assistant_text = response.content.clone();

        if !response.tool_calls.is_empty() {
            let mut assistant_turn = ChatMessage::assistant(&assistant_text);
            assistant_turn.tool_calls = response.tool_calls.clone();
            working.push(assistant_turn);

            // Tool calls from one turn dispatch concurrently; no
            // cross-tool ordering.
            let auto_retry = definition.config.auto_retry;
            let outcomes = join_all(response.tool_calls.iter().map(|call| {
                let skill = active_skill;
                async move {
                    let (result, cached) =
                        run_tool_call(env, shared, skill, auto_retry, call).await;
                    (call, result, cached)
                }
            }))
            .await;

            let mut settle: Option<std::time::Duration> = None;
            for (call, result, cached) in outcomes {
                if first_tool.is_none() {
                    first_tool = Some(call.name.clone());
                }
                task.tool_call_log.push(ToolCallRecord {
                    tool: call.name.clone(),
                    params: call.arguments.clone(),
                    success: result.succeeded(),
                    cached,
                    at: Utc::now(),
                });
                session.slots.absorb(&call.name, &result);
                if let Some(wait) = result.final_wait_time() {
                    settle = Some(settle.map_or(wait, |current| current.max(wait)));
                }
                working.push(tool_result_message(call, &result));
            }

            if let Some(wait) = settle {
                tokio::time::sleep(wait).await;
            }
            continue;
        }

        match parse_output(&assistant_text) {
            AgentOutput::Delegate(child) if definition.declares_subagent(&child) => {
                working.push(ChatMessage::assistant(&assistant_text));
                let mut visited: HashSet<String> = task.visited.clone();
                visited.insert(definition.id.clone());
                let runtime = match env.runtime.upgrade() {
                    Some(runtime) => runtime,
                    None => {
                        return TaskOutcome::Failed {
                            reason: "runtime shut down during delegation".to_string(),
                        }
                    }
                };
                match runtime.delegate(&child, message.clone(), visited).await {
                    Ok((child_task_id, text)) => {
                        task.child_tasks.push(child_task_id);
                        working.push(ChatMessage::user(format!(
                            "Delegated task result from {}: {}",
                            child, text
                        )));
                    }
                    Err(err) => {
                        log::warn!(
                            "delegation from {} to {} refused: {}",
                            definition.id,
                            child,
                            err
                        );
                        working.push(ChatMessage::user(format!(
                            "Delegation to {} failed: {}",
                            child, err
                        )));
                    }
                }
                continue;
            }
            AgentOutput::LoadSkill(name)
                if definition.available_skills.contains(&name) && env.skills.contains(&name) =>
            {
                log::info!("instance {} loading skill {}", shared.instance_id, name);
                session.active_skill = Some(name.clone());
                working.push(ChatMessage::assistant(&assistant_text));
                working.push(ChatMessage::user(format!(
                    "Skill '{}' loaded. Continue with the original request.",
                    name
                )));
                continue;
            }
            AgentOutput::UnloadSkill if session.active_skill.is_some() => {
                let unloaded = session.active_skill.take();
                log::info!(
                    "instance {} unloaded skill {}",
                    shared.instance_id,
                    unloaded.as_deref().unwrap_or("")
                );
                working.push(ChatMessage::assistant(&assistant_text));
                working.push(ChatMessage::user(
                    "Skill unloaded; back in router mode. Continue with the original request."
                        .to_string(),
                ));
                continue;
            }
            // Unknown delegate targets and skills fall through as text.
            _ => match response.stop_reason {
                StopReason::MaxTokens => {
                    return TaskOutcome::Failed {
                        reason: "response truncated (max_tokens)".to_string(),
                    }
                }
                _ => break assistant_text,
            },
        }
    };

    // Record the exchange on the session and leave skill mode: skill
    // activation spans at most one task.
    session.push_message(ChatMessage::user(&message));
    session.push_message(ChatMessage::assistant(&final_text));
    session.note_turn(
        &message,
        first_tool.as_deref(),
        &final_text,
        env.config.summary_max_lines,
    );
    session.active_skill = None;

    TaskOutcome::Completed { text: final_text }
}
