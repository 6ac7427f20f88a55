//! Session memory for interactive agent instances.
//!
//! Rather than replaying an unbounded transcript, the task loop sends the
//! LLM a fixed-shape history: the rolling summary as one virtual exchange
//! (when present), the last two literal turns, and the current message.
//! Structured context slots (interface, tree id, host, device) are lifted
//! out of tool results and injected into the system prompt instead of
//! riding along as transcript text.
//!
//! Delegated child tasks never see the parent session: they start from a
//! clean [`SessionContext`] holding only the delegation message.

use crate::autoqa::llm::ChatMessage;
use crate::autoqa::tool::ToolResult;
use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    /// Tools whose successful results carry context worth pinning on the
    /// session: navigation, device control, screen dumps, and discovery.
    pub static ref CONTEXT_PRODUCING_TOOLS: HashSet<&'static str> = {
        let mut set = HashSet::new();
        set.insert("navigate_to");
        set.insert("execute_navigation");
        set.insert("remote_command");
        set.insert("press_key");
        set.insert("screen_dump");
        set.insert("capture_screenshot");
        set.insert("discover_interface");
        set.insert("list_interfaces");
        set.insert("list_actions");
        set
    };
}

const SUMMARY_USER_CHARS: usize = 30;
const SUMMARY_ACTION_CHARS: usize = 50;

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Structured context extracted from prior tool results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSlots {
    pub interface: Option<String>,
    pub tree_id: Option<String>,
    pub host: Option<String>,
    pub device: Option<String>,
}

impl ContextSlots {
    /// Pull slot values out of a successful result from a
    /// context-producing tool. Later extractions overwrite earlier ones.
    pub fn absorb(&mut self, tool_name: &str, result: &ToolResult) {
        if !result.succeeded() || !CONTEXT_PRODUCING_TOOLS.contains(tool_name) {
            return;
        }
        let output = &result.data;
        let take = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| output.get(*k))
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .next()
        };
        if let Some(value) = take(&["interface", "interface_name"]) {
            self.interface = Some(value);
        }
        if let Some(value) = take(&["tree_id"]) {
            self.tree_id = Some(value);
        }
        if let Some(value) = take(&["host", "host_name"]) {
            self.host = Some(value);
        }
        if let Some(value) = take(&["device", "device_id"]) {
            self.device = Some(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.tree_id.is_none()
            && self.host.is_none()
            && self.device.is_none()
    }

    /// Append a "Current context" block to a system prompt for every slot
    /// that is set.
    pub fn inject(&self, prompt: &str) -> String {
        if self.is_empty() {
            return prompt.to_string();
        }
        let mut out = String::from(prompt);
        out.push_str("\n\nCurrent context:\n");
        if let Some(interface) = &self.interface {
            out.push_str(&format!("- interface: {}\n", interface));
        }
        if let Some(tree_id) = &self.tree_id {
            out.push_str(&format!("- tree id: {}\n", tree_id));
        }
        if let Some(host) = &self.host {
            out.push_str(&format!("- host: {}\n", host));
        }
        if let Some(device) = &self.device {
            out.push_str(&format!("- device: {}\n", device));
        }
        out
    }
}

/// Conversation state carried across tasks on one instance.
#[derive(Debug, Default)]
pub struct SessionContext {
    messages: Vec<ChatMessage>,
    summary: Vec<String>,
    pub slots: ContextSlots,
    /// Name of the skill currently swapped in, if any (skill mode).
    pub active_skill: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a literal turn message (user or assistant).
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn history_len(&self) -> usize {
        self.messages.len()
    }

    pub fn summary_lines(&self) -> &[String] {
        &self.summary
    }

    /// Build the history slice sent to the provider for the next turn:
    /// summary virtual exchange (when a summary exists), the last
    /// `keep_last` literal messages, then the current user message.
    pub fn compose_history(&self, current_message: &str, keep_last: usize) -> Vec<ChatMessage> {
        let mut history = Vec::new();
        if !self.summary.is_empty() {
            history.push(ChatMessage::user(format!(
                "Summary of the conversation so far:\n{}",
                self.summary.join("\n")
            )));
            history.push(ChatMessage::assistant(
                "Understood. Continuing from that context.",
            ));
        }
        let start = self.messages.len().saturating_sub(keep_last);
        for message in &self.messages[start..] {
            history.push(message.clone());
        }
        history.push(ChatMessage::user(current_message));
        history
    }

    /// Fold a finished turn into the rolling summary.
    ///
    /// A line reads `• <user prefix>… → <action>` where the action is the
    /// first tool invoked, or a prefix of the assistant text when no tool
    /// ran. Only the most recent `max_lines` lines are kept.
    pub fn note_turn(
        &mut self,
        user_message: &str,
        first_tool: Option<&str>,
        assistant_text: &str,
        max_lines: usize,
    ) {
        let action = match first_tool {
            Some(tool) => tool.to_string(),
            None => truncate_chars(assistant_text.trim(), SUMMARY_ACTION_CHARS).to_string(),
        };
        let line = format!(
            "• {}… → {}",
            truncate_chars(user_message.trim(), SUMMARY_USER_CHARS),
            action
        );
        self.summary.push(line);
        let overflow = self.summary.len().saturating_sub(max_lines);
        if overflow > 0 {
            self.summary.drain(..overflow);
        }
    }

    /// A fresh session for a delegated child task: no history, no summary,
    /// no slots — only the active-skill field starts clean too.
    pub fn for_delegation() -> Self {
        Self::new()
    }
}
