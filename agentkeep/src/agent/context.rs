//! BuildContext: assembles the system prompt, trimmed history, and
//! retrieved items into what the Decide step hands to the [`LlmAdapter`].
//!
//! Generalizes `RunState::init`'s oldest-first session-history splice into
//! an explicit function callable independent of the LLM call, per spec
//! §4.8 step 3.

use crate::agent::retrieval::MemoryItem;
use crate::types::{MessageRole, RunMessage};

/// Tool-result turns longer than this are truncated before the model sees
/// them again on a later step, per spec §4.8's "tool raw output summarized".
const TOOL_OUTPUT_SUMMARY_LIMIT: usize = 2_000;

/// The assembled input to one Decide-step model call.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// System prompt, with any retrieved items folded in.
    pub system_prompt: String,
    /// Trimmed, oldest-first message history.
    pub messages: Vec<RunMessage>,
}

/// Assemble a [`AgentContext`] from the base system prompt, full history,
/// and this step's retrieved items.
///
/// Trimming policy: the system prompt is always preserved in full; history
/// is dropped oldest-first down to `max_history_messages`; surviving tool
/// turns longer than [`TOOL_OUTPUT_SUMMARY_LIMIT`] are truncated.
#[must_use]
pub fn build_context(
    base_system_prompt: &str,
    history: Vec<RunMessage>,
    retrieved: &[MemoryItem],
    max_history_messages: usize,
) -> AgentContext {
    let mut system_prompt = base_system_prompt.to_string();
    if !retrieved.is_empty() {
        system_prompt.push_str("\n\nRelevant context:\n");
        for item in retrieved {
            system_prompt.push_str("- ");
            system_prompt.push_str(&item.content);
            system_prompt.push('\n');
        }
    }

    AgentContext {
        system_prompt,
        messages: trim_history(history, max_history_messages),
    }
}

fn trim_history(mut history: Vec<RunMessage>, max_history_messages: usize) -> Vec<RunMessage> {
    if history.len() > max_history_messages {
        let drop = history.len() - max_history_messages;
        history.drain(0..drop);
    }
    for message in &mut history {
        if message.role == MessageRole::Tool && message.content.len() > TOOL_OUTPUT_SUMMARY_LIMIT {
            message.content.truncate(TOOL_OUTPUT_SUMMARY_LIMIT);
            message.content.push_str("... [truncated]");
        }
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{AgentId, RunId};

    fn message(ordinal: u64, role: MessageRole, content: &str) -> RunMessage {
        RunMessage {
            run_id: RunId::new("run-1"),
            agent_id: AgentId::new("agent-default"),
            step_id: ordinal,
            ordinal,
            role,
            content: content.to_string(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    #[test]
    fn retrieved_items_are_folded_into_system_prompt() {
        let items = vec![MemoryItem {
            item_id: "m-1".into(),
            content: "user prefers metric units".into(),
        }];
        let ctx = build_context("be helpful", Vec::new(), &items, 10);
        assert!(ctx.system_prompt.contains("user prefers metric units"));
    }

    #[test]
    fn history_drops_oldest_first_past_the_limit() {
        let history = vec![
            message(1, MessageRole::User, "one"),
            message(2, MessageRole::Assistant, "two"),
            message(3, MessageRole::User, "three"),
        ];
        let ctx = build_context("sys", history, &[], 2);
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[0].content, "two");
        assert_eq!(ctx.messages[1].content, "three");
    }

    #[test]
    fn oversized_tool_output_is_truncated() {
        let long = "x".repeat(TOOL_OUTPUT_SUMMARY_LIMIT + 500);
        let history = vec![message(1, MessageRole::Tool, &long)];
        let ctx = build_context("sys", history, &[], 10);
        assert!(ctx.messages[0].content.ends_with("... [truncated]"));
        assert!(ctx.messages[0].content.len() < long.len());
    }
}
