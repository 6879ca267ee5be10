//! System instruction and fallback prompt text.

use tether_core::ids::ToolCallId;

use crate::tools::{PATCH_STATE_TOOL, UPDATE_STATE_TOOL};

pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant. Some tools run in the user's \
application; when you call one, wait for its result before continuing.";

/// The base instruction, plus the state-management directive when the
/// thread has shared application state.
pub fn build_system_message(base: &str, with_state: bool) -> String {
    if !with_state {
        return base.to_string();
    }
    format!(
        "{base}\n\n\
         The application shares a JSON state document with you. To change it, call \
         `{UPDATE_STATE_TOOL}` with {{\"state\": {{...}}}} holding only the top-level keys that \
         change, or `{PATCH_STATE_TOOL}` with {{\"operations\": [...]}} holding RFC 6902 \
         add/remove/replace operations. Never describe a state change without making it \
         through one of these tools."
    )
}

/// Prompt submitted when a tool result arrives for a call the server no
/// longer has suspended.
pub fn fallback_prompt(tool_call_id: &ToolCallId, result: &str) -> String {
    format!(
        "The result of tool call {tool_call_id} is now available:\n\n{result}\n\n\
         Continue the conversation using this result."
    )
}
