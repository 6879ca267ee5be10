use std::collections::HashSet;

use async_trait::async_trait;
use tether_core::hooks::{HookDecision, PreToolUseHook};
use tether_core::tools::ToolInvocation;
use tracing::debug;

/// Grants every tool call and tells the model where it executes.
pub struct LocationAwareHook {
    client_tools: HashSet<String>,
}

impl LocationAwareHook {
    pub fn new(client_tools: impl IntoIterator<Item = String>) -> Self {
        Self {
            client_tools: client_tools.into_iter().collect(),
        }
    }

    pub fn is_client_tool(&self, name: &str) -> bool {
        self.client_tools.contains(name)
    }
}

#[async_trait]
impl PreToolUseHook for LocationAwareHook {
    async fn before_tool_use(&self, call: &ToolInvocation) -> HookDecision {
        let context = if self.is_client_tool(&call.tool_name) {
            format!(
                "`{}` runs in the user's application. Its result arrives with the user's next \
                 request; do not guess it.",
                call.tool_name
            )
        } else {
            format!("`{}` runs on the server and returns immediately.", call.tool_name)
        };
        debug!(tool_call_id = %call.tool_call_id, tool_name = %call.tool_name, "tool use granted");
        HookDecision::Allow {
            additional_context: Some(context),
        }
    }
}
