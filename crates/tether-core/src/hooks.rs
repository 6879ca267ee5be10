use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tools::ToolInvocation;

/// Outcome of a pre-tool-use hook.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HookDecision {
    Allow {
        /// Extra context the session passes to the model alongside the call.
        #[serde(skip_serializing_if = "Option::is_none")]
        additional_context: Option<String>,
    },
    Deny {
        reason: String,
    },
}

impl HookDecision {
    pub fn allow() -> Self {
        Self::Allow {
            additional_context: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Invoked by the model session before every tool call.
#[async_trait]
pub trait PreToolUseHook: Send + Sync {
    async fn before_tool_use(&self, call: &ToolInvocation) -> HookDecision;
}

/// Grants every call without annotation.
pub struct AllowAll;

#[async_trait]
impl PreToolUseHook for AllowAll {
    async fn before_tool_use(&self, _call: &ToolInvocation) -> HookDecision {
        HookDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;

    #[test]
    fn decision_serde() {
        let allow = HookDecision::Allow {
            additional_context: Some("runs on client".into()),
        };
        let json = serde_json::to_value(&allow).unwrap();
        assert_eq!(json["decision"], "allow");
        assert_eq!(json["additional_context"], "runs on client");

        let deny: HookDecision =
            serde_json::from_value(serde_json::json!({"decision": "deny", "reason": "no"})).unwrap();
        assert!(!deny.is_allowed());
    }

    #[tokio::test]
    async fn allow_all_allows() {
        let call = ToolInvocation {
            tool_call_id: ToolCallId::new(),
            tool_name: "x".into(),
            arguments: serde_json::Value::Null,
        };
        assert_eq!(AllowAll.before_tool_use(&call).await, HookDecision::allow());
    }
}
