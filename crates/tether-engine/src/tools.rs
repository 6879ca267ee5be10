//! Turns declared tools into callables installed on a model session.
//!
//! Client tools suspend the model turn: the handler announces the call on
//! the thread's active stream, ends that run, and waits for a later run to
//! deliver the result. State tools run in-process against the
//! [`StateReconciler`](crate::state::StateReconciler).

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_core::events::RunEvent;
use tether_core::ids::ThreadId;
use tether_core::protocol::{ToolDeclaration, ToolLocation};
use tether_core::tools::{SessionTool, ToolHandler, ToolInvocation, ToolResult};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::registries::RunRegistries;
use crate::state::StateUpdate;
use crate::streams::RunSink;

pub const UPDATE_STATE_TOOL: &str = "update_state";
pub const PATCH_STATE_TOOL: &str = "patch_state";

/// Builds the tool set of one thread's session.
pub struct ToolAdapter {
    thread_id: ThreadId,
    registries: Weak<RunRegistries>,
}

impl ToolAdapter {
    pub fn new(thread_id: ThreadId, registries: &Arc<RunRegistries>) -> Self {
        Self {
            thread_id,
            registries: Arc::downgrade(registries),
        }
    }

    /// Client declarations become suspending tools. Server declarations are
    /// only honoured for the built-in state tools, which are added when
    /// `with_state` is set. The first declaration of a name wins.
    pub fn adapt(&self, declarations: &[ToolDeclaration], with_state: bool) -> Vec<SessionTool> {
        let mut seen = HashSet::new();
        let mut tools = Vec::with_capacity(declarations.len() + 2);

        for decl in declarations {
            if !seen.insert(decl.name.clone()) {
                warn!(thread_id = %self.thread_id, tool_name = %decl.name, "duplicate tool declaration ignored");
                continue;
            }
            match decl.location {
                ToolLocation::Client => tools.push(SessionTool {
                    name: decl.name.clone(),
                    description: decl.description.clone(),
                    parameters_schema: decl
                        .parameters
                        .clone()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    location: ToolLocation::Client,
                    handler: Arc::new(ClientToolHandler {
                        thread_id: self.thread_id.clone(),
                        registries: self.registries.clone(),
                    }),
                }),
                ToolLocation::Server => {
                    // Server tools are provided here, not declared by the client.
                    seen.remove(&decl.name);
                    warn!(thread_id = %self.thread_id, tool_name = %decl.name, "unknown server tool skipped");
                }
            }
        }

        if with_state {
            for tool in self.state_tools() {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool);
                } else {
                    warn!(tool_name = %tool.name, "state tool shadowed by a client declaration");
                }
            }
        }
        tools
    }

    fn state_tools(&self) -> [SessionTool; 2] {
        [
            SessionTool {
                name: UPDATE_STATE_TOOL.into(),
                description: "Update the shared application state by replacing the given \
                              top-level keys."
                    .into(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "state": {
                            "type": "object",
                            "description": "Top-level keys to set, with their complete new values"
                        }
                    },
                    "required": ["state"]
                }),
                location: ToolLocation::Server,
                handler: Arc::new(StateToolHandler {
                    thread_id: self.thread_id.clone(),
                    registries: self.registries.clone(),
                    mode: StateMode::Merge,
                }),
            },
            SessionTool {
                name: PATCH_STATE_TOOL.into(),
                description: "Apply RFC 6902 add/remove/replace operations to the shared \
                              application state."
                    .into(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "operations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "op": {"type": "string", "enum": ["add", "remove", "replace"]},
                                    "path": {"type": "string"},
                                    "value": {}
                                },
                                "required": ["op", "path"]
                            }
                        }
                    },
                    "required": ["operations"]
                }),
                location: ToolLocation::Server,
                handler: Arc::new(StateToolHandler {
                    thread_id: self.thread_id.clone(),
                    registries: self.registries.clone(),
                    mode: StateMode::Patch,
                }),
            },
        ]
    }
}

fn announce(sink: &RunSink, call: &ToolInvocation) -> bool {
    sink.emit(RunEvent::ToolCallDispatch {
        tool_call_id: call.tool_call_id.clone(),
        tool_name: call.tool_name.clone(),
        arguments: call.arguments.to_string(),
    })
}

/// Handler of a human-in-the-loop tool.
pub struct ClientToolHandler {
    thread_id: ThreadId,
    registries: Weak<RunRegistries>,
}

impl ClientToolHandler {
    /// Register the suspension, announce it and end the current run. The
    /// registries are only borrowed for the duration of this call.
    fn dispatch(&self, call: &ToolInvocation) -> Result<oneshot::Receiver<String>, String> {
        let registries = self
            .registries
            .upgrade()
            .ok_or_else(|| "tool unavailable: the server no longer tracks this thread".to_string())?;
        let sink = registries.streams.current(&self.thread_id).ok_or_else(|| {
            format!("tool {} unavailable: no client is connected to receive it", call.tool_name)
        })?;

        let rx = registries.pending.register(
            call.tool_call_id.clone(),
            self.thread_id.clone(),
            call.tool_name.clone(),
        );
        if !announce(&sink, call) {
            registries.pending.discard(&call.tool_call_id);
            return Err(format!("tool {} unavailable: the client disconnected", call.tool_name));
        }
        sink.finish();
        info!(
            thread_id = %self.thread_id,
            run_id = %sink.run_id(),
            tool_call_id = %call.tool_call_id,
            tool_name = %call.tool_name,
            "handed tool call to client"
        );
        Ok(rx)
    }
}

#[async_trait]
impl ToolHandler for ClientToolHandler {
    async fn invoke(&self, call: ToolInvocation) -> ToolResult {
        let rx = match self.dispatch(&call) {
            Ok(rx) => rx,
            Err(message) => {
                warn!(thread_id = %self.thread_id, tool_call_id = %call.tool_call_id, %message, "client tool failed");
                return ToolResult::error(message);
            }
        };
        match rx.await {
            Ok(result) => {
                debug!(tool_call_id = %call.tool_call_id, "client tool result received");
                ToolResult::ok(result)
            }
            Err(_) => ToolResult::error(format!(
                "tool call {} was cancelled before a result arrived",
                call.tool_call_id
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateMode {
    Merge,
    Patch,
}

/// Handler of the built-in state tools.
pub struct StateToolHandler {
    thread_id: ThreadId,
    registries: Weak<RunRegistries>,
    mode: StateMode,
}

impl StateToolHandler {
    fn parse(&self, arguments: &Value) -> Result<StateUpdate, String> {
        match self.mode {
            StateMode::Merge => arguments
                .get("state")
                .and_then(Value::as_object)
                .cloned()
                .map(StateUpdate::Merge)
                .ok_or_else(|| r#"expected {"state": {...}}"#.to_string()),
            StateMode::Patch => arguments
                .get("operations")
                .and_then(Value::as_array)
                .cloned()
                .map(StateUpdate::Patch)
                .ok_or_else(|| r#"expected {"operations": [...]}"#.to_string()),
        }
    }

    fn run(&self, call: &ToolInvocation) -> Result<usize, String> {
        let registries = self
            .registries
            .upgrade()
            .ok_or_else(|| "state unavailable: the server no longer tracks this thread".to_string())?;
        let sink = registries
            .streams
            .current(&self.thread_id)
            .ok_or_else(|| "state unavailable: no client is connected".to_string())?;
        if !announce(&sink, call) {
            return Err("state unavailable: the client disconnected".to_string());
        }

        let update = self.parse(&call.arguments)?;
        let delta = registries
            .state
            .apply_if(&self.thread_id, update, |delta| {
                sink.emit(RunEvent::StateDelta {
                    delta: delta.operations().to_vec(),
                })
            })
            .map_err(|e| e.to_string())?;
        Ok(delta.len())
    }
}

fn failure(error: String) -> ToolResult {
    ToolResult::error(json!({"success": false, "error": error}).to_string())
}

#[async_trait]
impl ToolHandler for StateToolHandler {
    async fn invoke(&self, call: ToolInvocation) -> ToolResult {
        match self.run(&call) {
            Ok(operations) => {
                ToolResult::ok(json!({"success": true, "operations": operations}).to_string())
            }
            Err(error) => {
                warn!(thread_id = %self.thread_id, tool_name = %call.tool_name, %error, "state update rejected");
                failure(error)
            }
        }
    }
}
