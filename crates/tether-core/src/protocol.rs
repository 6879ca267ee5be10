//! Inbound run protocol: the JSON body a client posts to start a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RunId, ThreadId, ToolCallId};

/// Conversation role of an input message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Developer,
    #[serde(alias = "tool-result", alias = "tool_result")]
    Tool,
}

/// One text-bearing part of a multi-part message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

/// Message content: either a plain string or a list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of every text part; non-text parts are skipped.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Unsupported => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<ToolCallId>,
}

impl InputMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: ToolCallId, text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
            tool_call_id: Some(tool_call_id),
        }
    }
}

/// Where a declared tool is executed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolLocation {
    /// Executed by the remote client; the model turn suspends until a later
    /// run carries the result.
    #[default]
    #[serde(alias = "frontend")]
    Client,
    /// Executed in-process by the server.
    #[serde(alias = "backend")]
    Server,
}

/// A tool declared by the client. `parameters` is an opaque JSON Schema
/// handed through to the model session untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub location: ToolLocation,
}

impl ToolDeclaration {
    pub fn client(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
            location: ToolLocation::Client,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Body of `POST /agent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunInput {
    pub thread_id: ThreadId,
    pub run_id: RunId,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// What a run was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCause {
    /// A new user instruction; `prompt` is the text of the last user message.
    FreshTurn { prompt: String },
    /// A result for a tool call the client executed.
    Resumption {
        tool_call_id: ToolCallId,
        result: String,
    },
}

impl RunCause {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FreshTurn { .. } => "user-message",
            Self::Resumption { .. } => "tool-result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("threadId must not be empty")]
    EmptyThreadId,
    #[error("runId must not be empty")]
    EmptyRunId,
    #[error("messages contain no user or tool message")]
    NoActionableMessage,
    #[error("tool message at index {0} has no toolCallId")]
    MissingToolCallId(usize),
}

impl RunInput {
    pub fn new(thread_id: ThreadId, run_id: RunId) -> Self {
        Self {
            thread_id,
            run_id,
            messages: Vec::new(),
            tools: Vec::new(),
            state: None,
        }
    }

    pub fn with_message(mut self, message: InputMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_tool(mut self, tool: ToolDeclaration) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.thread_id.is_empty() {
            return Err(InputError::EmptyThreadId);
        }
        if self.run_id.is_empty() {
            return Err(InputError::EmptyRunId);
        }
        self.cause().map(|_| ())
    }

    /// Classify the run by the last message whose role is `user` or `tool`.
    pub fn cause(&self) -> Result<RunCause, InputError> {
        let (index, message) = self
            .messages
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| matches!(m.role, Role::User | Role::Tool))
            .ok_or(InputError::NoActionableMessage)?;

        match message.role {
            Role::Tool => {
                let tool_call_id = message
                    .tool_call_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .ok_or(InputError::MissingToolCallId(index))?;
                Ok(RunCause::Resumption {
                    tool_call_id,
                    result: message.content.text(),
                })
            }
            _ => Ok(RunCause::FreshTurn {
                prompt: message.content.text(),
            }),
        }
    }
}
