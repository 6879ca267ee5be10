//! Suspended client-executed tool calls awaiting a result from a later run.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tether_core::ids::{ThreadId, ToolCallId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ResolveError;

/// One suspension: the dispatch record plus its single-fill resolution slot.
pub struct PendingToolCall {
    pub thread_id: ThreadId,
    pub tool_name: String,
    pub created_at: Instant,
    slot: oneshot::Sender<String>,
}

/// Registry of suspended tool calls keyed by tool-call id.
///
/// Entries never expire on their own. An unresolved entry holds its
/// suspended handler until [`PendingToolCalls::evict_older_than`] or
/// [`PendingToolCalls::cancel_thread`] drops it.
#[derive(Default)]
pub struct PendingToolCalls {
    entries: DashMap<ToolCallId, PendingToolCall>,
}

impl PendingToolCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a suspension and return the receiving half of its slot.
    pub fn register(
        &self,
        tool_call_id: ToolCallId,
        thread_id: ThreadId,
        tool_name: impl Into<String>,
    ) -> oneshot::Receiver<String> {
        let (slot, rx) = oneshot::channel();
        let entry = PendingToolCall {
            thread_id,
            tool_name: tool_name.into(),
            created_at: Instant::now(),
            slot,
        };
        if self.entries.insert(tool_call_id.clone(), entry).is_some() {
            warn!(tool_call_id = %tool_call_id, "replaced an existing pending tool call");
        }
        debug!(tool_call_id = %tool_call_id, "tool call suspended");
        rx
    }

    pub fn contains(&self, tool_call_id: &ToolCallId) -> bool {
        self.entries.contains_key(tool_call_id)
    }

    /// Fill the slot and remove the entry. The entry is removed before the
    /// result is delivered, so a second resolve for the same id always
    /// fails with [`ResolveError::Unknown`].
    pub fn resolve(&self, tool_call_id: &ToolCallId, result: String) -> Result<(), ResolveError> {
        let (id, entry) = self
            .entries
            .remove(tool_call_id)
            .ok_or_else(|| ResolveError::Unknown(tool_call_id.clone()))?;
        info!(
            tool_call_id = %id,
            tool_name = %entry.tool_name,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "resolving pending tool call"
        );
        entry.slot.send(result).map_err(|_| ResolveError::Abandoned(id))
    }

    /// Drop an entry without resolving it.
    pub fn discard(&self, tool_call_id: &ToolCallId) -> bool {
        self.entries.remove(tool_call_id).is_some()
    }

    /// Drop every entry of a thread; their handlers observe a closed slot.
    pub fn cancel_thread(&self, thread_id: &ThreadId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| &entry.thread_id != thread_id);
        before.saturating_sub(self.entries.len())
    }

    /// Drop entries older than `max_age`, returning their ids.
    pub fn evict_older_than(&self, max_age: Duration) -> Vec<ToolCallId> {
        let stale: Vec<ToolCallId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().created_at.elapsed() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            if self.entries.remove(id).is_some() {
                warn!(tool_call_id = %id, "evicted stale pending tool call");
            }
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
