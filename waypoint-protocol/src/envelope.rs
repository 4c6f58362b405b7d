//! Message envelopes for both channels.
//!
//! The client channel speaks `Payload` in both directions. The control
//! channel reads a `ControlRequest` and answers with a `ControlResponse`,
//! which is a `task`/`load` pair plus optional statistics.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope exchanged with client connections.
///
/// `character_ids` is an optional recipient filter: when a broadcast
/// targets the connections of specific characters, their ids ride along
/// so a client with multiple tabs can tell which identity is addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Task name, never empty.
    pub task: String,

    /// Opaque payload data.
    pub load: Value,

    /// Recipient characterIds, if the broadcast is character-scoped.
    #[serde(rename = "characterIds")]
    pub character_ids: Option<Vec<i64>>,
}

impl Payload {
    /// Creates a new payload. The task name must be non-empty.
    pub fn new(
        task: impl Into<String>,
        load: Value,
        character_ids: Option<Vec<i64>>,
    ) -> Result<Self, ProtocolError> {
        let task = task.into();
        if task.is_empty() {
            return Err(ProtocolError::TaskMissing);
        }
        Ok(Self {
            task,
            load,
            character_ids,
        })
    }

    /// Parses a client text message.
    ///
    /// A message that is not a JSON object carrying both a `task` and a
    /// `load` key is dropped: `None`, no reply.
    pub fn from_client_text(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let obj = value.as_object()?;
        let task = obj.get("task")?.as_str()?;
        let load = obj.get("load")?.clone();
        Payload::new(task, load, None).ok()
    }
}

/// One framed document received on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Task name; an empty or absent task is rejected at dispatch.
    #[serde(default)]
    pub task: String,

    /// Task-specific data.
    #[serde(default)]
    pub load: Value,
}

/// Response written back on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Task name this response answers (or `error`).
    pub task: String,

    /// Result data for the task.
    pub load: Value,

    /// Gateway statistics, attached per-task or via configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
}

impl ControlResponse {
    pub fn new(task: impl Into<String>, load: Value) -> Self {
        Self {
            task: task.into(),
            load,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Value) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Builds the error envelope written on the failure path.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", Value::String(message.into()))
    }
}
