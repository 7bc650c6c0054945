//! Event model shared by every producer and subscriber.
//!
//! A `BusEvent` is an immutable, append-only record. Events are never
//! mutated after publish; subscribers receive clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    User,
    Gateway,
    System,
}

/// A single event flowing through the bus.
///
/// Ids are monotonic within a process run. Events that never touch
/// storage get synthetic ids from a range disjoint from persisted row
/// ids (see [`super::SYNTHETIC_ID_BASE`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub source: EventSource,
    /// Free-form tag, e.g. `chat`, `agent`, `pty`, `capture`, `status`.
    pub event_type: String,
    /// Open key/value map.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// The stream key carried in the payload, if any. Replay-capable
    /// producers tag their chunks with `payload.stream`.
    pub fn stream_key(&self) -> Option<&str> {
        self.payload.get("stream").and_then(Value::as_str)
    }
}

/// Match rules a subscription applies to every published event.
///
/// All present fields must match; an absent field matches anything.
/// Used both internally and as the query shape of the SSE endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    /// Restrict to one replay stream (matched against `payload.stream`).
    /// Not exposed on the generic SSE endpoint; built internally by the
    /// replay attach path.
    #[serde(skip)]
    pub stream: Option<String>,
}

impl EventFilter {
    /// Filter that passes every event.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_stream(stream_key: impl Into<String>) -> Self {
        Self {
            stream: Some(stream_key.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(ref want) = self.project_id {
            if event.project_id.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(ref want) = self.session_id {
            if event.session_id.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(ref want) = self.event_type {
            if event.event_type != *want {
                return false;
            }
        }
        if let Some(ref want) = self.stream {
            if event.stream_key() != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}
