//! Gateway wire protocol types.
//!
//! The upstream link is one long-lived bidirectional message channel.
//! Every frame is a JSON object whose `type` field discriminates
//! between the auth handshake, request/response correlation, and
//! pushed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{BusEvent, EventBus, EventSource};

/// Frame sent from this process to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Challenge signature plus our public identity, sent once per
    /// connection lifetime.
    Auth {
        public_key: String,
        signature: String,
    },

    /// An outbound call. `id` is unique per connection generation; the
    /// idempotency token is stable across retries of the same logical
    /// operation and opaque to the transport.
    Request {
        id: u64,
        method: String,
        params: Value,
        idempotency_token: String,
    },
}

/// Frame received from the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Server-issued nonce to sign, first frame on every connection.
    Challenge { nonce: String },

    /// Outcome of the auth handshake.
    AuthResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Reply to a previously sent request.
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RemoteErrorBody>,
    },

    /// Pushed event, fanned out to subscribers.
    Event { event: WireEvent },
}

impl ServerFrame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Error payload the gateway attaches to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    pub code: String,
    pub message: String,
}

/// Event as it appears on the wire.
///
/// `id` is present only for events the gateway has already persisted;
/// unpersisted events get a synthetic id on this side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl WireEvent {
    /// Convert into a bus event, drawing a synthetic id when the
    /// gateway did not supply a persisted one.
    pub fn into_bus_event(self, bus: &EventBus) -> BusEvent {
        let id = self.id.unwrap_or_else(|| bus.next_synthetic_id());
        BusEvent {
            id,
            project_id: self.project_id,
            session_id: self.session_id,
            agent_id: self.agent_id,
            source: EventSource::Gateway,
            event_type: self.event_type,
            payload: self.payload,
            created_at: chrono::Utc::now(),
        }
    }
}
