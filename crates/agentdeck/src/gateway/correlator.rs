//! Request/response correlation over the upstream link.
//!
//! Every outbound call gets a fresh request id and an idempotency
//! token, is tracked in a pending map, and suspends its caller until
//! the matching response arrives, the deadline passes, or the
//! connection drops. At most one in-flight entry exists per request id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::protocol::{ClientFrame, RemoteErrorBody};

struct PendingEntry {
    method: String,
    tx: oneshot::Sender<GatewayResult<Value>>,
}

/// Correlates outbound requests with inbound responses.
///
/// The pending map is written only by the caller side (`call`) and the
/// connection manager (`resolve_response` / `fail_all` / `expire_stale`);
/// both go through the same mutex.
pub struct RequestCorrelator {
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_request_id: AtomicU64,
    outbound: mpsc::Sender<ClientFrame>,
    request_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(outbound: mpsc::Sender<ClientFrame>, request_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            outbound,
            request_timeout,
        }
    }

    /// Issue a call with a generated idempotency token.
    pub async fn call(&self, method: &str, params: Value) -> GatewayResult<Value> {
        self.call_with_token(method, params, None).await
    }

    /// Issue a call, honoring a caller-supplied idempotency token so a
    /// retry after `Timeout` does not double-execute gateway-side. The
    /// token is surfaced to the transport unchanged.
    pub async fn call_with_token(
        &self,
        method: &str,
        params: Value,
        idempotency_token: Option<String>,
    ) -> GatewayResult<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let token = idempotency_token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                id,
                PendingEntry {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        let frame = ClientFrame::Request {
            id,
            method: method.to_string(),
            params,
            idempotency_token: token,
        };
        if self.outbound.send(frame).await.is_err() {
            self.remove(id);
            return Err(GatewayError::ConnectionLost(
                "outbound channel closed".to_string(),
            ));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Sender dropped without resolving: the connection
                // manager failed us out.
                Err(GatewayError::ConnectionLost(
                    "connection dropped before response".to_string(),
                ))
            }
            Err(_) => {
                self.remove(id);
                Err(GatewayError::Timeout(self.request_timeout))
            }
        }
    }

    /// Fire-and-forget variant: the call is still tracked and timed
    /// out like any other, but the outcome is only logged.
    pub fn call_detached(self: std::sync::Arc<Self>, method: &str, params: Value) {
        let correlator = self;
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(err) = correlator.call(&method, params).await {
                warn!("detached call {} failed: {}", method, err);
            }
        });
    }

    /// Hand an inbound response to its waiting caller. A response
    /// referencing an unknown id is logged and dropped, never fatal.
    pub fn resolve_response(&self, id: u64, result: Option<Value>, error: Option<RemoteErrorBody>) {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(&id)
        };
        let Some(entry) = entry else {
            warn!("{}", GatewayError::UnknownCorrelation(id));
            return;
        };

        let outcome = match error {
            Some(body) => Err(GatewayError::Remote {
                code: body.code,
                message: body.message,
            }),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        if entry.tx.send(outcome).is_err() {
            debug!(
                "caller of {} (request {}) went away before the response",
                entry.method, id
            );
        }
    }

    /// Reject every outstanding request. Called by the connection
    /// manager on entering `disconnected`/`reconnecting`.
    pub fn fail_all(&self, reason: &str) {
        let entries: Vec<(u64, PendingEntry)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if entries.is_empty() {
            return;
        }
        warn!("rejecting {} outstanding request(s): {}", entries.len(), reason);
        for (_, entry) in entries {
            let _ = entry
                .tx
                .send(Err(GatewayError::ConnectionLost(reason.to_string())));
        }
    }

    /// Garbage-collect entries whose callers vanished without waiting
    /// (detached calls whose futures were dropped). Callers that are
    /// still suspended keep their entries: each one enforces its own
    /// deadline and removes itself on timeout.
    pub fn expire_stale(&self) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|id, entry| {
            let live = !entry.tx.is_closed();
            if !live {
                debug!("expiring stale request {} ({})", id, entry.method);
            }
            live
        });
    }

    /// Number of tracked in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn remove(&self, id: u64) {
        let mut pending = self.pending.lock().unwrap();
        pending.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn correlator(timeout: Duration) -> (Arc<RequestCorrelator>, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(RequestCorrelator::new(tx, timeout)), rx)
    }

    fn frame_parts(frame: ClientFrame) -> (u64, String, String) {
        match frame {
            ClientFrame::Request {
                id,
                method,
                idempotency_token,
                ..
            } => (id, method, idempotency_token),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.call("session.chat", json!({"m": 1})).await })
        };

        let (id, method, _) = frame_parts(rx.recv().await.unwrap());
        assert_eq!(method, "session.chat");
        correlator.resolve_response(id, Some(json!({"ok": true})), None);

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_surfaced_verbatim() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.call("terminal.kill", json!({})).await })
        };

        let (id, _, _) = frame_parts(rx.recv().await.unwrap());
        correlator.resolve_response(
            id,
            None,
            Some(RemoteErrorBody {
                code: "NOT_FOUND".to_string(),
                message: "no such terminal".to_string(),
            }),
        );

        match call.await.unwrap() {
            Err(GatewayError::Remote { code, message }) => {
                assert_eq!(code, "NOT_FOUND");
                assert_eq!(message, "no such terminal");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_correlation_is_dropped() {
        let (correlator, _rx) = correlator(Duration::from_secs(5));
        // Must not panic or create an entry.
        correlator.resolve_response(999, Some(json!({})), None);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_dangling_entry() {
        let (correlator, _rx) = correlator(Duration::from_millis(20));

        let outcome = correlator.call("session.chat", json!({})).await;
        assert!(matches!(outcome, Err(GatewayError::Timeout(_))));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_with_connection_lost() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.call("session.chat", json!({})).await })
        };
        let (id, _, _) = frame_parts(rx.recv().await.unwrap());

        correlator.fail_all("transport dropped");
        assert!(matches!(
            call.await.unwrap(),
            Err(GatewayError::ConnectionLost(_))
        ));
        assert_eq!(correlator.pending_count(), 0);

        // A response racing in after the failure is dropped quietly.
        correlator.resolve_response(id, Some(json!({})), None);
    }

    #[tokio::test]
    async fn test_caller_token_passes_through_across_retries() {
        let (correlator, mut rx) = correlator(Duration::from_millis(100));

        let first = correlator
            .call_with_token("session.chat", json!({}), Some("tok-42".to_string()))
            .await;
        assert!(matches!(first, Err(GatewayError::Timeout(_))));

        let retry = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .call_with_token("session.chat", json!({}), Some("tok-42".to_string()))
                    .await
            })
        };

        let (first_id, _, first_token) = frame_parts(rx.recv().await.unwrap());
        let (retry_id, _, retry_token) = frame_parts(rx.recv().await.unwrap());

        // Fresh request id, same logical token, one pending entry.
        assert_ne!(first_id, retry_id);
        assert_eq!(first_token, "tok-42");
        assert_eq!(retry_token, "tok-42");
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve_response(retry_id, Some(json!({"ok": true})), None);
        assert!(retry.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_expire_stale_spares_suspended_callers() {
        let (correlator, mut rx) = correlator(Duration::from_secs(5));

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.call("session.chat", json!({})).await })
        };
        let (id, _, _) = frame_parts(rx.recv().await.unwrap());

        // GC while the caller is still waiting must not touch the
        // entry; only the caller's own timeout may reject it.
        correlator.expire_stale();
        assert_eq!(correlator.pending_count(), 1);

        correlator.resolve_response(id, Some(json!({"ok": true})), None);
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_expire_stale_collects_abandoned_entries() {
        let (correlator, mut _rx) = correlator(Duration::from_millis(10));

        let call = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.call("session.chat", json!({})).await })
        };
        // Abandon the caller mid-flight.
        call.abort();
        let _ = call.await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        correlator.expire_stale();
        assert_eq!(correlator.pending_count(), 0);
    }
}
