//! Pending-approval broker.
//!
//! Gated operations park here until a human (over the wire, usually from a
//! second client) resolves them or the timeout sweeps them away. The table
//! lock is only ever held for map surgery, never across approval I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Result;
use crate::error::ToolError;
use outpost_protocol::ApprovalKind;
use outpost_protocol::ErrorCode;
use outpost_protocol::EVENT_APPROVAL_REQUEST;
use outpost_protocol::EVENT_APPROVAL_RESOLVED;
use outpost_protocol::OutboundEvent;
use outpost_protocol::PendingApprovalInfo;

/// Buffered approval/tick events per subscriber; slow sessions drop the
/// oldest, which is acceptable for advisory notifications.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct PendingEntry {
    info: PendingApprovalInfo,
    decide: oneshot::Sender<bool>,
}

/// Daemon-wide approval table plus the broadcast channel that fans
/// `approval.request` / `approval.resolved` events out to sessions.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    events: broadcast::Sender<OutboundEvent>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to approval lifecycle events. Each session forwards these
    /// onto its own stream with its own sequence numbers.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events.subscribe()
    }

    pub fn pending(&self) -> Vec<PendingApprovalInfo> {
        self.pending
            .lock()
            .map(|table| table.values().map(|entry| entry.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Park a gated operation until a decision or the timeout. On timeout the
    /// record is removed atomically and the operation fails with
    /// `APPROVAL_TIMEOUT`; denial fails with `APPROVAL_DENIED`.
    pub async fn request(
        &self,
        kind: ApprovalKind,
        description: String,
        details: Value,
        timeout: Duration,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let info = PendingApprovalInfo {
            id: id.clone(),
            kind,
            description,
            details,
            created_at: now,
            timeout_at: now + timeout.as_millis() as i64,
        };

        let (decide_tx, decide_rx) = oneshot::channel();
        {
            let mut table = self
                .pending
                .lock()
                .map_err(|_| ToolError::new(ErrorCode::InternalError, "approval table poisoned"))?;
            table.insert(
                id.clone(),
                PendingEntry {
                    info: info.clone(),
                    decide: decide_tx,
                },
            );
        }

        // Fail closed: with nobody subscribed, no approver can ever see the
        // request, so parking until the timeout would only stall the caller.
        let request_event = OutboundEvent::new(EVENT_APPROVAL_REQUEST, json!(&info));
        if self.events.send(request_event).is_err() {
            self.remove(&id);
            return Err(ToolError::with_details(
                ErrorCode::ApprovalRequired,
                "operation requires approval but no approval channel is connected",
                json!({ "kind": kind, "description": info.description }),
            ));
        }

        match tokio::time::timeout(timeout, decide_rx).await {
            Ok(Ok(true)) => Ok(id),
            Ok(Ok(false)) => Err(ToolError::with_details(
                ErrorCode::ApprovalDenied,
                "operation denied by approver",
                json!({ "approvalId": id }),
            )),
            // The sender was dropped without a decision (broker shutdown).
            Ok(Err(_)) => Err(ToolError::new(
                ErrorCode::ApprovalDenied,
                "approval channel closed before a decision",
            )),
            Err(_elapsed) => {
                self.remove(&id);
                Err(ToolError::with_details(
                    ErrorCode::ApprovalTimeout,
                    "no approval decision before the timeout",
                    json!({ "approvalId": id }),
                ))
            }
        }
    }

    /// Resolve a pending approval. The record is removed atomically; an
    /// unknown id means it was never created, already decided, or swept.
    pub fn resolve(&self, id: &str, approve: bool) -> Result<PendingApprovalInfo> {
        let entry = {
            let mut table = self
                .pending
                .lock()
                .map_err(|_| ToolError::new(ErrorCode::InternalError, "approval table poisoned"))?;
            table.remove(id)
        };
        let Some(entry) = entry else {
            return Err(ToolError::with_details(
                ErrorCode::InvalidRequest,
                "no pending approval with that id",
                json!({ "id": id }),
            ));
        };
        // The requester may have timed out in the meantime; nothing to do.
        let _ = entry.decide.send(approve);
        let _ = self.events.send(OutboundEvent::new(
            EVENT_APPROVAL_RESOLVED,
            json!({ "id": id, "approve": approve }),
        ));
        Ok(entry.info)
    }

    fn remove(&self, id: &str) {
        if let Ok(mut table) = self.pending.lock() {
            table.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn approval_resolves_the_waiting_request() {
        let broker = Arc::new(ApprovalBroker::new());
        let _channel = broker.subscribe();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(
                        ApprovalKind::Exec,
                        "cargo test".to_string(),
                        json!({}),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        // Wait for the record to appear, then approve it.
        let id = loop {
            if let Some(info) = broker.pending().into_iter().next() {
                break info.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        broker.resolve(&id, true).unwrap();
        assert!(waiter.await.unwrap().is_ok());
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn denial_fails_with_approval_denied() {
        let broker = Arc::new(ApprovalBroker::new());
        let _channel = broker.subscribe();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .request(
                        ApprovalKind::Patch,
                        "apply patch".to_string(),
                        json!({}),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        let id = loop {
            if let Some(info) = broker.pending().into_iter().next() {
                break info.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        broker.resolve(&id, false).unwrap();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::ApprovalDenied);
    }

    #[tokio::test]
    async fn timeout_sweeps_the_record() {
        let broker = ApprovalBroker::new();
        let _channel = broker.subscribe();
        let err = broker
            .request(
                ApprovalKind::Write,
                "vcs.commit".to_string(),
                json!({}),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ApprovalTimeout);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn no_approval_channel_fails_closed_immediately() {
        let broker = ApprovalBroker::new();
        let err = broker
            .request(
                ApprovalKind::Exec,
                "cargo test".to_string(),
                json!({}),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ApprovalRequired);
        assert!(broker.pending().is_empty());
    }

    #[tokio::test]
    async fn resolving_an_unknown_id_is_an_error() {
        let broker = ApprovalBroker::new();
        let err = broker.resolve("nope", true).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn request_emits_an_event_to_subscribers() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut events = broker.subscribe();
        let broker2 = broker.clone();
        tokio::spawn(async move {
            let _ = broker2
                .request(
                    ApprovalKind::Exec,
                    "make".to_string(),
                    json!({}),
                    Duration::from_millis(200),
                )
                .await;
        });
        let event = events.recv().await.unwrap();
        assert_eq!(event.event, EVENT_APPROVAL_REQUEST);
        assert_eq!(event.payload["description"], json!("make"));
    }
}
