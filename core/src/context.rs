//! Per-session mutable state: the run id, audit buffer, counters, event
//! sink and the approval gate. A `RunContext` is bound to exactly one
//! workspace for its lifetime and owned exclusively by its session.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalBroker;
use crate::audit::AuditKind;
use crate::audit::AuditRecorder;
use crate::config::Config;
use crate::error::Result;
use crate::workspace::Workspace;
use outpost_protocol::ApprovalKind;
use outpost_protocol::OutboundEvent;

/// Where a context delivers its events. The session layer enqueues them on
/// the connection's single outgoing queue, which is what keeps `tool.result`
/// ahead of the response frame for the same call; tests and the local CLI
/// substitute their own sinks.
pub type EventSink = Box<dyn Fn(OutboundEvent) + Send + Sync>;

pub struct RunContext {
    pub run_id: String,
    pub workspace: Arc<Workspace>,
    pub config: Arc<Config>,
    pub audit: AuditRecorder,
    pub approvals: Arc<ApprovalBroker>,
    /// Sequence numbers are stamped by the session layer at send time.
    events: EventSink,
    pub cancel: CancellationToken,
    turns: AtomicU64,
    tool_calls: AtomicU64,
}

impl RunContext {
    /// `cancel` observes the owning session's lifetime: the session layer
    /// passes a child of its connection token so disconnect cancels all
    /// in-flight work.
    pub fn new(
        workspace: Arc<Workspace>,
        config: Arc<Config>,
        approvals: Arc<ApprovalBroker>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let audit =
            AuditRecorder::new(run_id.clone()).with_log_dir(config.logging.log_dir.clone());
        Self {
            workspace,
            config,
            audit,
            approvals,
            events,
            cancel,
            turns: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            run_id,
        }
    }

    pub fn send_event(&self, event: OutboundEvent) {
        (self.events)(event);
    }

    pub fn record_turn(&self) -> u64 {
        self.turns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_tool_call(&self) -> u64 {
        self.tool_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn tool_call_count(&self) -> u64 {
        self.tool_calls.load(Ordering::Relaxed)
    }

    /// Fail-closed approval gate for a side-effecting operation.
    ///
    /// Returns immediately when the policy does not require approval for
    /// `kind`, or when the description matches an auto-approve pattern.
    /// Otherwise the call parks on the broker until a decision or the
    /// configured timeout.
    pub async fn gate(
        &self,
        kind: ApprovalKind,
        description: &str,
        details: Value,
    ) -> Result<()> {
        let policy = &self.config.approvals;
        let required = match kind {
            ApprovalKind::Exec => policy.require_exec_approval,
            ApprovalKind::Write | ApprovalKind::Patch => policy.require_write_approval,
        };
        if !required {
            return Ok(());
        }
        if policy.auto_approves(description) {
            self.audit.record(
                AuditKind::Approval,
                None,
                Some(&json!({ "kind": kind, "description": description })),
                Some(&json!({ "decision": "auto" })),
                None,
                None,
            );
            return Ok(());
        }

        let outcome = self
            .approvals
            .request(kind, description.to_string(), details, policy.timeout)
            .await;
        match &outcome {
            Ok(id) => self.audit.record(
                AuditKind::Approval,
                None,
                Some(&json!({ "kind": kind, "description": description, "id": id })),
                Some(&json!({ "decision": "approved" })),
                None,
                None,
            ),
            Err(err) => self.audit.record(
                AuditKind::Approval,
                None,
                Some(&json!({ "kind": kind, "description": description })),
                None,
                None,
                Some(err),
            ),
        }
        outcome.map(|_| ())
    }
}
