//! Per-connection request processing: authentication, method dispatch and
//! the response/event plumbing for one session.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use outpost_core::context::EventSink;
use outpost_core::context::RunContext;
use outpost_core::tools;
use outpost_protocol::ApprovalsResolveParams;
use outpost_protocol::AUTH_FAILED_CLOSE_CODE;
use outpost_protocol::ConnectParams;
use outpost_protocol::ErrorCode;
use outpost_protocol::FeaturesInfo;
use outpost_protocol::EVENT_APPROVAL_REQUEST;
use outpost_protocol::EVENT_APPROVAL_RESOLVED;
use outpost_protocol::EVENT_TICK;
use outpost_protocol::EVENT_TOOL;
use outpost_protocol::Frame;
use outpost_protocol::HelloPayload;
use outpost_protocol::MAX_FRAME_BYTES;
use outpost_protocol::Method;
use outpost_protocol::PROTOCOL_VERSION;
use outpost_protocol::RequestFrame;
use outpost_protocol::RequestId;
use outpost_protocol::ResponseFrame;
use outpost_protocol::ServerInfo;
use outpost_protocol::ToolsCallParams;
use outpost_protocol::WireError;
use outpost_protocol::WorkspaceInfo;

use crate::Daemon;
use crate::outgoing_message::OutgoingMessage;

/// Whether the reader loop should keep going after a frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

pub(crate) struct MessageProcessor {
    daemon: Arc<Daemon>,
    outgoing: mpsc::UnboundedSender<OutgoingMessage>,
    cancel: CancellationToken,
    authenticated: bool,
    client_name: Option<String>,
    last_activity: chrono::DateTime<chrono::Utc>,
    ctx: Option<Arc<RunContext>>,
}

impl MessageProcessor {
    pub(crate) fn new(
        daemon: Arc<Daemon>,
        outgoing: mpsc::UnboundedSender<OutgoingMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            daemon,
            outgoing,
            cancel,
            authenticated: false,
            client_name: None,
            last_activity: chrono::Utc::now(),
            ctx: None,
        }
    }

    /// Handle one inbound text frame.
    pub(crate) async fn handle_text(&mut self, text: &str) -> Flow {
        self.last_activity = chrono::Utc::now();
        if text.len() > MAX_FRAME_BYTES {
            self.respond_failure(
                None,
                ErrorCode::PayloadTooLarge,
                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
                None,
            );
            return Flow::Continue;
        }

        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                self.respond_failure(
                    None,
                    ErrorCode::ParseError,
                    format!("frame is not valid JSON: {err}"),
                    None,
                );
                return Flow::Continue;
            }
        };
        let Frame::Req(request) = frame else {
            self.respond_failure(
                None,
                ErrorCode::InvalidRequest,
                "only `req` frames are accepted from clients",
                None,
            );
            return Flow::Continue;
        };

        let Ok(method) = Method::from_str(&request.method) else {
            self.respond_failure(
                Some(request.id),
                ErrorCode::MethodNotFound,
                format!("unknown method {:?}", request.method),
                Some(json!({ "method": request.method })),
            );
            return Flow::Continue;
        };

        if method != Method::Connect && !self.authenticated {
            self.respond_failure(
                Some(request.id),
                ErrorCode::Unauthorized,
                "authenticate with `connect` first",
                None,
            );
            return Flow::Continue;
        }

        match method {
            Method::Connect => self.handle_connect(request),
            Method::ToolsList => {
                self.handle_tools_list(request);
                Flow::Continue
            }
            Method::ToolsCall => {
                self.handle_tools_call(request);
                Flow::Continue
            }
            Method::Ping => {
                self.respond_success(request.id, json!({ "pong": true }));
                Flow::Continue
            }
            Method::ApprovalsList => {
                self.respond_success(
                    request.id,
                    json!({ "pending": self.daemon.approvals.pending() }),
                );
                Flow::Continue
            }
            Method::ApprovalsResolve => {
                self.handle_approvals_resolve(request);
                Flow::Continue
            }
        }
    }

    /// Binary frames are not part of the protocol.
    pub(crate) fn reject_binary(&self) {
        self.respond_failure(
            None,
            ErrorCode::InvalidRequest,
            "frames must be UTF-8 JSON text",
            None,
        );
    }

    /// Flush the run's audit buffer; called once when the session ends.
    pub(crate) fn shutdown(&self) {
        if let Some(ctx) = &self.ctx {
            ctx.audit.note(format!(
                "session closed after {} tool call(s), last activity {}",
                ctx.tool_call_count(),
                self.last_activity.to_rfc3339(),
            ));
            if let Err(err) = ctx.audit.flush(&self.daemon.home) {
                tracing::warn!("failed to flush audit log for run {}: {err}", ctx.run_id);
            }
        }
    }

    fn handle_connect(&mut self, request: RequestFrame) -> Flow {
        if self.authenticated {
            self.respond_failure(
                Some(request.id),
                ErrorCode::InvalidRequest,
                "session is already authenticated",
                None,
            );
            return Flow::Continue;
        }

        let params: ConnectParams =
            match serde_json::from_value(request.params.unwrap_or_else(|| json!({}))) {
                Ok(params) => params,
                Err(err) => {
                    self.respond_failure(
                        Some(request.id),
                        ErrorCode::InvalidRequest,
                        format!("invalid connect params: {err}"),
                        None,
                    );
                    return Flow::Continue;
                }
            };

        if !token_matches(&self.daemon.token, &params.token) {
            self.respond_failure(
                Some(request.id),
                ErrorCode::AuthFailed,
                "authentication failed",
                None,
            );
            let _ = self.outgoing.send(OutgoingMessage::Close {
                code: AUTH_FAILED_CLOSE_CODE,
                reason: "authentication failed",
            });
            return Flow::Close;
        }

        self.authenticated = true;
        self.client_name = params.client.as_ref().map(|c| c.name.clone());

        let ctx = self.create_run_context();
        ctx.audit.note(format!(
            "session opened by {} against workspace `{}`",
            self.client_name.as_deref().unwrap_or("unnamed client"),
            self.daemon.workspace.name,
        ));
        self.ctx = Some(ctx);
        self.spawn_broadcast_forwarder();

        let hello = HelloPayload {
            protocol: PROTOCOL_VERSION,
            server: ServerInfo {
                name: "outpost".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            workspace: WorkspaceInfo {
                name: self.daemon.workspace.name.clone(),
                root: self.daemon.workspace.root.display().to_string(),
                tier: self.daemon.workspace.tier,
            },
            tools: tools::visible_at(self.daemon.workspace.tier),
            features: FeaturesInfo {
                methods: Method::ALL.iter().map(|m| m.as_str().to_string()).collect(),
                events: vec![
                    EVENT_TOOL.to_string(),
                    EVENT_TICK.to_string(),
                    EVENT_APPROVAL_REQUEST.to_string(),
                    EVENT_APPROVAL_RESOLVED.to_string(),
                ],
            },
        };
        self.respond_success(request.id, json!(hello));
        Flow::Continue
    }

    fn create_run_context(&self) -> Arc<RunContext> {
        let outgoing = self.outgoing.clone();
        let sink: EventSink = Box::new(move |event| {
            let _ = outgoing.send(OutgoingMessage::Event(event));
        });
        Arc::new(RunContext::new(
            self.daemon.workspace.clone(),
            self.daemon.config.clone(),
            self.daemon.approvals.clone(),
            sink,
            self.cancel.child_token(),
        ))
    }

    /// Forward daemon-wide broadcast events (ticks, approval lifecycle) onto
    /// this session's queue for as long as it lives.
    fn spawn_broadcast_forwarder(&self) {
        let mut events = self.daemon.events.subscribe();
        let outgoing = self.outgoing.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if outgoing.send(OutgoingMessage::Event(event)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!("session dropped {missed} broadcast event(s)");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn handle_tools_list(&self, request: RequestFrame) {
        self.respond_success(
            request.id,
            json!({ "tools": tools::visible_at(self.daemon.workspace.tier) }),
        );
    }

    fn handle_tools_call(&self, request: RequestFrame) {
        let Some(ctx) = self.ctx.clone() else {
            self.respond_failure(
                Some(request.id),
                ErrorCode::Unauthorized,
                "authenticate with `connect` first",
                None,
            );
            return;
        };
        let params: ToolsCallParams =
            match serde_json::from_value(request.params.unwrap_or_else(|| json!({}))) {
                Ok(params) => params,
                Err(err) => {
                    self.respond_failure(
                        Some(request.id),
                        ErrorCode::InvalidRequest,
                        format!("invalid tools.call params: {err}"),
                        None,
                    );
                    return;
                }
            };

        ctx.record_turn();
        let outgoing = self.outgoing.clone();
        let id = request.id;
        // Run the tool off the reader loop so a session can keep multiple
        // requests in flight; the shared outgoing queue still serialises
        // events ahead of this call's response.
        tokio::spawn(async move {
            let result = tools::dispatch(&ctx, &params.tool, params.args).await;
            let frame = match result {
                Ok(payload) => ResponseFrame::success(id, payload),
                Err(err) => ResponseFrame::failure(Some(id), err.to_wire()),
            };
            let _ = outgoing.send(OutgoingMessage::Response(frame));
        });
    }

    fn handle_approvals_resolve(&self, request: RequestFrame) {
        let params: ApprovalsResolveParams =
            match serde_json::from_value(request.params.unwrap_or_else(|| json!({}))) {
                Ok(params) => params,
                Err(err) => {
                    self.respond_failure(
                        Some(request.id),
                        ErrorCode::InvalidRequest,
                        format!("invalid approvals.resolve params: {err}"),
                        None,
                    );
                    return;
                }
            };
        match self.daemon.approvals.resolve(&params.id, params.approve) {
            Ok(info) => self.respond_success(
                request.id,
                json!({ "resolved": info.id, "approved": params.approve }),
            ),
            Err(err) => {
                let wire = err.to_wire();
                self.respond(ResponseFrame::failure(Some(request.id), wire));
            }
        }
    }

    fn respond(&self, frame: ResponseFrame) {
        let _ = self.outgoing.send(OutgoingMessage::Response(frame));
    }

    fn respond_success(&self, id: RequestId, payload: Value) {
        self.respond(ResponseFrame::success(id, payload));
    }

    fn respond_failure(
        &self,
        id: Option<RequestId>,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
    ) {
        self.respond(ResponseFrame::failure(
            id,
            WireError {
                code,
                message: message.into(),
                details,
            },
        ));
    }
}

/// Constant-time bearer-token comparison. Unequal lengths short-circuit as a
/// mismatch without any byte comparison; equal lengths always scan every
/// byte.
fn token_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    bool::from(expected.ct_eq(provided))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_support::test_daemon;
    use pretty_assertions::assert_eq;

    fn processor_pair(
        daemon: Arc<Daemon>,
    ) -> (
        MessageProcessor,
        mpsc::UnboundedReceiver<OutgoingMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MessageProcessor::new(daemon, tx, CancellationToken::new()),
            rx,
        )
    }

    fn response(rx: &mut mpsc::UnboundedReceiver<OutgoingMessage>) -> ResponseFrame {
        loop {
            match rx.try_recv().expect("expected an outgoing message") {
                OutgoingMessage::Response(res) => return res,
                OutgoingMessage::Event(_) => continue,
                OutgoingMessage::Close { .. } => panic!("unexpected close"),
            }
        }
    }

    fn req(id: i64, method: &str, params: Value) -> String {
        json!({ "type": "req", "id": id, "method": method, "params": params }).to_string()
    }

    #[test]
    fn token_compare_requires_equal_length_first() {
        assert!(token_matches("abcd", "abcd"));
        assert!(!token_matches("abcd", "abce"));
        assert!(!token_matches("abcd", "abc"));
        assert!(!token_matches("abcd", ""));
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected() {
        let (daemon, _home) = test_daemon();
        let (mut processor, mut rx) = processor_pair(daemon);
        let flow = processor.handle_text(&req(1, "ping", json!({}))).await;
        assert_eq!(flow, Flow::Continue);
        let res = response(&mut rx);
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn bad_token_fails_and_closes() {
        let (daemon, _home) = test_daemon();
        let (mut processor, mut rx) = processor_pair(daemon);
        let flow = processor
            .handle_text(&req(1, "connect", json!({ "token": "wrong" })))
            .await;
        assert_eq!(flow, Flow::Close);
        let res = response(&mut rx);
        assert_eq!(res.error.unwrap().code, ErrorCode::AuthFailed);
        match rx.try_recv().unwrap() {
            OutgoingMessage::Close { code, .. } => assert_eq!(code, AUTH_FAILED_CLOSE_CODE),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_returns_the_hello_payload() {
        let (daemon, _home) = test_daemon();
        let token = daemon.token.clone();
        let (mut processor, mut rx) = processor_pair(daemon);
        let flow = processor
            .handle_text(&req(
                1,
                "connect",
                json!({ "token": token, "client": { "name": "tests" } }),
            ))
            .await;
        assert_eq!(flow, Flow::Continue);
        let res = response(&mut rx);
        assert!(res.ok);
        let payload = res.payload.unwrap();
        assert_eq!(payload["protocol"], json!(PROTOCOL_VERSION));
        assert_eq!(payload["workspace"]["tier"], json!("exec"));
        assert!(payload["tools"].as_array().unwrap().len() >= 8);
    }

    #[tokio::test]
    async fn connect_twice_is_invalid() {
        let (daemon, _home) = test_daemon();
        let token = daemon.token.clone();
        let (mut processor, mut rx) = processor_pair(daemon);
        processor
            .handle_text(&req(1, "connect", json!({ "token": token })))
            .await;
        let _ = response(&mut rx);
        processor
            .handle_text(&req(2, "connect", json!({ "token": token })))
            .await;
        let res = response(&mut rx);
        assert_eq!(res.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn unparseable_frames_get_parse_error_with_null_id() {
        let (daemon, _home) = test_daemon();
        let (mut processor, mut rx) = processor_pair(daemon);
        processor.handle_text("{not json").await;
        let res = response(&mut rx);
        assert_eq!(res.id, None);
        assert_eq!(res.error.unwrap().code, ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn unknown_methods_are_method_not_found() {
        let (daemon, _home) = test_daemon();
        let token = daemon.token.clone();
        let (mut processor, mut rx) = processor_pair(daemon);
        processor
            .handle_text(&req(1, "connect", json!({ "token": token })))
            .await;
        let _ = response(&mut rx);
        processor.handle_text(&req(2, "tools.destroy", json!({}))).await;
        let res = response(&mut rx);
        assert_eq!(res.error.unwrap().code, ErrorCode::MethodNotFound);
    }
}
