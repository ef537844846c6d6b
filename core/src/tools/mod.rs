//! Tool registry and dispatcher.
//!
//! The catalogue is a closed set: dispatch is a match over the tool name
//! with a typed parameter struct per variant, not an open plugin surface.

pub mod cmd;
pub mod fs;
pub mod vcs;

use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditKind;
use crate::context::RunContext;
use crate::error::Result;
use crate::error::ToolError;
use outpost_protocol::EVENT_TOOL;
use outpost_protocol::ErrorCode;
use outpost_protocol::OutboundEvent;
use outpost_protocol::Tier;
use outpost_protocol::ToolEventPayload;
use outpost_protocol::ToolInfo;
use outpost_protocol::ToolPhase;

#[derive(Debug, Clone, Copy)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub tier: Tier,
    pub requires_approval: bool,
    pub description: &'static str,
}

impl ToolDescriptor {
    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.to_string(),
            tier: self.tier,
            requires_approval: self.requires_approval,
            description: self.description.to_string(),
            input_schema: input_schema(self.name),
        }
    }
}

pub const REGISTRY: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "fs.list",
        tier: Tier::Read,
        requires_approval: false,
        description: "List entries in a workspace directory, optionally recursive.",
    },
    ToolDescriptor {
        name: "fs.read",
        tier: Tier::Read,
        requires_approval: false,
        description: "Read a bounded slice of a file; base64 for binary content.",
    },
    ToolDescriptor {
        name: "fs.apply_patch",
        tier: Tier::Write,
        requires_approval: true,
        description: "Apply a unified diff inside the workspace.",
    },
    ToolDescriptor {
        name: "vcs.status",
        tier: Tier::Read,
        requires_approval: false,
        description: "Branch, ahead/behind counts and file statuses.",
    },
    ToolDescriptor {
        name: "vcs.diff",
        tier: Tier::Read,
        requires_approval: false,
        description: "Working or staged diff, optionally path-limited.",
    },
    ToolDescriptor {
        name: "vcs.checkout",
        tier: Tier::Write,
        requires_approval: true,
        description: "Switch branches, optionally creating one.",
    },
    ToolDescriptor {
        name: "vcs.commit",
        tier: Tier::Write,
        requires_approval: true,
        description: "Stage chosen files or all changes, then commit.",
    },
    ToolDescriptor {
        name: "cmd.run",
        tier: Tier::Exec,
        requires_approval: true,
        description: "Run an allowlisted command with bounded time and output.",
    },
];

pub fn find(name: &str) -> Option<&'static ToolDescriptor> {
    REGISTRY.iter().find(|descriptor| descriptor.name == name)
}

/// The registry subset a session at `tier` may call.
pub fn visible_at(tier: Tier) -> Vec<ToolInfo> {
    REGISTRY
        .iter()
        .filter(|descriptor| descriptor.tier <= tier)
        .map(ToolDescriptor::info)
        .collect()
}

fn input_schema(name: &str) -> Value {
    match name {
        "fs.list" => json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "default": "." },
                "recursive": { "type": "boolean", "default": false },
                "maxDepth": { "type": "integer", "default": 10 },
            },
            "additionalProperties": false,
        }),
        "fs.read" => json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": { "type": "string" },
                "offset": { "type": "integer", "default": 0 },
                "maxBytes": { "type": "integer", "default": 200_000 },
            },
            "additionalProperties": false,
        }),
        "fs.apply_patch" => json!({
            "type": "object",
            "required": ["patchUnified"],
            "properties": {
                "patchUnified": { "type": "string" },
                "dryRun": { "type": "boolean", "default": false },
            },
            "additionalProperties": false,
        }),
        "vcs.status" => json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false,
        }),
        "vcs.diff" => json!({
            "type": "object",
            "properties": {
                "staged": { "type": "boolean", "default": false },
                "paths": { "type": "array", "items": { "type": "string" } },
            },
            "additionalProperties": false,
        }),
        "vcs.checkout" => json!({
            "type": "object",
            "required": ["branch"],
            "properties": {
                "branch": { "type": "string" },
                "create": { "type": "boolean", "default": false },
            },
            "additionalProperties": false,
        }),
        "vcs.commit" => json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": { "type": "string" },
                "files": { "type": "array", "items": { "type": "string" } },
            },
            "additionalProperties": false,
        }),
        "cmd.run" => json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": { "type": "string" },
                "args": { "type": "array", "items": { "type": "string" } },
                "cwd": { "type": "string" },
                "timeoutS": { "type": "integer" },
                "env": { "type": "object", "additionalProperties": { "type": "string" } },
            },
            "additionalProperties": false,
        }),
        _ => json!({ "type": "object" }),
    }
}

/// Route a typed request to its implementation, enforcing the tier lattice
/// and emitting the `tool` event pair around the call.
pub async fn dispatch(ctx: &RunContext, name: &str, args: Value) -> Result<Value> {
    let Some(descriptor) = find(name) else {
        let err = ToolError::with_details(
            ErrorCode::InternalError,
            format!("unknown tool {name:?}"),
            json!({ "tool": name }),
        );
        ctx.audit
            .record(AuditKind::Error, Some(name), None, None, None, Some(&err));
        return Err(err);
    };

    if descriptor.tier > ctx.workspace.tier {
        let err = ToolError::with_details(
            ErrorCode::ForbiddenPath,
            format!(
                "tool {} requires tier {} but workspace `{}` is {}",
                descriptor.name, descriptor.tier, ctx.workspace.name, ctx.workspace.tier
            ),
            json!({ "tool": name, "requiredTier": descriptor.tier, "tier": ctx.workspace.tier }),
        );
        ctx.audit
            .record(AuditKind::Error, Some(name), None, None, None, Some(&err));
        return Err(err);
    }

    ctx.record_tool_call();
    let tool_call_id = Uuid::new_v4().to_string();
    // Enqueued ahead of the implementation so the start event hits the wire
    // before any externally visible side effect.
    ctx.send_event(tool_event(ToolEventPayload {
        phase: ToolPhase::Start,
        tool_call_id: tool_call_id.clone(),
        tool: name.to_string(),
        ok: None,
        error: None,
        duration_ms: None,
    }));

    let start = Instant::now();
    let result = invoke(ctx, name, args.clone()).await;
    let duration = start.elapsed();

    match &result {
        Ok(output) => ctx.audit.record(
            AuditKind::ToolCall,
            Some(name),
            Some(&args),
            Some(output),
            Some(duration),
            None,
        ),
        Err(err) => ctx.audit.record(
            AuditKind::ToolCall,
            Some(name),
            Some(&args),
            None,
            Some(duration),
            Some(err),
        ),
    }

    ctx.send_event(tool_event(ToolEventPayload {
        phase: ToolPhase::Result,
        tool_call_id,
        tool: name.to_string(),
        ok: Some(result.is_ok()),
        error: result.as_ref().err().map(ToolError::to_wire),
        duration_ms: Some(duration.as_millis() as u64),
    }));

    result
}

fn tool_event(payload: ToolEventPayload) -> OutboundEvent {
    OutboundEvent::new(EVENT_TOOL, json!(payload))
}

async fn invoke(ctx: &RunContext, name: &str, args: Value) -> Result<Value> {
    match name {
        "fs.list" => fs::list(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "fs.read" => fs::read(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "fs.apply_patch" => fs::apply_patch(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "vcs.status" => vcs::status(ctx).await,
        "vcs.diff" => vcs::diff(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "vcs.checkout" => vcs::checkout(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "vcs.commit" => vcs::commit(ctx, decode_args(args, ErrorCode::InvalidPath)?).await,
        "cmd.run" => cmd::run(ctx, decode_args(args, ErrorCode::InternalError)?).await,
        _ => Err(ToolError::new(
            ErrorCode::InternalError,
            format!("unknown tool {name:?}"),
        )),
    }
}

/// Decode untyped JSON into a tool's parameter struct. Missing fields and
/// type mismatches surface as the given code rather than a runtime cast.
fn decode_args<T: DeserializeOwned>(args: Value, code: ErrorCode) -> Result<T> {
    // Tools with all-optional parameters accept a missing params object.
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args)
        .map_err(|err| ToolError::new(code, format!("invalid arguments: {err}")))
}

#[cfg(test)]
pub(crate) mod testing {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::approval::ApprovalBroker;
    use crate::config::Config;
    use crate::context::RunContext;
    use outpost_protocol::OutboundEvent;

    fn build_context(
        tier: &str,
        allow_vcs: bool,
    ) -> (
        RunContext,
        mpsc::UnboundedReceiver<OutboundEvent>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
version: 1
workspaces:
  - name: test
    path: {p}
    tier: {tier}
    allowVcs: {allow_vcs}
approvals:
  requireWriteApproval: false
  requireExecApproval: false
"#,
            p = dir.path().display()
        );
        let config = Arc::new(Config::from_file(serde_yaml::from_str(&yaml).unwrap()).unwrap());
        let workspace = config.workspace(None).unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = Box::new(move |event| {
            let _ = events_tx.send(event);
        });
        let ctx = RunContext::new(
            workspace,
            config,
            Arc::new(ApprovalBroker::new()),
            sink,
            tokio_util::sync::CancellationToken::new(),
        );
        (ctx, events_rx, dir)
    }

    /// Exec-tier context with approvals disabled; the receiver is dropped.
    pub(crate) fn exec_context() -> (RunContext, tempfile::TempDir) {
        let (ctx, _rx, dir) = build_context("exec", true);
        (ctx, dir)
    }

    /// Read-only context for tier-lattice tests.
    pub(crate) fn read_context() -> (RunContext, tempfile::TempDir) {
        let (ctx, _rx, dir) = build_context("read", true);
        (ctx, dir)
    }

    /// Context whose workspace has VCS access switched off.
    pub(crate) fn no_vcs_context() -> (RunContext, tempfile::TempDir) {
        let (ctx, _rx, dir) = build_context("exec", false);
        (ctx, dir)
    }

    /// Exec-tier context that keeps the event receiver.
    pub(crate) fn exec_context_with_events() -> (
        RunContext,
        mpsc::UnboundedReceiver<OutboundEvent>,
        tempfile::TempDir,
    ) {
        build_context("exec", true)
    }
}
