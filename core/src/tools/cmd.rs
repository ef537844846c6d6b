//! `cmd.run`: tokenise, validate, approve, then hand off to the subprocess
//! supervisor.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use crate::audit::AuditKind;
use crate::command_policy;
use crate::command_policy::CommandVerdict;
use crate::context::RunContext;
use crate::error::Result;
use crate::error::ToolError;
use crate::exec;
use crate::exec::ExecParams;
use outpost_protocol::ApprovalKind;
use outpost_protocol::ErrorCode;

const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RunParams {
    /// Command string, tokenised by the shell-string parser.
    pub command: String,
    /// Extra argv entries appended after the parsed command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, workspace-relative; defaults to the root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Wall-clock limit in seconds. The caller may lower the default but
    /// not raise it.
    #[serde(default)]
    pub timeout_s: Option<u64>,
    /// Environment entries layered on top of the daemon environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub async fn run(ctx: &RunContext, params: RunParams) -> Result<Value> {
    let Some(mut argv) = command_policy::split_command_line(&params.command) else {
        return Err(ToolError::with_details(
            ErrorCode::CommandDenied,
            "unparseable command string",
            json!({ "command": params.command }),
        ));
    };
    argv.extend(params.args.iter().cloned());
    let Some((program, args)) = argv.split_first() else {
        return Err(ToolError::new(ErrorCode::CommandDenied, "empty command"));
    };

    if let CommandVerdict::Deny { reason, pattern } =
        command_policy::validate(program, args, &ctx.config.command_rules)
    {
        return Err(ToolError::with_details(
            ErrorCode::CommandDenied,
            reason,
            json!({ "command": params.command, "pattern": pattern }),
        ));
    }

    let cwd = match &params.cwd {
        Some(path) => ctx.workspace.resolve(path)?.absolute,
        None => ctx.workspace.root.clone(),
    };

    let timeout = Duration::from_secs(
        params
            .timeout_s
            .unwrap_or(MAX_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS),
    );

    let line = argv.join(" ");
    ctx.gate(
        ApprovalKind::Exec,
        &line,
        json!({ "command": line, "cwd": cwd.to_string_lossy() }),
    )
    .await?;

    let output = exec::run_command(
        ExecParams {
            command: argv.clone(),
            cwd,
            timeout,
            env: params.env.clone(),
        },
        ctx.cancel.clone(),
    )
    .await;

    match &output {
        Ok(result) => {
            let timeout_error;
            let audit_error = if result.timed_out {
                timeout_error = ToolError::new(ErrorCode::CommandTimeout, "command timed out");
                Some(&timeout_error)
            } else {
                None
            };
            ctx.audit.record(
                AuditKind::Command,
                Some("cmd.run"),
                Some(&json!({ "command": line })),
                Some(&json!({
                    "exitCode": result.exit_code,
                    "timedOut": result.timed_out,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                })),
                Some(result.duration),
                audit_error,
            );
        }
        Err(err) => {
            ctx.audit.record(
                AuditKind::Command,
                Some("cmd.run"),
                Some(&json!({ "command": line })),
                None,
                None,
                Some(err),
            );
        }
    }

    let result = output?;
    Ok(json!({
        "exitCode": result.exit_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "durationMs": result.duration.as_millis() as u64,
        "timedOut": result.timed_out,
    }))
}
