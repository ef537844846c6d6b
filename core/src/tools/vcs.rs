//! Version-control tools: thin wrappers over the local `git` binary.
//!
//! These invocations are internally fixed and bypass the command validator;
//! nothing the caller supplies is ever interpolated into an option position.
//! User arguments travel after `--` as positionals, and branch names are
//! checked for a leading dash.

use std::path::Path;
use std::process::Output;
use std::process::Stdio;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::process::Command;
use tokio::time::Duration as TokioDuration;
use tokio::time::timeout;

use crate::context::RunContext;
use crate::error::Result;
use crate::error::ToolError;
use crate::workspace::Workspace;
use outpost_protocol::ApprovalKind;
use outpost_protocol::ErrorCode;

/// Ceiling for a single git invocation so a huge repository cannot wedge a
/// session.
const GIT_COMMAND_TIMEOUT: TokioDuration = TokioDuration::from_secs(30);

/// Raw diff output cap.
const MAX_DIFF_BYTES: usize = 500 * 1024;

pub(crate) async fn run_git(root: &Path, args: &[&str]) -> Result<Output> {
    let result = timeout(
        GIT_COMMAND_TIMEOUT,
        Command::new("git")
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ToolError::new(
            ErrorCode::VcsError,
            format!("failed to run git: {err}"),
        )),
        Err(_elapsed) => Err(ToolError::new(ErrorCode::VcsError, "git command timed out")),
    }
}

fn ensure_vcs(workspace: &Workspace) -> Result<()> {
    if workspace.allow_vcs {
        Ok(())
    } else {
        Err(ToolError::new(
            ErrorCode::VcsError,
            format!("VCS access is disabled for workspace `{}`", workspace.name),
        ))
    }
}

fn vcs_failure(output: &Output) -> ToolError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = stderr
        .trim()
        .lines()
        .next()
        .unwrap_or("git command failed")
        .to_string();
    ToolError::new(ErrorCode::VcsError, message)
}

async fn current_branch(root: &Path) -> Result<Option<String>> {
    let output = run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if !output.status.success() {
        // Fresh repository without commits, or not a repository at all;
        // the caller decides whether that matters.
        return Ok(None);
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() || branch == "HEAD" {
        Ok(None)
    } else {
        Ok(Some(branch))
    }
}

// ---------------------------------------------------------------------------
// vcs.status
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileStatuses {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
    pub staged: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub branch: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub files: FileStatuses,
}

pub async fn status(ctx: &RunContext) -> Result<Value> {
    let workspace = &ctx.workspace;
    ensure_vcs(workspace)?;
    let root = &workspace.root;

    let porcelain = run_git(root, &["status", "--porcelain"]).await?;
    if !porcelain.status.success() {
        return Err(vcs_failure(&porcelain));
    }
    let files = parse_porcelain(&String::from_utf8_lossy(&porcelain.stdout));

    let branch = current_branch(root).await?;
    let (ahead, behind) = upstream_counts(root).await?;

    Ok(json!(StatusResult {
        branch,
        ahead,
        behind,
        files,
    }))
}

/// Ahead/behind relative to the upstream branch. No upstream is not an
/// error: both counts report zero.
async fn upstream_counts(root: &Path) -> Result<(u32, u32)> {
    let output = run_git(
        root,
        &["rev-list", "--count", "--left-right", "@{upstream}...HEAD"],
    )
    .await?;
    if !output.status.success() {
        return Ok((0, 0));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut cols = text.split_whitespace();
    let behind = cols.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    let ahead = cols.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    Ok((ahead, behind))
}

/// Parse porcelain v1: column 1 is the index state, column 2 the worktree
/// state.
fn parse_porcelain(text: &str) -> FileStatuses {
    let mut files = FileStatuses::default();
    for line in text.lines() {
        if line.len() < 4 {
            continue;
        }
        let index = line.as_bytes()[0] as char;
        let worktree = line.as_bytes()[1] as char;
        let rest = &line[3..];
        // Renames carry `old -> new`; report the new name.
        let path = rest
            .split_once(" -> ")
            .map(|(_, new)| new)
            .unwrap_or(rest)
            .to_string();

        if index == '?' && worktree == '?' {
            files.untracked.push(path);
            continue;
        }
        if index == 'U'
            || worktree == 'U'
            || (index == 'A' && worktree == 'A')
            || (index == 'D' && worktree == 'D')
        {
            files.conflicted.push(path);
            continue;
        }

        if index != ' ' {
            files.staged.push(path.clone());
            match index {
                'A' => files.added.push(path.clone()),
                'M' => files.modified.push(path.clone()),
                'D' => files.deleted.push(path.clone()),
                'R' | 'C' => files.renamed.push(path.clone()),
                _ => {}
            }
        }
        match worktree {
            'M' if !files.modified.contains(&path) => files.modified.push(path),
            'D' if !files.deleted.contains(&path) => files.deleted.push(path),
            _ => {}
        }
    }
    files
}

// ---------------------------------------------------------------------------
// vcs.diff
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DiffParams {
    #[serde(default)]
    pub staged: bool,
    #[serde(default)]
    pub paths: Vec<String>,
}

pub async fn diff(ctx: &RunContext, params: DiffParams) -> Result<Value> {
    let workspace = &ctx.workspace;
    ensure_vcs(workspace)?;
    let root = &workspace.root;

    // Path limits go through the guard like any other caller path.
    let mut rels: Vec<String> = Vec::with_capacity(params.paths.len());
    for path in &params.paths {
        let resolved = workspace.resolve(path)?;
        rels.push(resolved.relative.to_string_lossy().into_owned());
    }

    let mut args: Vec<&str> = vec!["diff"];
    if params.staged {
        args.push("--cached");
    }
    if !rels.is_empty() {
        args.push("--");
        args.extend(rels.iter().map(String::as_str));
    }
    let output = run_git(root, &args).await?;
    if !output.status.success() {
        return Err(vcs_failure(&output));
    }
    let mut raw = String::from_utf8_lossy(&output.stdout).into_owned();
    let truncated = raw.len() > MAX_DIFF_BYTES;
    if truncated {
        let mut cut = MAX_DIFF_BYTES;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
    }

    let mut numstat_args: Vec<&str> = vec!["diff", "--numstat"];
    if params.staged {
        numstat_args.push("--cached");
    }
    if !rels.is_empty() {
        numstat_args.push("--");
        numstat_args.extend(rels.iter().map(String::as_str));
    }
    let numstat = run_git(root, &numstat_args).await?;
    let (files_changed, insertions, deletions) =
        parse_numstat(&String::from_utf8_lossy(&numstat.stdout));

    Ok(json!({
        "diff": raw,
        "truncated": truncated,
        "filesChanged": files_changed,
        "insertions": insertions,
        "deletions": deletions,
    }))
}

fn parse_numstat(text: &str) -> (u64, u64, u64) {
    let mut files = 0u64;
    let mut insertions = 0u64;
    let mut deletions = 0u64;
    for line in text.lines() {
        let mut cols = line.split('\t');
        let added = cols.next().unwrap_or("0");
        let removed = cols.next().unwrap_or("0");
        files += 1;
        insertions += added.parse::<u64>().unwrap_or(0);
        deletions += removed.parse::<u64>().unwrap_or(0);
    }
    (files, insertions, deletions)
}

// ---------------------------------------------------------------------------
// vcs.checkout
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CheckoutParams {
    pub branch: String,
    #[serde(default)]
    pub create: bool,
}

pub async fn checkout(ctx: &RunContext, params: CheckoutParams) -> Result<Value> {
    let workspace = &ctx.workspace;
    ensure_vcs(workspace)?;
    validate_branch_name(&params.branch)?;
    let root = &workspace.root;

    let description = if params.create {
        format!("create and switch to branch {}", params.branch)
    } else {
        format!("switch to branch {}", params.branch)
    };
    ctx.gate(
        ApprovalKind::Write,
        &description,
        json!({ "branch": params.branch, "create": params.create }),
    )
    .await?;

    let previous = current_branch(root).await?;
    let output = if params.create {
        run_git(root, &["checkout", "-b", &params.branch]).await?
    } else {
        run_git(root, &["checkout", &params.branch]).await?
    };
    if !output.status.success() {
        return Err(vcs_failure(&output));
    }
    let branch = current_branch(root).await?;

    Ok(json!({
        "previousBranch": previous,
        "branch": branch,
        "created": params.create,
    }))
}

fn validate_branch_name(branch: &str) -> Result<()> {
    if branch.is_empty() || branch.starts_with('-') {
        return Err(ToolError::with_details(
            ErrorCode::VcsError,
            "invalid branch name",
            json!({ "branch": branch }),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// vcs.commit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CommitParams {
    pub message: String,
    /// Explicit files to stage; empty stages all changes.
    #[serde(default)]
    pub files: Vec<String>,
}

pub async fn commit(ctx: &RunContext, params: CommitParams) -> Result<Value> {
    let workspace = &ctx.workspace;
    ensure_vcs(workspace)?;
    let root = &workspace.root;

    if params.message.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::VcsError, "empty commit message"));
    }

    let description = if params.files.is_empty() {
        "commit all changes".to_string()
    } else {
        format!("commit {} file(s)", params.files.len())
    };
    ctx.gate(
        ApprovalKind::Write,
        &description,
        json!({ "files": params.files, "message": params.message }),
    )
    .await?;

    if params.files.is_empty() {
        let output = run_git(root, &["add", "-A"]).await?;
        if !output.status.success() {
            return Err(vcs_failure(&output));
        }
    } else {
        let mut rels: Vec<String> = Vec::with_capacity(params.files.len());
        for file in &params.files {
            let resolved = workspace.resolve(file)?;
            rels.push(resolved.relative.to_string_lossy().into_owned());
        }
        let mut args: Vec<&str> = vec!["add", "--"];
        args.extend(rels.iter().map(String::as_str));
        let output = run_git(root, &args).await?;
        if !output.status.success() {
            return Err(vcs_failure(&output));
        }
    }

    let output = run_git(root, &["commit", "-m", &params.message]).await?;
    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if combined.contains("nothing to commit") {
            return Err(ToolError::new(ErrorCode::VcsError, "nothing to commit"));
        }
        return Err(vcs_failure(&output));
    }

    let id = run_git(root, &["rev-parse", "HEAD"]).await?;
    let commit_id = String::from_utf8_lossy(&id.stdout).trim().to_string();

    let shown = run_git(root, &["show", "--name-only", "--format=", "HEAD"]).await?;
    let file_count = String::from_utf8_lossy(&shown.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();

    Ok(json!({
        "commit": commit_id,
        "message": params.message,
        "filesChanged": file_count,
    }))
}
