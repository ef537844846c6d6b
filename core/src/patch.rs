//! Unified-diff inspection and application.
//!
//! The inspector reads only the header lines of a patch (`diff --git`,
//! `---`, `+++`) to learn which files it touches; every referenced path is
//! pushed through the workspace guard before a single byte is written.
//! Application itself is delegated to the local VCS binary.

use std::io::Write;
use std::path::Path;

use serde_json::json;
use tempfile::NamedTempFile;

use crate::error::Result;
use crate::error::ToolError;
use crate::tools::vcs::run_git;
use crate::workspace::ResolvedPath;
use crate::workspace::Workspace;
use outpost_protocol::ErrorCode;

/// File paths referenced by a unified diff, in order of first appearance.
/// `/dev/null` pseudo-entries are never included.
pub fn extract_patch_paths(patch: &str) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        if path == "/dev/null" || path.is_empty() {
            return;
        }
        let cleaned = strip_diff_prefix(path);
        if !cleaned.is_empty() && !paths.iter().any(|p| p == cleaned) {
            paths.push(cleaned.to_string());
        }
    };

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            // `diff --git a/X b/Y`; X and Y may differ for renames.
            if let Some((left, right)) = rest.split_once(" b/") {
                push(left.trim());
                push(right.trim());
            }
        } else if let Some(rest) = line.strip_prefix("--- ") {
            push(header_path(rest));
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            push(header_path(rest));
        }
    }
    paths
}

/// `---`/`+++` header operand, with any trailing tab metadata removed.
fn header_path(rest: &str) -> &str {
    rest.split('\t').next().unwrap_or(rest).trim()
}

fn strip_diff_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Validate every path a patch references against the workspace guard.
/// The first violation fails the whole patch.
pub fn inspect_patch(workspace: &Workspace, patch: &str) -> Result<Vec<ResolvedPath>> {
    let paths = extract_patch_paths(patch);
    if paths.is_empty() {
        return Err(ToolError::new(
            ErrorCode::PatchFailed,
            "patch references no files",
        ));
    }
    paths
        .iter()
        .map(|path| workspace.resolve(path))
        .collect::<Result<Vec<_>>>()
}

/// Line counts reported after applying (or checking) a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PatchSummary {
    /// Inserted lines.
    pub added: u64,
    /// Deleted lines.
    pub removed: u64,
    /// Files touched.
    pub modified: u64,
}

/// Apply a unified diff inside the workspace via `git apply`. A dry run uses
/// `--check` and writes nothing. Callers are expected to have run
/// [`inspect_patch`] first.
pub async fn apply_patch(workspace: &Workspace, patch: &str, dry_run: bool) -> Result<PatchSummary> {
    let file = write_patch_file(patch)?;
    let patch_path = file.path();

    let summary = numstat(&workspace.root, patch_path).await?;

    let mut args: Vec<&str> = vec!["apply"];
    if dry_run {
        args.push("--check");
    }
    args.push("--");
    let path_str = patch_path.to_string_lossy();
    args.push(&path_str);

    let output = run_git(&workspace.root, &args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::with_details(
            ErrorCode::PatchFailed,
            patch_failure_message(&stderr),
            json!({ "dryRun": dry_run }),
        ));
    }
    Ok(summary)
}

fn write_patch_file(patch: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()
        .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?;
    file.write_all(patch.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?;
    Ok(file)
}

async fn numstat(root: &Path, patch_path: &Path) -> Result<PatchSummary> {
    let path_str = patch_path.to_string_lossy();
    let output = run_git(root, &["apply", "--numstat", "--", &path_str]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::new(
            ErrorCode::PatchFailed,
            patch_failure_message(&stderr),
        ));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut summary = PatchSummary {
        added: 0,
        removed: 0,
        modified: 0,
    };
    for line in text.lines() {
        let mut cols = line.split('\t');
        let added = cols.next().unwrap_or("0");
        let removed = cols.next().unwrap_or("0");
        // Binary files report `-` in both columns.
        summary.added += added.parse::<u64>().unwrap_or(0);
        summary.removed += removed.parse::<u64>().unwrap_or(0);
        summary.modified += 1;
    }
    Ok(summary)
}

fn patch_failure_message(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "patch does not apply".to_string()
    } else {
        // git's own phrasing ("does not apply", "corrupt patch at line N")
        // is the most useful diagnostic; pass the first line through.
        trimmed.lines().next().unwrap_or(trimmed).to_string()
    }
}
