//! Filesystem tools: bounded listing, bounded reads with binary detection,
//! and unified-diff application.

use std::time::SystemTime;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use walkdir::WalkDir;

use crate::audit::AuditKind;
use crate::context::RunContext;
use crate::error::Result;
use crate::error::ToolError;
use crate::patch;
use outpost_protocol::ApprovalKind;
use outpost_protocol::ErrorCode;

/// Hard cap on entries returned by one `fs.list` call, recursive or not.
const MAX_LIST_ENTRIES: usize = 1000;

/// Default depth cap for a recursive walk.
const DEFAULT_MAX_DEPTH: usize = 10;

/// Default byte budget for one `fs.read` call.
const DEFAULT_READ_BYTES: usize = 200_000;

// ---------------------------------------------------------------------------
// fs.list
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default = "default_list_path")]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_list_path() -> String {
    ".".to_string()
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListEntry {
    relative_path: String,
    kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified_ts: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResult {
    entries: Vec<ListEntry>,
    truncated: bool,
    /// True when at least one entry was hidden by the deny set. The names
    /// themselves stay hidden.
    truncated_by_policy: bool,
}

pub async fn list(ctx: &RunContext, params: ListParams) -> Result<Value> {
    let resolved = ctx.workspace.resolve(&params.path)?;
    let metadata = tokio::fs::metadata(&resolved.absolute).await?;
    if !metadata.is_dir() {
        return Err(ToolError::with_details(
            ErrorCode::InvalidPath,
            "not a directory",
            json!({ "path": params.path }),
        ));
    }

    let workspace = ctx.workspace.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        let mut truncated = false;
        let mut truncated_by_policy = false;

        let max_depth = if params.recursive { params.max_depth } else { 1 };
        let mut walker = WalkDir::new(&resolved.absolute)
            .min_depth(1)
            .max_depth(max_depth.max(1))
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let Ok(entry) = next else {
                // Unreadable entries are omitted, same as policy-hidden ones.
                continue;
            };
            let Ok(rel) = entry.path().strip_prefix(&workspace.root) else {
                continue;
            };
            if workspace.is_denied_relative(rel) {
                truncated_by_policy = true;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if entries.len() >= MAX_LIST_ENTRIES {
                truncated = true;
                break;
            }

            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            let metadata = entry.metadata().ok();
            entries.push(ListEntry {
                relative_path: rel.to_string_lossy().into_owned(),
                kind,
                size: match kind {
                    EntryKind::File => metadata.as_ref().map(std::fs::Metadata::len),
                    _ => None,
                },
                modified_ts: metadata
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .and_then(millis_since_epoch),
            });
        }

        ListResult {
            entries,
            truncated,
            truncated_by_policy,
        }
    })
    .await
    .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?;

    Ok(json!(result))
}

fn millis_since_epoch(ts: SystemTime) -> Option<i64> {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

// ---------------------------------------------------------------------------
// fs.read
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReadParams {
    pub path: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_read_bytes")]
    pub max_bytes: usize,
}

fn default_read_bytes() -> usize {
    DEFAULT_READ_BYTES
}

pub async fn read(ctx: &RunContext, params: ReadParams) -> Result<Value> {
    let resolved = ctx.workspace.resolve(&params.path)?;
    let metadata = tokio::fs::metadata(&resolved.absolute).await?;
    if !metadata.is_file() {
        return Err(ToolError::with_details(
            ErrorCode::InvalidPath,
            "not a regular file",
            json!({ "path": params.path }),
        ));
    }
    let size = metadata.len();

    let to_read = (params.max_bytes as u64).min(size.saturating_sub(params.offset));
    let mut file = tokio::fs::File::open(&resolved.absolute).await?;
    file.seek(std::io::SeekFrom::Start(params.offset)).await?;
    let mut bytes = Vec::with_capacity(to_read as usize);
    file.take(to_read).read_to_end(&mut bytes).await?;
    let bytes_read = bytes.len() as u64;

    // UTF-8 when it decodes cleanly; anything with a replacement character
    // goes out as base64 so binary content survives the trip.
    let (content, encoding) = match String::from_utf8(bytes) {
        Ok(text) if !text.contains('\u{FFFD}') => (text, "utf-8"),
        Ok(text) => (BASE64_STANDARD.encode(text.as_bytes()), "base64"),
        Err(err) => (BASE64_STANDARD.encode(err.as_bytes()), "base64"),
    };

    Ok(json!({
        "path": resolved.relative.to_string_lossy(),
        "content": content,
        "encoding": encoding,
        "size": size,
        "offset": params.offset,
        "bytesRead": bytes_read,
        "truncated": params.offset + bytes_read < size,
    }))
}

// ---------------------------------------------------------------------------
// fs.apply_patch
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ApplyPatchParams {
    pub patch_unified: String,
    #[serde(default)]
    pub dry_run: bool,
}

pub async fn apply_patch(ctx: &RunContext, params: ApplyPatchParams) -> Result<Value> {
    // Every referenced path is validated before any bytes are written.
    let resolved = patch::inspect_patch(&ctx.workspace, &params.patch_unified)?;
    let paths: Vec<String> = resolved
        .iter()
        .map(|r| r.relative.to_string_lossy().into_owned())
        .collect();

    if !params.dry_run {
        let description = format!(
            "apply patch touching {} file(s): {}",
            paths.len(),
            paths.join(", ")
        );
        ctx.gate(ApprovalKind::Patch, &description, json!({ "paths": paths }))
            .await?;
    }

    let summary = patch::apply_patch(&ctx.workspace, &params.patch_unified, params.dry_run).await?;

    ctx.audit.record(
        AuditKind::Patch,
        Some("fs.apply_patch"),
        Some(&json!({ "dryRun": params.dry_run, "paths": paths })),
        Some(&json!(summary)),
        None,
        None,
    );

    Ok(json!({
        "applied": !params.dry_run,
        "dryRun": params.dry_run,
        "added": summary.added,
        "removed": summary.removed,
        "modified": summary.modified,
    }))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::tools::testing::exec_context;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn list_returns_entries_and_hides_denied_names() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();

        let value = list(
            &ctx,
            ListParams {
                path: ".".to_string(),
                recursive: false,
                max_depth: DEFAULT_MAX_DEPTH,
            },
        )
        .await
        .unwrap();

        let names: Vec<&str> = value["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["relativePath"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert_eq!(value["truncatedByPolicy"], json!(true));
        assert_eq!(value["truncated"], json!(false));

        let first = &value["entries"][0];
        assert_eq!(first["kind"], json!("file"));
        assert_eq!(first["size"], json!(3));
        assert!(first["modifiedTs"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn recursive_list_honours_the_depth_cap() {
        let (ctx, dir) = exec_context();
        std::fs::create_dir_all(dir.path().join("one/two")).unwrap();
        std::fs::write(dir.path().join("one/two/deep.txt"), "x").unwrap();

        let shallow = list(
            &ctx,
            ListParams {
                path: ".".to_string(),
                recursive: true,
                max_depth: 1,
            },
        )
        .await
        .unwrap();
        let names: Vec<&str> = shallow["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["relativePath"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["one"]);

        let deep = list(
            &ctx,
            ListParams {
                path: ".".to_string(),
                recursive: true,
                max_depth: 5,
            },
        )
        .await
        .unwrap();
        let names: Vec<&str> = deep["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["relativePath"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["one", "one/two", "one/two/deep.txt"]);
    }

    #[tokio::test]
    async fn list_caps_at_one_thousand_entries() {
        let (ctx, dir) = exec_context();
        for i in 0..1005 {
            std::fs::write(dir.path().join(format!("f{i:04}")), "x").unwrap();
        }
        let value = list(
            &ctx,
            ListParams {
                path: ".".to_string(),
                recursive: false,
                max_depth: DEFAULT_MAX_DEPTH,
            },
        )
        .await
        .unwrap();
        assert_eq!(value["entries"].as_array().unwrap().len(), 1000);
        assert_eq!(value["truncated"], json!(true));
    }

    #[tokio::test]
    async fn list_of_a_file_is_an_invalid_path() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        let err = list(
            &ctx,
            ListParams {
                path: "a.txt".to_string(),
                recursive: false,
                max_depth: DEFAULT_MAX_DEPTH,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPath);
    }

    #[tokio::test]
    async fn read_utf8_slice_with_offset() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "hello world").unwrap();
        let value = read(
            &ctx,
            ReadParams {
                path: "a.txt".to_string(),
                offset: 6,
                max_bytes: 3,
            },
        )
        .await
        .unwrap();
        assert_eq!(value["content"], json!("wor"));
        assert_eq!(value["encoding"], json!("utf-8"));
        assert_eq!(value["size"], json!(11));
        assert_eq!(value["bytesRead"], json!(3));
        assert_eq!(value["truncated"], json!(true));
    }

    #[tokio::test]
    async fn read_binary_falls_back_to_base64() {
        let (ctx, dir) = exec_context();
        let bytes = [0u8, 159, 146, 150, 255];
        std::fs::write(dir.path().join("blob.bin"), bytes).unwrap();
        let value = read(
            &ctx,
            ReadParams {
                path: "blob.bin".to_string(),
                offset: 0,
                max_bytes: DEFAULT_READ_BYTES,
            },
        )
        .await
        .unwrap();
        assert_eq!(value["encoding"], json!("base64"));
        let decoded = BASE64_STANDARD
            .decode(value["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, bytes);
        assert_eq!(value["truncated"], json!(false));
    }

    #[tokio::test]
    async fn read_missing_file_is_path_not_found() {
        let (ctx, _dir) = exec_context();
        let err = read(
            &ctx,
            ReadParams {
                path: "missing.txt".to_string(),
                offset: 0,
                max_bytes: DEFAULT_READ_BYTES,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::PathNotFound);
    }

    const SAMPLE_PATCH: &str = "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n hello\n-world\n+rust\n";

    #[tokio::test]
    async fn apply_patch_dry_run_writes_nothing() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "hello\nworld\n").unwrap();
        let value = apply_patch(
            &ctx,
            ApplyPatchParams {
                patch_unified: SAMPLE_PATCH.to_string(),
                dry_run: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(value["applied"], json!(false));
        assert_eq!(value["added"], json!(1));
        assert_eq!(value["removed"], json!(1));
        assert_eq!(value["modified"], json!(1));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "hello\nworld\n"
        );
    }

    #[tokio::test]
    async fn apply_patch_updates_the_file() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "hello\nworld\n").unwrap();
        let value = apply_patch(
            &ctx,
            ApplyPatchParams {
                patch_unified: SAMPLE_PATCH.to_string(),
                dry_run: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(value["applied"], json!(true));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "hello\nrust\n"
        );
    }

    #[tokio::test]
    async fn apply_patch_that_does_not_apply_fails_without_side_effects() {
        let (ctx, dir) = exec_context();
        std::fs::write(dir.path().join("a.txt"), "different\ncontent\n").unwrap();
        let err = apply_patch(
            &ctx,
            ApplyPatchParams {
                patch_unified: SAMPLE_PATCH.to_string(),
                dry_run: false,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::PatchFailed);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "different\ncontent\n"
        );
    }

    #[tokio::test]
    async fn apply_patch_rejects_deny_listed_targets() {
        let (ctx, _dir) = exec_context();
        let patch = "--- a/.env\n+++ b/.env\n@@ -1 +1 @@\n-a\n+b\n";
        let err = apply_patch(
            &ctx,
            ApplyPatchParams {
                patch_unified: patch.to_string(),
                dry_run: false,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ForbiddenPath);
    }
}
