use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use globset::GlobBuilder;
use globset::GlobMatcher;
use serde_json::json;

use crate::error::Result;
use crate::error::ToolError;
use outpost_protocol::ErrorCode;
use outpost_protocol::Tier;

/// Deny patterns that ship with the daemon and cannot be removed by user
/// configuration. VCS hooks are intentionally absent: `.git/hooks/**` stays
/// reachable while the rest of the `.git` internals do not.
pub const BUILT_IN_DENY_PATTERNS: &[&str] = &[
    // VCS internals other than hooks.
    "**/.git/config",
    "**/.git/credentials",
    "**/.git/objects/**",
    "**/.git/refs/**",
    // SSH material.
    "**/.ssh/**",
    "**/id_rsa*",
    "**/id_ed25519*",
    "**/id_ecdsa*",
    // Cloud credentials.
    "**/.aws/**",
    // Dotenv files.
    "**/.env",
    "**/.env.*",
    // Secret stores.
    "**/secrets/**",
    "**/.secrets/**",
    // Private keys.
    "**/*.pem",
    "**/*.key",
    // Generic credential files.
    "**/credentials*",
    "**/password*",
    "**/token*",
    // Package-manager rc files.
    "**/.npmrc",
    "**/.pypirc",
    // OS metadata.
    "**/.DS_Store",
    "**/Thumbs.db",
];

/// A directory tree the daemon has been told it may touch, plus the tier and
/// deny list constraining that access. Immutable for the daemon's lifetime
/// and shared by reference across sessions.
#[derive(Debug)]
pub struct Workspace {
    pub name: String,
    /// Absolute, canonical root.
    pub root: PathBuf,
    pub tier: Tier,
    pub allow_vcs: bool,
    guard: PathGuard,
}

impl Workspace {
    /// Build a workspace with its compiled deny set. Pattern order is
    /// built-in defaults, then global config denies, then workspace denies;
    /// the first match rejects.
    pub fn new(
        name: impl Into<String>,
        root: PathBuf,
        tier: Tier,
        allow_vcs: bool,
        global_deny: &[String],
        workspace_deny: &[String],
    ) -> Result<Self> {
        if !root.is_absolute() {
            return Err(ToolError::new(
                ErrorCode::InvalidPath,
                format!("workspace root must be absolute: {}", root.display()),
            ));
        }
        let mut guard = PathGuard::default();
        for pattern in BUILT_IN_DENY_PATTERNS {
            // Built-in patterns are static and known-good.
            guard.push(pattern);
        }
        for pattern in global_deny.iter().chain(workspace_deny) {
            guard.push(pattern);
        }
        Ok(Self {
            name: name.into(),
            root,
            tier,
            allow_vcs,
            guard,
        })
    }

    /// Canonicalise, contain and deny-check a caller-supplied path.
    ///
    /// Symlinks are deliberately not resolved: a symlink whose name is
    /// within the workspace passes here and fails at the OS layer if its
    /// target points outside. Resolving it would leak the target name into
    /// the rejection message.
    pub fn resolve(&self, input: &str) -> Result<ResolvedPath> {
        let input_path = Path::new(input);
        let joined = if input_path.is_absolute() {
            input_path.to_path_buf()
        } else {
            self.root.join(input_path)
        };
        let absolute = normalize_lexically(&joined);

        let relative = match absolute.strip_prefix(&self.root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                return Err(ToolError::with_details(
                    ErrorCode::ForbiddenPath,
                    format!("path escapes workspace `{}`", self.name),
                    json!({ "path": input }),
                ));
            }
        };

        if let Some(pattern) = self.guard.first_match(&relative, &absolute) {
            return Err(ToolError::with_details(
                ErrorCode::ForbiddenPath,
                "path matches a deny pattern".to_string(),
                json!({ "path": input, "pattern": pattern }),
            ));
        }

        Ok(ResolvedPath { absolute, relative })
    }

    /// True when `relative` (already under the root) trips the deny set.
    /// Used by the recursive lister to hide entries without erroring.
    pub fn is_denied_relative(&self, relative: &Path) -> bool {
        let absolute = self.root.join(relative);
        self.guard.first_match(relative, &absolute).is_some()
    }
}

/// Outcome of a successful guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Ordered, compiled deny set. `*` and `?` never cross `/`; `**` crosses any
/// number of segments, including zero for a leading `**/`.
#[derive(Debug, Default)]
struct PathGuard {
    patterns: Vec<DenyPattern>,
}

#[derive(Debug)]
struct DenyPattern {
    source: String,
    /// Patterns starting with `/` also match the absolute path.
    rooted: bool,
    matcher: GlobMatcher,
}

impl PathGuard {
    fn push(&mut self, pattern: &str) {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => self.patterns.push(DenyPattern {
                source: pattern.to_string(),
                rooted: pattern.starts_with('/'),
                matcher: glob.compile_matcher(),
            }),
            Err(err) => {
                // Same recovery rule as invalid command regexes: skip, keep going.
                tracing::warn!("skipping invalid deny glob {pattern:?}: {err}");
            }
        }
    }

    fn first_match(&self, relative: &Path, absolute: &Path) -> Option<&str> {
        for pattern in &self.patterns {
            if pattern.matcher.is_match(relative)
                || (pattern.rooted && pattern.matcher.is_match(absolute))
            {
                return Some(&pattern.source);
            }
        }
        None
    }
}

/// Collapse `.` components and resolve `..` lexically, without touching the
/// filesystem. Mirrors what the containment check needs: the result of
/// joining an escape sequence onto the root no longer starts with the root.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn workspace() -> Workspace {
        Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Write,
            true,
            &[],
            &[],
        )
        .unwrap()
    }

    fn code_of(result: Result<ResolvedPath>) -> ErrorCode {
        result.unwrap_err().code
    }

    #[test]
    fn plain_relative_path_resolves() {
        let ws = workspace();
        let resolved = ws.resolve("src/main.rs").unwrap();
        assert_eq!(resolved.absolute, PathBuf::from("/home/u/proj/src/main.rs"));
        assert_eq!(resolved.relative, PathBuf::from("src/main.rs"));
    }

    #[test]
    fn dot_segments_collapse() {
        let ws = workspace();
        let resolved = ws.resolve("./src//./lib.rs").unwrap();
        assert_eq!(resolved.relative, PathBuf::from("src/lib.rs"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let ws = workspace();
        assert_eq!(
            code_of(ws.resolve("../../../etc/passwd")),
            ErrorCode::ForbiddenPath
        );
    }

    #[test]
    fn internal_traversal_that_stays_inside_is_allowed() {
        let ws = workspace();
        let resolved = ws.resolve("src/../README.md").unwrap();
        assert_eq!(resolved.relative, PathBuf::from("README.md"));
    }

    #[test]
    fn absolute_path_inside_workspace_is_allowed() {
        let ws = workspace();
        let resolved = ws.resolve("/home/u/proj/Cargo.toml").unwrap();
        assert_eq!(resolved.relative, PathBuf::from("Cargo.toml"));
    }

    #[test]
    fn absolute_path_outside_workspace_is_forbidden() {
        let ws = workspace();
        assert_eq!(code_of(ws.resolve("/etc/passwd")), ErrorCode::ForbiddenPath);
    }

    #[test]
    fn dotenv_is_denied_at_any_depth() {
        let ws = workspace();
        assert_eq!(code_of(ws.resolve(".env")), ErrorCode::ForbiddenPath);
        assert_eq!(
            code_of(ws.resolve("services/api/.env")),
            ErrorCode::ForbiddenPath
        );
        assert_eq!(
            code_of(ws.resolve(".env.production")),
            ErrorCode::ForbiddenPath
        );
    }

    #[test]
    fn git_internals_denied_but_hooks_allowed() {
        let ws = workspace();
        assert_eq!(code_of(ws.resolve(".git/config")), ErrorCode::ForbiddenPath);
        assert_eq!(
            code_of(ws.resolve(".git/objects/ab/cdef")),
            ErrorCode::ForbiddenPath
        );
        assert!(ws.resolve(".git/hooks/pre-commit").is_ok());
    }

    #[test]
    fn key_material_is_denied() {
        let ws = workspace();
        for path in [
            ".ssh/authorized_keys",
            "deploy/id_rsa",
            "certs/server.pem",
            "certs/server.key",
            ".aws/credentials",
            "secrets/db",
            ".npmrc",
        ] {
            assert_eq!(code_of(ws.resolve(path)), ErrorCode::ForbiddenPath, "{path}");
        }
    }

    #[test]
    fn star_does_not_cross_separators() {
        let ws = Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Read,
            false,
            &[],
            &["build/*".to_string()],
        )
        .unwrap();
        assert_eq!(code_of(ws.resolve("build/out.o")), ErrorCode::ForbiddenPath);
        // `*` must not match `deep/out.o`.
        assert!(ws.resolve("build/deep/out.o").is_ok());
    }

    #[test]
    fn double_star_crosses_separators() {
        let ws = Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Read,
            false,
            &[],
            &["build/**".to_string()],
        )
        .unwrap();
        assert_eq!(
            code_of(ws.resolve("build/deep/out.o")),
            ErrorCode::ForbiddenPath
        );
    }

    #[test]
    fn question_mark_matches_one_character() {
        let ws = Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Read,
            false,
            &[],
            &["v?.lock".to_string()],
        )
        .unwrap();
        assert_eq!(code_of(ws.resolve("v1.lock")), ErrorCode::ForbiddenPath);
        assert!(ws.resolve("v12.lock").is_ok());
    }

    #[test]
    fn rooted_pattern_matches_absolute_path() {
        let ws = Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Read,
            false,
            &["/home/u/proj/vendor/**".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(
            code_of(ws.resolve("vendor/lib.rs")),
            ErrorCode::ForbiddenPath
        );
    }

    #[test]
    fn invalid_glob_is_skipped_not_fatal() {
        let ws = Workspace::new(
            "proj",
            PathBuf::from("/home/u/proj"),
            Tier::Read,
            false,
            &[],
            &["[".to_string(), "*.bak".to_string()],
        )
        .unwrap();
        // The broken pattern is ignored; the next one still applies.
        assert_eq!(code_of(ws.resolve("old.bak")), ErrorCode::ForbiddenPath);
        assert!(ws.resolve("src/lib.rs").is_ok());
    }

    #[test]
    fn workspace_root_itself_resolves() {
        let ws = workspace();
        let resolved = ws.resolve(".").unwrap();
        assert_eq!(resolved.relative, PathBuf::from(""));
        assert_eq!(resolved.absolute, PathBuf::from("/home/u/proj"));
    }
}
