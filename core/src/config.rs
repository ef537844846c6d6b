//! Daemon configuration: YAML on disk, validated and compiled at startup,
//! immutable afterwards. A configuration snapshot is shared by reference
//! across sessions.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use regex_lite::Regex;
use serde::Deserialize;

use crate::command_policy::CommandRules;
use crate::workspace::Workspace;
use outpost_protocol::Tier;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3847;
pub const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 300_000;

/// Resolve the daemon home: `$OUTPOST_HOME` when set, else `~/.outpost`.
pub fn outpost_home() -> std::io::Result<PathBuf> {
    match std::env::var_os("OUTPOST_HOME") {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => dirs::home_dir()
            .map(|home| home.join(".outpost"))
            .ok_or_else(|| std::io::Error::other("could not determine home directory")),
    }
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE_NAME)
}

/// On-disk schema. Field names are camelCase on disk; unknown fields are
/// rejected so typos fail loudly at startup instead of silently weakening
/// the policy.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ConfigFile {
    pub version: u32,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
    #[serde(default)]
    pub default_workspace: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub approvals: ApprovalsSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub global_deny_patterns: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct WorkspaceEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_tier")]
    pub tier: Tier,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub allow_vcs: bool,
}

fn default_tier() -> Tier {
    Tier::Read
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: Transport::default(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    #[default]
    Http,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CommandsSection {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ApprovalsSection {
    #[serde(default = "default_true")]
    pub require_write_approval: bool,
    #[serde(default = "default_true")]
    pub require_exec_approval: bool,
    /// Explicit fail-open switch. Off, gated operations without an approver
    /// fail closed once the timeout passes.
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub auto_approve_patterns: Vec<String>,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

impl Default for ApprovalsSection {
    fn default() -> Self {
        Self {
            require_write_approval: true,
            require_exec_approval: true,
            auto_approve: false,
            auto_approve_patterns: Vec::new(),
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_approval_timeout_ms() -> u64 {
    DEFAULT_APPROVAL_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_true")]
    pub timestamps: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            json_logs: false,
            timestamps: true,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Compiled approval policy used by the gate.
#[derive(Debug)]
pub struct ApprovalPolicy {
    pub require_write_approval: bool,
    pub require_exec_approval: bool,
    pub auto_approve: bool,
    pub auto_approve_patterns: Vec<Regex>,
    pub timeout: Duration,
}

impl ApprovalPolicy {
    fn compile(section: &ApprovalsSection) -> Self {
        let auto_approve_patterns = section
            .auto_approve_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    tracing::warn!("skipping invalid autoApprove pattern {pattern:?}: {err}");
                    None
                }
            })
            .collect();
        Self {
            require_write_approval: section.require_write_approval,
            require_exec_approval: section.require_exec_approval,
            auto_approve: section.auto_approve,
            auto_approve_patterns,
            timeout: Duration::from_millis(section.approval_timeout_ms),
        }
    }

    pub fn auto_approves(&self, description: &str) -> bool {
        self.auto_approve
            || self
                .auto_approve_patterns
                .iter()
                .any(|regex| regex.is_match(description))
    }
}

/// Validated runtime configuration. Workspace roots are canonical, command
/// and approval patterns compiled, names unique.
#[derive(Debug)]
pub struct Config {
    pub workspaces: Vec<Arc<Workspace>>,
    pub default_workspace: Option<String>,
    pub server: ServerConfig,
    pub command_rules: CommandRules,
    pub approvals: ApprovalPolicy,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let file: ConfigFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config at {}", path.display()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFile) -> anyhow::Result<Self> {
        if file.version != 1 {
            return Err(anyhow!(
                "unsupported config version {} (expected 1)",
                file.version
            ));
        }

        let mut seen = HashSet::new();
        let mut workspaces = Vec::with_capacity(file.workspaces.len());
        for entry in &file.workspaces {
            if !seen.insert(entry.name.clone()) {
                return Err(anyhow!("duplicate workspace name {:?}", entry.name));
            }
            let root = std::fs::canonicalize(&entry.path).with_context(|| {
                format!(
                    "workspace {:?}: canonicalising root {}",
                    entry.name,
                    entry.path.display()
                )
            })?;
            let workspace = Workspace::new(
                entry.name.clone(),
                root,
                entry.tier,
                entry.allow_vcs,
                &file.global_deny_patterns,
                &entry.deny_patterns,
            )
            .map_err(|err| anyhow!("workspace {:?}: {err}", entry.name))?;
            workspaces.push(Arc::new(workspace));
        }

        if let Some(name) = &file.default_workspace {
            if !workspaces.iter().any(|ws| &ws.name == name) {
                return Err(anyhow!("defaultWorkspace {:?} is not a workspace", name));
            }
        }

        Ok(Self {
            workspaces,
            default_workspace: file.default_workspace,
            server: file.server,
            command_rules: CommandRules::compile(&file.commands.allow, &file.commands.deny),
            approvals: ApprovalPolicy::compile(&file.approvals),
            logging: file.logging,
        })
    }

    /// Select a workspace by name, falling back to `defaultWorkspace`, then
    /// to a sole configured workspace.
    pub fn workspace(&self, name: Option<&str>) -> anyhow::Result<Arc<Workspace>> {
        let wanted = name.or(self.default_workspace.as_deref());
        match wanted {
            Some(wanted) => self
                .workspaces
                .iter()
                .find(|ws| ws.name == wanted)
                .cloned()
                .ok_or_else(|| anyhow!("no workspace named {wanted:?}")),
            None if self.workspaces.len() == 1 => Ok(self.workspaces[0].clone()),
            None => Err(anyhow!(
                "multiple workspaces configured; pass --workspace or set defaultWorkspace"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml_with_root(root: &Path) -> String {
        format!(
            r#"
version: 1
workspaces:
  - name: proj
    path: {root}
    tier: write
    allowVcs: true
    denyPatterns:
      - "dist/**"
defaultWorkspace: proj
server:
  port: 4000
commands:
  allow:
    - "^terraform plan"
  deny:
    - "^git push"
approvals:
  requireExecApproval: false
logging:
  level: debug
globalDenyPatterns:
  - "*.sqlite"
"#,
            root = root.display()
        )
    }

    #[test]
    fn full_config_parses_and_compiles() {
        let dir = tempfile::tempdir().unwrap();
        let file: ConfigFile = serde_yaml::from_str(&yaml_with_root(dir.path())).unwrap();
        let config = Config::from_file(file).unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, DEFAULT_HOST);
        assert_eq!(config.server.transport, Transport::Http);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.approvals.require_write_approval);
        assert!(!config.approvals.require_exec_approval);
        assert_eq!(config.approvals.timeout, Duration::from_millis(300_000));

        let ws = config.workspace(None).unwrap();
        assert_eq!(ws.name, "proj");
        assert_eq!(ws.tier, Tier::Write);
        assert!(ws.allow_vcs);
        // Workspace deny pattern and global pattern both active.
        assert!(ws.resolve("dist/app.js").is_err());
        assert!(ws.resolve("cache.sqlite").is_err());
    }

    #[test]
    fn version_other_than_one_is_rejected() {
        let file: ConfigFile = serde_yaml::from_str("version: 2\n").unwrap();
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ConfigFile, _> = serde_yaml::from_str("version: 1\nbogus: true\n");
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_workspace_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "version: 1\nworkspaces:\n  - name: a\n    path: {p}\n  - name: a\n    path: {p}\n",
            p = dir.path().display()
        );
        let file: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn missing_default_workspace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "version: 1\nworkspaces:\n  - name: a\n    path: {p}\ndefaultWorkspace: b\n",
            p = dir.path().display()
        );
        let file: ConfigFile = serde_yaml::from_str(&yaml).unwrap();
        assert!(Config::from_file(file).is_err());
    }

    #[test]
    fn workspace_selection_falls_back_to_sole_entry() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "version: 1\nworkspaces:\n  - name: only\n    path: {p}\n",
            p = dir.path().display()
        );
        let config = Config::from_file(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        assert_eq!(config.workspace(None).unwrap().name, "only");
        assert!(config.workspace(Some("missing")).is_err());
    }

    #[test]
    fn auto_approve_patterns_match_descriptions() {
        let section = ApprovalsSection {
            auto_approve_patterns: vec!["^cargo (test|check)".to_string()],
            ..ApprovalsSection::default()
        };
        let policy = ApprovalPolicy::compile(&section);
        assert!(policy.auto_approves("cargo test --workspace"));
        assert!(!policy.auto_approves("cargo publish"));
    }
}
