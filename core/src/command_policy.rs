use std::sync::LazyLock;

use regex_lite::Regex;

/// Outcome of the allow/deny engine for one proposed subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Allow,
    Deny {
        reason: String,
        pattern: Option<String>,
    },
}

impl CommandVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, CommandVerdict::Allow)
    }
}

/// User-configured allow/deny regexes, compiled once at config load.
/// Invalid patterns are skipped so one typo never disables the other rules.
#[derive(Debug, Default)]
pub struct CommandRules {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl CommandRules {
    pub fn compile(allow: &[String], deny: &[String]) -> Self {
        Self {
            allow: compile_user_patterns(allow),
            deny: compile_user_patterns(deny),
        }
    }
}

fn compile_user_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                tracing::warn!("skipping invalid command pattern {pattern:?}: {err}");
                None
            }
        })
        .collect()
}

/// Patterns that deny a command no matter what the user configuration says.
/// Matched against the reconstituted command line.
#[rustfmt::skip]
const ALWAYS_DENY_PATTERNS: &[&str] = &[
    // Destructive filesystem operations.
    r"^rm\s+-[rRf]+\s+/\s*($|\s)",
    r"^rm\s+-[rRf]+\s+~(/|\s|$)",
    r"^rm\s.*--no-preserve-root",
    r"^mkfs",
    r"^dd\s.*of=/dev/",
    // Data exfiltration.
    r"^curl\s.*(-d|--data[-a-z]*)\s+@",
    r"^wget\s.*--post-file",
    r"^scp\s.*\S+@\S+:",
    r"^rsync\s.*\S+@\S+:",
    // Privilege escalation.
    r"^(sudo|doas)(\s|$)",
    r"^su(\s|$)",
    // Scheduled tasks.
    r"^crontab(\s|$)",
    r"^at\s",
    // Service control.
    r"^systemctl\s+(start|stop|restart|enable|disable)(\s|$)",
    r"^service\s+\S+\s+(start|stop|restart)(\s|$)",
    r"^launchctl\s+(load|unload|kickstart)(\s|$)",
    // System package installation.
    r"^apt(-get)?\s+(install|remove|purge)(\s|$)",
    r"^(yum|dnf)\s+(install|remove)(\s|$)",
    r"^brew\s+(install|uninstall|remove)(\s|$)",
    // Shell escapes.
    r";\s*(sh|bash|zsh|dash|fish)(\s|$)",
    r"\|\s*(sh|bash|zsh|dash|fish)(\s|$)",
    r"`",
    r"\$\(",
    // Environment mutation.
    r"^export\s+[A-Za-z_][A-Za-z0-9_]*=",
    r"^env\s+[A-Za-z_][A-Za-z0-9_]*=",
    // Inline interpreter scripts that reach for process/network modules.
    r"^(python3?|perl|ruby|node|deno)\s(.*\s)?-(c|e)\s.*\b(os|subprocess|socket|child_process)\b",
];

static ALWAYS_DENY: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    ALWAYS_DENY_PATTERNS
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some((regex, *pattern)),
            Err(err) => {
                // Unreachable for the static table; kept so a bad edit
                // degrades to a weaker policy instead of a panic.
                tracing::error!("built-in deny pattern {pattern:?} failed to compile: {err}");
                None
            }
        })
        .collect()
});

/// Decide whether `command args...` may be spawned.
///
/// Layer order: built-in always-deny, user deny, user allow, built-in
/// default allow, then deny. First match wins within a layer.
pub fn validate(command: &str, args: &[String], rules: &CommandRules) -> CommandVerdict {
    let line = reconstitute(command, args);

    for (regex, source) in ALWAYS_DENY.iter() {
        if regex.is_match(&line) {
            return CommandVerdict::Deny {
                reason: "matches built-in deny pattern".to_string(),
                pattern: Some((*source).to_string()),
            };
        }
    }

    for regex in &rules.deny {
        if regex.is_match(&line) {
            return CommandVerdict::Deny {
                reason: "matches configured deny pattern".to_string(),
                pattern: Some(regex.as_str().to_string()),
            };
        }
    }

    for regex in &rules.allow {
        if regex.is_match(&line) {
            return CommandVerdict::Allow;
        }
    }

    if is_default_allowed(command, args) {
        return CommandVerdict::Allow;
    }

    CommandVerdict::Deny {
        reason: "not in allowlist".to_string(),
        pattern: None,
    }
}

fn reconstitute(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

/// Commands that are allowed without any user configuration: read-only
/// inspection, common build/test/lint tooling and version probes.
fn is_default_allowed(command: &str, args: &[String]) -> bool {
    // `anything --version` is harmless and constantly used by build tools.
    if args.len() == 1 && matches!(args[0].as_str(), "--version" | "-V" | "--help") {
        return true;
    }

    let sub = args.first().map(String::as_str);

    match command {
        // Read-only file viewers and their modern equivalents.
        "ls" | "cat" | "head" | "tail" | "wc" | "grep" | "rg" | "fd" | "bat" | "stat" | "file"
        | "pwd" | "which" => true,

        // Read-only VCS subcommands.
        "git" => matches!(
            sub,
            Some("status" | "log" | "diff" | "show" | "branch" | "tag" | "remote" | "ls-files")
        ),

        // Build and test runners per ecosystem.
        "cargo" => matches!(
            sub,
            Some("build" | "check" | "test" | "fmt" | "clippy" | "metadata" | "tree")
        ),
        "go" => matches!(sub, Some("build" | "test" | "vet" | "env" | "version")),
        "make" | "pytest" | "tox" | "jest" | "vitest" => true,
        "npm" => matches!(sub, Some("test" | "ls" | "list" | "view" | "outdated" | "ping")),
        "pnpm" | "yarn" => matches!(sub, Some("test" | "list" | "outdated")),

        // Read-only package-manager queries.
        "pip" | "pip3" => matches!(sub, Some("list" | "show" | "freeze" | "check")),

        // Linters, formatters, type checkers.
        "eslint" | "prettier" | "ruff" | "black" | "flake8" | "rustfmt" | "gofmt"
        | "shellcheck" | "tsc" | "mypy" | "pyright" => true,

        _ => false,
    }
}

/// Tokenise a user-provided command string: whitespace-separated words,
/// single and double quotes each transparent to the other, `\x` producing a
/// literal `x`. Returns `None` when quoting is unbalanced.
pub fn split_command_line(line: &str) -> Option<Vec<String>> {
    shlex::split(line)
}
