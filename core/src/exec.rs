//! Subprocess supervisor: spawns an already-validated command with bounded
//! wall time and bounded output, and guarantees the child is reaped via a
//! two-stage soft/hard kill.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::error::ToolError;
use outpost_protocol::ErrorCode;

/// Cap for each captured stream.
const MAX_STREAM_BYTES: usize = 1024 * 1024;

/// Appended once to a stream that overflowed its cap.
pub const OUTPUT_TRUNCATED_SENTINEL: &str = "\n[OUTPUT TRUNCATED]";

/// Wall-clock ceiling when the caller does not lower it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between the soft and hard termination stages.
const SOFT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Conventional exit code for a timed-out process when the OS gave none.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Entries layered on top of the daemon environment, never replacing it.
    pub env: HashMap<String, String>,
}

#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Run a validated command to completion.
///
/// `cancel` observes the owning session's lifetime: on disconnect the child
/// gets the same two-stage kill as a timeout and the call fails with
/// `COMMAND_FAILED`.
pub async fn run_command(params: ExecParams, cancel: CancellationToken) -> Result<ExecOutput> {
    let ExecParams {
        command,
        cwd,
        timeout,
        env,
    } = params;

    let Some(program) = command.first() else {
        return Err(ToolError::new(ErrorCode::CommandFailed, "empty command"));
    };

    let mut cmd = Command::new(program);
    cmd.args(&command[1..])
        .current_dir(&cwd)
        // PATH/HOME and the rest of the daemon environment are inherited;
        // caller entries are layered on top.
        .envs(&env)
        // No stdin descriptor: some tools (ripgrep among them) probe stdin
        // and would otherwise hang waiting for input.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        ToolError::new(
            ErrorCode::CommandFailed,
            format!("failed to spawn {program}: {err}"),
        )
    })?;

    let stdout_reader = child.stdout.take().ok_or_else(|| {
        ToolError::new(ErrorCode::InternalError, "stdout pipe was not available")
    })?;
    let stderr_reader = child.stderr.take().ok_or_else(|| {
        ToolError::new(ErrorCode::InternalError, "stderr pipe was not available")
    })?;

    let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_reader), MAX_STREAM_BYTES));
    let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_reader), MAX_STREAM_BYTES));

    let mut timed_out = false;
    let mut cancelled = false;
    let exit_status = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => match result {
            Ok(wait_result) => wait_result
                .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?,
            Err(_elapsed) => {
                timed_out = true;
                terminate(&mut child).await?
            }
        },
        () = cancel.cancelled() => {
            cancelled = true;
            terminate(&mut child).await?
        }
    };
    let duration = start.elapsed();

    let (stdout_bytes, stdout_truncated) = join_reader(stdout_handle).await?;
    let (stderr_bytes, stderr_truncated) = join_reader(stderr_handle).await?;

    if cancelled {
        return Err(ToolError::new(
            ErrorCode::CommandFailed,
            "command cancelled by session disconnect",
        ));
    }

    let exit_code = if timed_out {
        exit_status.code().unwrap_or(TIMEOUT_EXIT_CODE)
    } else {
        exit_status.code().unwrap_or(-1)
    };

    Ok(ExecOutput {
        exit_code,
        stdout: finish_stream(stdout_bytes, stdout_truncated),
        stderr: finish_stream(stderr_bytes, stderr_truncated),
        duration,
        timed_out,
    })
}

/// Soft-terminate the child, grant it [`SOFT_KILL_GRACE`] to exit, then
/// hard-kill. Always returns a reaped exit status.
async fn terminate(child: &mut Child) -> Result<ExitStatus> {
    soft_kill(child);
    let status = match tokio::time::timeout(SOFT_KILL_GRACE, child.wait()).await {
        Ok(wait_result) => wait_result,
        Err(_still_running) => {
            child
                .start_kill()
                .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?;
            child.wait().await
        }
    };
    status.map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))
}

#[cfg(unix)]
fn soft_kill(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM first so well-behaved children can flush and exit.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn soft_kill(_child: &Child) {
    // No soft stage without POSIX signals; the hard kill follows the grace
    // period either way.
}

async fn join_reader(
    handle: tokio::task::JoinHandle<io::Result<(Vec<u8>, bool)>>,
) -> Result<(Vec<u8>, bool)> {
    handle
        .await
        .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))?
        .map_err(|err| ToolError::new(ErrorCode::InternalError, err.to_string()))
}

fn finish_stream(bytes: Vec<u8>, truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str(OUTPUT_TRUNCATED_SENTINEL);
    }
    text
}

/// Read a stream to EOF, keeping at most `max_bytes`. Draining continues
/// past the cap so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if buf.len() < max_bytes {
            let copy_len = n.min(max_bytes - buf.len());
            buf.extend_from_slice(&tmp[..copy_len]);
            if copy_len < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn params(argv: &[&str], timeout: Duration) -> ExecParams {
        ExecParams {
            command: argv.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            timeout,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let output = run_command(
            params(&["echo", "hello"], DEFAULT_TIMEOUT),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "hello\n");
        assert!(!output.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_nonzero_exit_codes() {
        let output = run_command(
            params(&["sh", "-c", "exit 3"], DEFAULT_TIMEOUT),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_yields_124_within_the_kill_window() {
        let start = Instant::now();
        let output = run_command(
            params(&["sleep", "10"], Duration::from_secs(1)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let elapsed = start.elapsed();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(elapsed >= Duration::from_secs(1));
        // Soft-then-hard window: well under timeout + grace + slack.
        assert!(elapsed < Duration::from_secs(8), "took {elapsed:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overflow_appends_the_sentinel_and_keeps_running() {
        let output = run_command(
            params(
                &["sh", "-c", "head -c 2000000 /dev/zero; echo done 1>&2"],
                DEFAULT_TIMEOUT,
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.ends_with(OUTPUT_TRUNCATED_SENTINEL));
        // stderr stayed under its own cap.
        assert_eq!(output.stderr, "done\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn caller_env_augments_the_daemon_env() {
        let mut env = HashMap::new();
        env.insert("OUTPOST_TEST_MARKER".to_string(), "42".to_string());
        let output = run_command(
            ExecParams {
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    "echo $OUTPOST_TEST_MARKER:$PATH".to_string(),
                ],
                cwd: std::env::temp_dir(),
                timeout: DEFAULT_TIMEOUT,
                env,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        let text = output.stdout.trim();
        // Both the injected entry and the inherited PATH are visible.
        assert!(text.starts_with("42:"), "got {text:?}");
        assert!(text.len() > "42:".len());
    }

    #[tokio::test]
    async fn disconnect_cancels_the_child() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_command(
            params(&["sleep", "30"], DEFAULT_TIMEOUT),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let start = Instant::now();
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn missing_program_is_a_command_failure() {
        let err = run_command(
            params(&["definitely-not-a-real-binary"], DEFAULT_TIMEOUT),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);
    }
}
