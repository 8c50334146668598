//! Shell capability for the bash and engineering agents.
//!
//! Commands run under `sh -c` with a scrubbed environment and a hard
//! timeout. On timeout the subprocess gets SIGTERM, then a kill after a
//! short grace period. Exit code, stdout, and stderr come back verbatim
//! (truncated to the logging budget).

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use crate::error::OrchestratorError;
use crate::tools::Tool;

/// Environment variables always forwarded to subprocesses.
const BASE_ENV: &[&str] = &["PATH", "HOME", "LANG", "TZ", "TMPDIR"];

/// stdout/stderr bytes kept per stream.
const OUTPUT_BUDGET: usize = 16 * 1024;

const SIGTERM_GRACE: Duration = Duration::from_secs(5);

static DANGEROUS_RES: OnceLock<Vec<Regex>> = OnceLock::new();

fn dangerous_patterns() -> &'static Vec<Regex> {
    DANGEROUS_RES.get_or_init(|| {
        [
            r"rm\s+(-\w+\s+)*/(\s|$)",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            r"\bmkfs(\.\w+)?\b",
            r"\bdd\s+if=\S+\s+of=/dev/",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
    })
}

pub fn is_dangerous_command(command: &str) -> bool {
    dangerous_patterns().iter().any(|re| re.is_match(command))
}

fn truncate_output(raw: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&raw).into_owned();
    if text.len() > OUTPUT_BUDGET {
        let cut = text
            .char_indices()
            .take_while(|(i, _)| *i < OUTPUT_BUDGET)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

pub struct BashCapability {
    default_timeout: Duration,
    /// Credential variables explicitly forwarded beyond the base set.
    forwarded_env: Vec<String>,
}

impl BashCapability {
    pub fn new(default_timeout_ms: u64, forwarded_env: Vec<String>) -> Self {
        Self {
            default_timeout: Duration::from_millis(default_timeout_ms),
            forwarded_env,
        }
    }

    async fn run(&self, command: &str, workdir: Option<&str>, timeout: Duration) -> Value {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();
        for key in BASE_ENV.iter().copied().chain(self.forwarded_env.iter().map(String::as_str)) {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return json!({
                    "exit_code": -1,
                    "stdout": "",
                    "stderr": format!("failed to spawn: {e}"),
                })
            }
        };
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let drain = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut stderr).await;
            }
            (stdout, stderr)
        };

        tokio::select! {
            (stdout, stderr) = drain => {
                let status = child.wait().await;
                let exit_code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                json!({
                    "exit_code": exit_code,
                    "stdout": truncate_output(stdout),
                    "stderr": truncate_output(stderr),
                })
            }
            _ = tokio::time::sleep(timeout) => {
                terminate(&mut child).await;
                json!({
                    "exit_code": -1,
                    "stdout": "",
                    "stderr": format!("command timed out after {timeout:?} and was terminated"),
                    "timed_out": true,
                })
            }
        }
    }
}

/// SIGTERM first so the process can clean up; kill after the grace period.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(SIGTERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[async_trait::async_trait]
impl Tool for BashCapability {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Runs a shell command with a working directory and timeout. Returns exit code, stdout, and stderr."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute via sh -c."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory; defaults to the process cwd."
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Timeout in milliseconds; defaults to the configured bash timeout."
                }
            },
            "required": ["command"]
        })
    }

    fn timeout(&self) -> Option<Duration> {
        // The subprocess timeout below handles termination; give the tool
        // itself headroom past it.
        Some(self.default_timeout + SIGTERM_GRACE + Duration::from_secs(5))
    }

    async fn invoke(&self, args: Value) -> Result<Value, OrchestratorError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OrchestratorError::Validation("bash: missing command".into()))?;
        if is_dangerous_command(command) {
            return Err(OrchestratorError::ToolExecution(format!(
                "refusing dangerous command: {command}"
            )));
        }
        let workdir = args.get("workdir").and_then(|v| v.as_str());
        let timeout = args
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        tracing::debug!(%command, ?workdir, ?timeout, "running shell command");
        Ok(self.run(command, workdir, timeout).await)
    }
}
