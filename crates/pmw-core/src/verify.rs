use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Output kept per command, from the tail.
const MAX_OUTPUT: usize = 10 * 1024;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "files", rename_all = "snake_case")]
pub enum VerificationScope {
    Files(Vec<String>),
    FullProject,
}

impl VerificationScope {
    /// Scope verification to `files`. An empty list never means "nothing to
    /// check": it widens to the full project.
    pub fn from_modified(files: &[String]) -> Self {
        if files.is_empty() {
            tracing::warn!("no modified files recorded; verifying the full project");
            VerificationScope::FullProject
        } else {
            VerificationScope::Files(files.to_vec())
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VerificationScope::Files(_) => "files",
            VerificationScope::FullProject => "full",
        }
    }

    fn files_arg(&self) -> String {
        match self {
            VerificationScope::Files(files) => files.join(" "),
            VerificationScope::FullProject => ".".to_string(),
        }
    }

    /// Substitute `{files}` in a command template.
    pub fn render(&self, command: &str) -> String {
        command.replace("{files}", &self.files_arg())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn failed(command: &str, output: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            passed: false,
            output: output.into(),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub scope: VerificationScope,
    pub results: Vec<CommandResult>,
    pub passed: bool,
}

impl VerificationReport {
    pub fn first_failure(&self) -> Option<&CommandResult> {
        self.results.iter().find(|r| !r.passed)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs one verification command. `timeout: None` waits indefinitely.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, scope: &VerificationScope, timeout: Option<Duration>) -> CommandResult;
}

/// Runs every command in order and stops at the first failure.
pub fn run_all(
    runner: &dyn CommandRunner,
    commands: &[String],
    scope: &VerificationScope,
    timeout: Option<Duration>,
) -> VerificationReport {
    let mut results = Vec::new();
    for command in commands {
        let result = runner.run(command, scope, timeout);
        let passed = result.passed;
        results.push(result);
        if !passed {
            break;
        }
    }
    let passed = results.iter().all(|r| r.passed);
    VerificationReport {
        scope: scope.clone(),
        results,
        passed,
    }
}

/// `sh -c` in the project root. The scope is exported as `PMW_SCOPE`
/// (`files` or `full`) and `PMW_SCOPE_FILES`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    cwd: PathBuf,
}

impl ShellRunner {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, scope: &VerificationScope, timeout: Option<Duration>) -> CommandResult {
        if command.trim().is_empty() {
            return CommandResult::failed(command, "verification command is empty");
        }
        let rendered = scope.render(command);
        let start = Instant::now();
        let (passed, output, timed_out) = execute_shell(&rendered, &self.cwd, scope, timeout);
        tracing::debug!(command = %rendered, passed, timed_out, "verification command finished");
        CommandResult {
            command: rendered,
            passed,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            timed_out,
        }
    }
}

/// Returns (success, combined output, timed out).
///
/// Stdout and stderr are drained on dedicated threads so a chatty command
/// cannot fill a pipe and deadlock; a waiter thread reports the exit status
/// over a channel so the timeout needs no polling.
fn execute_shell(
    command: &str,
    cwd: &Path,
    scope: &VerificationScope,
    timeout: Option<Duration>,
) -> (bool, String, bool) {
    let files = match scope {
        VerificationScope::Files(f) => f.join("\n"),
        VerificationScope::FullProject => String::new(),
    };
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env("PMW_SCOPE", scope.label())
        .env("PMW_SCOPE_FILES", files)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own process group, so a timeout takes down everything the command started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return (false, format!("failed to spawn: {e}"), false),
    };

    let child_pid = child.id();
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(mut r) = stdout_handle {
            use std::io::Read;
            let _ = r.read_to_string(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || -> String {
        let mut buf = String::new();
        if let Some(mut r) = stderr_handle {
            use std::io::Read;
            let _ = r.read_to_string(&mut buf);
        }
        buf
    });

    let wait_result = match timeout {
        None => child.wait(),
        Some(limit) => {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(child.wait());
            });
            match rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(_) => {
                    kill_process_group(child_pid);
                    return (false, format!("timed out after {}s", limit.as_secs()), true);
                }
            }
        }
    };

    let stdout_buf = stdout_thread.join().unwrap_or_default();
    let stderr_buf = stderr_thread.join().unwrap_or_default();

    match wait_result {
        Ok(status) => (status.success(), combine_output(&stdout_buf, &stderr_buf), false),
        Err(e) => (false, format!("wait failed: {e}"), false),
    }
}

/// Combine stdout/stderr and keep at most the last 10 KiB.
fn combine_output(stdout: &str, stderr: &str) -> String {
    let output = if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    };
    let trimmed = output.trim();
    if trimmed.len() <= MAX_OUTPUT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX_OUTPUT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// The child leads its own group, so `-pid` addresses the whole group.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
