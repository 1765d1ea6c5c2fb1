//! `claude` subprocess spawning and teardown.
//!
//! Each generation owns exactly one process. The manager builds the command
//! line, writes the prompt to stdin once and closes it, and hands back a
//! [`ClaudeProcess`] whose stdout is read as raw bytes by the worker.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Strategy for handling permission prompts in the subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PermissionStrategy {
    /// Use `--allowedTools` to pre-approve specific tools. No runtime prompts.
    AllowedTools(Vec<String>),
    /// Use `--dangerously-skip-permissions` to bypass all checks.
    /// Headless runs have nobody to answer a prompt.
    #[default]
    SkipPermissions,
}

/// How the process continues the CLI conversation of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    /// First turn: `--session-id <id>`.
    New(String),
    /// Later turns: `--resume <id>`.
    Resume(String),
}

impl Conversation {
    pub fn id(&self) -> &str {
        match self {
            Self::New(id) | Self::Resume(id) => id,
        }
    }
}

/// Configuration for one generation's process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub working_directory: PathBuf,
    /// Rendered prompt, written to stdin.
    pub prompt: String,
    pub conversation: Conversation,
    pub model: String,
    pub system_prompt: Option<String>,
    /// Built-in tool allow-list (`--tools`).
    pub tools: Option<Vec<String>>,
    /// One JSON document per `--mcp-config` flag.
    pub mcp_configs: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub partial_messages: bool,
}

impl SpawnConfig {
    pub fn new(prompt: impl Into<String>, conversation: Conversation, model: impl Into<String>) -> Self {
        Self {
            working_directory: std::env::current_dir().unwrap_or_default(),
            prompt: prompt.into(),
            conversation,
            model: model.into(),
            system_prompt: None,
            tools: None,
            mcp_configs: Vec::new(),
            disallowed_tools: Vec::new(),
            partial_messages: false,
        }
    }
}

/// Spawns `claude` processes with shared settings.
#[derive(Debug, Clone)]
pub struct SubprocessManager {
    /// Path to the `claude` binary.
    claude_bin: PathBuf,
    permission_strategy: PermissionStrategy,
    /// Timeout for graceful subprocess termination before SIGKILL.
    terminate_timeout: Duration,
}

impl SubprocessManager {
    pub fn new(claude_bin: PathBuf) -> Self {
        Self {
            claude_bin,
            permission_strategy: PermissionStrategy::default(),
            terminate_timeout: Duration::from_secs(5),
        }
    }

    /// Create a new subprocess manager with full configuration.
    pub const fn with_options(
        claude_bin: PathBuf,
        permission_strategy: PermissionStrategy,
        terminate_timeout_secs: u64,
    ) -> Self {
        Self {
            claude_bin,
            permission_strategy,
            terminate_timeout: Duration::from_secs(terminate_timeout_secs),
        }
    }

    pub const fn terminate_timeout(&self) -> Duration {
        self.terminate_timeout
    }

    /// Arguments passed to the binary, in order.
    pub fn build_args(&self, config: &SpawnConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-p".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--model".into(),
            config.model.clone(),
        ];

        match &config.conversation {
            Conversation::New(id) => args.extend(["--session-id".into(), id.clone()]),
            Conversation::Resume(id) => args.extend(["--resume".into(), id.clone()]),
        }

        match &self.permission_strategy {
            PermissionStrategy::AllowedTools(tools) => {
                if !tools.is_empty() {
                    args.push("--allowedTools".into());
                    args.extend(tools.iter().cloned());
                }
            }
            PermissionStrategy::SkipPermissions => {
                args.push("--dangerously-skip-permissions".into());
            }
        }

        if config.partial_messages {
            args.push("--include-partial-messages".into());
        }
        if let Some(ref prompt) = config.system_prompt {
            args.extend(["--system-prompt".into(), prompt.clone()]);
        }
        if let Some(ref tools) = config.tools {
            args.extend(["--tools".into(), tools.join(",")]);
        }
        for mcp in &config.mcp_configs {
            args.extend(["--mcp-config".into(), mcp.clone()]);
        }
        // Variadic, so it goes last.
        if !config.disallowed_tools.is_empty() {
            args.push("--disallowedTools".into());
            args.extend(config.disallowed_tools.iter().cloned());
        }

        args
    }

    /// Spawn a process for one generation.
    pub async fn spawn(&self, config: SpawnConfig) -> Result<ClaudeProcess, SubprocessError> {
        if !config.working_directory.is_dir() {
            tokio::fs::create_dir_all(&config.working_directory)
                .await
                .map_err(|e| SubprocessError::SpawnFailed {
                    reason: format!(
                        "cannot create working directory {}: {e}",
                        config.working_directory.display()
                    ),
                })?;
        }

        let mut cmd = Command::new(&self.claude_bin);
        cmd.current_dir(&config.working_directory)
            .args(self.build_args(&config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Ensure essential env vars are available to the subprocess even
        // when running under systemd with stripped environment.
        for key in ["HOME", "PATH", "ANTHROPIC_API_KEY"] {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        info!(
            working_dir = %config.working_directory.display(),
            model = %config.model,
            conversation = ?config.conversation,
            "Spawning claude subprocess"
        );
        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            reason: format!("{}: {e}", self.claude_bin.display()),
        })?;

        let process_id = uuid::Uuid::new_v4().to_string();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SubprocessError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            })?;
        let prompt = config.prompt;
        let pid = process_id.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(process_id = %pid, error = %e, "Failed to write prompt to stdin");
                return;
            }
            if let Err(e) = stdin.shutdown().await {
                debug!(process_id = %pid, error = %e, "Failed to close stdin");
            }
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubprocessError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let pid = process_id.clone();
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(process_id = %pid, "stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                debug!(process_id = %pid, "stderr reader finished");
                tail.into_iter().collect()
            })
        });

        Ok(ClaudeProcess {
            id: process_id,
            child,
            stdout,
            stderr_task,
            terminate_timeout: self.terminate_timeout,
        })
    }
}

/// A running `claude` process owned by one worker.
#[derive(Debug)]
pub struct ClaudeProcess {
    id: String,
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    terminate_timeout: Duration,
}

impl ClaudeProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the next stdout chunk. Zero means end of stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf).await
    }

    /// Wait for the process to exit after stdout closed.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Collected stderr lines, available once the process exited.
    pub async fn stderr_tail(&mut self) -> Vec<String> {
        match self.stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// SIGINT, then kill if the process outlives the grace period.
    pub async fn terminate(&mut self) {
        debug!(process_id = %self.id, "Terminating subprocess");

        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: pid is a valid process ID obtained from our own Child handle.
                // kill(2) with SIGINT is safe to call on any owned subprocess.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGINT) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(process_id = %self.id, pid, error = %err, "Failed to send SIGINT");
                }
            }
        }

        match tokio::time::timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(process_id = %self.id, ?status, "Process exited gracefully");
            }
            Ok(Err(e)) => {
                warn!(process_id = %self.id, error = %e, "Error waiting for process");
                self.child.kill().await.ok();
            }
            Err(_) => {
                warn!(process_id = %self.id, "Timeout waiting for graceful shutdown, killing");
                self.child.kill().await.ok();
            }
        }
    }
}

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailed { reason: String },
}
