//! The runtime interface and its in-process implementation.
//!
//! [`Runtime`] is the seam between transports and execution: the server wraps
//! a [`LocalRuntime`], the orchestrator talks to a
//! [`RemoteRuntime`](crate::remote::RemoteRuntime), and both expose the same
//! operations. `LocalRuntime` owns the session map; per-session operations
//! are serialized through a per-entry mutex while distinct sessions run
//! concurrently.

use crate::error::Result;
use crate::models::{
    Action, CloseResponse, CloseSessionRequest, CloseSessionResponse, Command, CommandResponse,
    CommandSpec, CreateSessionRequest, CreateSessionResponse, EXIT_CODE_UNKNOWN_SESSION,
    IsAliveResponse, Observation, ReadFileRequest, ReadFileResponse, UploadRequest,
    UploadResponse, WriteFileRequest, WriteFileResponse,
};
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

/// The operations every runtime supports, local or remote.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn is_alive(&self, timeout: Option<f64>) -> Result<IsAliveResponse>;
    async fn create_session(&self, request: CreateSessionRequest) -> Result<CreateSessionResponse>;
    async fn run_in_session(&self, action: Action) -> Result<Observation>;
    async fn close_session(&self, request: CloseSessionRequest) -> Result<CloseSessionResponse>;
    async fn execute(&self, command: Command) -> Result<CommandResponse>;
    async fn read_file(&self, request: ReadFileRequest) -> Result<ReadFileResponse>;
    async fn write_file(&self, request: WriteFileRequest) -> Result<WriteFileResponse>;
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse>;
    async fn close(&self) -> Result<CloseResponse>;
}

/// Runtime executing directly in this process.
pub struct LocalRuntime {
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn is_alive(&self, _timeout: Option<f64>) -> Result<IsAliveResponse> {
        Ok(IsAliveResponse {
            is_alive: true,
            message: String::new(),
        })
    }

    async fn create_session(&self, request: CreateSessionRequest) -> Result<CreateSessionResponse> {
        // Insert before starting so a concurrent create on the same key fails
        // fast; actions queue on the entry's own lock until startup finishes.
        let entry = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&request.session) {
                return Ok(CreateSessionResponse {
                    success: false,
                    output: String::new(),
                    failure_reason: format!("session {} already exists", request.session),
                });
            }
            let entry = Arc::new(Mutex::new(Session::new()));
            sessions.insert(request.session.clone(), entry.clone());
            entry
        };
        tracing::info!(session = %request.session, "creating session");
        let mut session = entry.lock().await;
        Ok(session.start().await)
    }

    async fn run_in_session(&self, action: Action) -> Result<Observation> {
        let entry = self.sessions.lock().await.get(&action.session).cloned();
        let Some(entry) = entry else {
            return Ok(Observation::failure(
                EXIT_CODE_UNKNOWN_SESSION,
                format!("session {:?} does not exist", action.session),
            ));
        };
        let mut session = entry.lock().await;
        Ok(session.run(&action).await)
    }

    async fn close_session(&self, request: CloseSessionRequest) -> Result<CloseSessionResponse> {
        let entry = self.sessions.lock().await.remove(&request.session);
        let Some(entry) = entry else {
            return Ok(CloseSessionResponse {
                success: false,
                failure_reason: format!("session {:?} does not exist", request.session),
            });
        };
        tracing::info!(session = %request.session, "closing session");
        entry.lock().await.close().await;
        Ok(CloseSessionResponse {
            success: true,
            failure_reason: String::new(),
        })
    }

    async fn execute(&self, command: Command) -> Result<CommandResponse> {
        Ok(execute_command(&command).await)
    }

    async fn read_file(&self, request: ReadFileRequest) -> Result<ReadFileResponse> {
        match tokio::fs::read_to_string(&request.path).await {
            Ok(content) => Ok(ReadFileResponse {
                success: true,
                content,
                failure_reason: String::new(),
            }),
            Err(e) => Ok(ReadFileResponse {
                success: false,
                content: String::new(),
                failure_reason: e.to_string(),
            }),
        }
    }

    async fn write_file(&self, request: WriteFileRequest) -> Result<WriteFileResponse> {
        let path = Path::new(&request.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, request.content.as_bytes()).await?;
        Ok(WriteFileResponse { success: true })
    }

    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse> {
        let source = Path::new(&request.source_path);
        let target = Path::new(&request.target_path);
        if source.is_dir() {
            for entry in walkdir::WalkDir::new(source) {
                let entry = entry.map_err(std::io::Error::other)?;
                let relative = entry
                    .path()
                    .strip_prefix(source)
                    .map_err(std::io::Error::other)?;
                let destination = target.join(relative);
                if entry.file_type().is_dir() {
                    tokio::fs::create_dir_all(&destination).await?;
                } else {
                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::copy(entry.path(), &destination).await?;
                }
            }
        } else {
            if let Some(parent) = target.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::copy(source, target).await?;
        }
        Ok(UploadResponse { success: true })
    }

    async fn close(&self) -> Result<CloseResponse> {
        let entries: Vec<_> = self.sessions.lock().await.drain().collect();
        for (name, entry) in entries {
            tracing::debug!(session = %name, "closing session on runtime shutdown");
            entry.lock().await.close().await;
        }
        Ok(CloseResponse {})
    }
}

/// Run a one-shot command, capturing stdout and stderr separately.
///
/// All failures are folded into the response: `-1` for timeouts (with a
/// diagnostic stderr), `-2` for anything else. The child runs in its own
/// process group so a timeout kill takes the whole tree.
async fn execute_command(command: &Command) -> CommandResponse {
    let mut cmd = match build_command(command) {
        Ok(cmd) => cmd,
        Err(reason) => {
            return CommandResponse {
                stdout: String::new(),
                stderr: reason,
                exit_code: -2,
            };
        }
    };
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: pre_exec runs before exec in the child process.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandResponse {
                stdout: String::new(),
                stderr: format!("failed to spawn process: {e}"),
                exit_code: -2,
            };
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });
    let stderr_task = tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut buffer).await;
        }
        buffer
    });

    let exit_code = if let Some(seconds) = command.timeout {
        match tokio::time::timeout(Duration::from_secs_f64(seconds), child.wait()).await {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(e)) => {
                return CommandResponse {
                    stdout: String::new(),
                    stderr: format!("failed to wait for process: {e}"),
                    exit_code: -2,
                };
            }
            Err(_) => {
                let _ = kill_process_group(&child);
                let _ = child.wait().await;
                return CommandResponse {
                    stdout: String::new(),
                    stderr: format!("timeout ({seconds}s) exceeded while running command"),
                    exit_code: -1,
                };
            }
        }
    } else {
        match child.wait().await {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                return CommandResponse {
                    stdout: String::new(),
                    stderr: format!("failed to wait for process: {e}"),
                    exit_code: -2,
                };
            }
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    CommandResponse {
        stdout: decode_backslash(&stdout),
        stderr: decode_backslash(&stderr),
        exit_code,
    }
}

fn build_command(command: &Command) -> std::result::Result<tokio::process::Command, String> {
    match (&command.command, command.shell) {
        (CommandSpec::Shell(line), true) => {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(line);
            Ok(cmd)
        }
        (CommandSpec::Argv(argv), true) => {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(argv.join(" "));
            Ok(cmd)
        }
        (CommandSpec::Argv(argv), false) => {
            let Some((program, args)) = argv.split_first() else {
                return Err("empty argv".to_string());
            };
            let mut cmd = tokio::process::Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        (CommandSpec::Shell(line), false) => Ok(tokio::process::Command::new(line)),
    }
}

/// SIGKILL the process group of a child (we called `setsid`, so the child's
/// PID is the group ID).
fn kill_process_group(child: &tokio::process::Child) -> std::result::Result<(), String> {
    let pid = child
        .id()
        .ok_or_else(|| "process has no PID (already exited?)".to_string())?;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(-(pid as i32)),
        nix::sys::signal::Signal::SIGKILL,
    )
    .map_err(|e| format!("failed to kill process group: {e}"))
}

/// Decode bytes as UTF-8, escaping undecodable bytes as `\xNN` instead of
/// losing them.
pub fn decode_backslash(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad = e.error_len().unwrap_or(after.len());
                for byte in &after[..bad] {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
                rest = &after[bad..];
            }
        }
    }
}
