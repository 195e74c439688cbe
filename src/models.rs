//! Request and response entities for the runtime RPC surface.
//!
//! These are the JSON bodies exchanged between the orchestrator-side client
//! ([`crate::remote`]) and the in-runtime server ([`crate::server`]). Every
//! response that can fail per-request carries `success`/`failure_reason`
//! fields instead of raising; see [`crate::error`] for what *is* allowed to
//! raise.

use serde::{Deserialize, Serialize};

/// Session key used when a request does not name one.
pub const DEFAULT_SESSION: &str = "default";

/// `exit_code_raw` sentinel: the command did not finish within the timeout.
pub const EXIT_CODE_TIMEOUT: &str = "-100";
/// `exit_code_raw` sentinel: the command finished but `$?` could not be
/// captured within its own timeout.
pub const EXIT_CODE_CAPTURE_TIMEOUT: &str = "-200";
/// `exit_code_raw` sentinel: the session exists but its shell never started.
pub const EXIT_CODE_NOT_INITIALIZED: &str = "-300";
/// `exit_code_raw` sentinel: the session key does not exist.
pub const EXIT_CODE_UNKNOWN_SESSION: &str = "-312";

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default = "default_session")]
    pub session: String,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            session: default_session(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    /// Whatever the shell printed while starting up (banner, rc noise).
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    #[serde(default = "default_session")]
    pub session: String,
}

impl Default for CloseSessionRequest {
    fn default() -> Self {
        Self {
            session: default_session(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub failure_reason: String,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A request to run a command inside a session.
///
/// `is_interactive_command` marks a command expected to leave the shell
/// inside a sub-REPL (e.g. `python`); `is_interactive_quit` marks the command
/// that exits that sub-REPL. The two are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub command: String,
    #[serde(default = "default_session")]
    pub session: String,
    /// Seconds to wait for one of the expect strings (or the prompt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Sentinel strings matched in addition to the shell prompt.
    #[serde(default)]
    pub expect: Vec<String>,
    #[serde(default)]
    pub is_interactive_command: bool,
    #[serde(default)]
    pub is_interactive_quit: bool,
}

impl Action {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            session: default_session(),
            timeout: None,
            expect: Vec::new(),
            is_interactive_command: false,
            is_interactive_quit: false,
        }
    }
}

/// Result of an [`Action`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    /// Bytes between the sent command and the matched sentinel, echo
    /// suppressed.
    #[serde(default)]
    pub output: String,
    /// Decimal exit code, or one of the reserved negative sentinels.
    #[serde(default)]
    pub exit_code_raw: String,
    /// Which sentinel matched; empty on timeout.
    #[serde(default)]
    pub expect_string: String,
    /// Empty on success.
    #[serde(default)]
    pub failure_reason: String,
}

impl Observation {
    pub fn failure(exit_code_raw: &str, failure_reason: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            exit_code_raw: exit_code_raw.to_string(),
            expect_string: String::new(),
            failure_reason: failure_reason.into(),
        }
    }

    /// `exit_code_raw` parsed as an integer, if it is one.
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code_raw.trim().parse().ok()
    }

    pub fn success(&self) -> bool {
        self.failure_reason.is_empty()
    }
}

// ---------------------------------------------------------------------------
// One-shot commands
// ---------------------------------------------------------------------------

/// The program of a one-shot [`Command`]: a shell line or an argv vector.
///
/// `shell=true` expects a single string run via `/bin/sh -c`; `shell=false`
/// expects an argv vector spawned directly. An argv with `shell=true` is
/// joined with spaces rather than silently running only its first element; a
/// bare string with `shell=false` is treated as a program name with no
/// arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandSpec,
    #[serde(default)]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// Process result of a one-shot [`Command`]. `exit_code` is the process
/// return, `-1` on timeout, `-2` on any other failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub failure_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    #[serde(default = "default_true")]
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub source_path: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default = "default_true")]
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Liveness and shutdown
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsAliveResponse {
    pub is_alive: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseResponse {}
