//! Error taxonomy shared by the runtime, the client, and the deployments.
//!
//! Per-request failures (unknown session, command timeout, unreadable file)
//! are *not* errors -- they travel inside the response envelopes defined in
//! [`crate::models`]. `RexError` covers everything that is allowed to abort a
//! call: transport problems, lifecycle misuse, and failures that originated
//! inside a remote runtime and were transferred back over HTTP.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RexError>;

/// Dotted-path prefix used when transferring errors over the wire.
const CLASS_PATH_PREFIX: &str = "swerex.exceptions";

#[derive(Debug, Error)]
pub enum RexError {
    /// A bounded wait expired (startup probe loop, liveness wait).
    #[error("timeout: {0}")]
    Timeout(String),

    /// A runtime or deployment was used before `start()` completed.
    #[error("deployment not started")]
    DeploymentNotStarted,

    /// Build, container start, or the startup probe failed. The message
    /// carries any captured child stdout/stderr.
    #[error("deployment startup failed: {0}")]
    DeploymentStartup(String),

    /// Image acquisition failed.
    #[error("image pull failed: {0}")]
    ImagePull(String),

    /// Non-2xx response from the server that is not an error transfer, or a
    /// connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An error raised inside the remote runtime whose kind we could not map
    /// back to a local one.
    #[error("remote error ({class_path}): {message}")]
    Remote { class_path: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RexError {
    /// Dotted name used to identify this error kind across the wire.
    pub fn class_path(&self) -> String {
        let name = match self {
            RexError::Timeout(_) => "TimeoutError",
            RexError::DeploymentNotStarted => "DeploymentNotStartedError",
            RexError::DeploymentStartup(_) => "DeploymentStartupError",
            RexError::ImagePull(_) => "ImagePullError",
            RexError::Transport(_) => "TransportError",
            RexError::Remote { class_path, .. } => return class_path.clone(),
            RexError::Io(_) => "RuntimeError",
        };
        format!("{CLASS_PATH_PREFIX}.{name}")
    }

    /// Reconstruct a typed error from a transfer body. Unknown class paths
    /// become [`RexError::Remote`] carrying the message unchanged.
    pub fn from_transfer(transfer: ExceptionTransfer) -> Self {
        if !transfer.traceback.is_empty() {
            tracing::debug!(traceback = %transfer.traceback, "remote traceback");
        }
        let name = transfer.class_path.rsplit('.').next().unwrap_or_default();
        match name {
            "TimeoutError" => RexError::Timeout(transfer.message),
            "DeploymentNotStartedError" => RexError::DeploymentNotStarted,
            "DeploymentStartupError" => RexError::DeploymentStartup(transfer.message),
            "ImagePullError" => RexError::ImagePull(transfer.message),
            "TransportError" => RexError::Transport(transfer.message),
            _ => RexError::Remote {
                class_path: transfer.class_path,
                message: transfer.message,
            },
        }
    }
}

/// Wire form of an error that originated inside the runtime. Servers respond
/// with HTTP 511 and this body wrapped in [`ExceptionEnvelope`]; clients
/// rebuild the matching [`RexError`] kind from `class_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionTransfer {
    pub class_path: String,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEnvelope {
    pub swerexception: ExceptionTransfer,
}

impl From<&RexError> for ExceptionTransfer {
    fn from(error: &RexError) -> Self {
        ExceptionTransfer {
            class_path: error.class_path(),
            message: error.to_string(),
            traceback: String::new(),
        }
    }
}
