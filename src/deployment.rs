//! Deployment lifecycle: the contract every backend satisfies, the liveness
//! waiter that gates the transition into `Running`, and the trivial
//! remote-only backend.
//!
//! A deployment materializes a reachable runtime (usually by starting a
//! container, see [`crate::docker`]), probes it until healthy, and tears it
//! down. Methods take `&self`: state lives behind interior locks so the
//! global cleanup registry can stop a deployment from the signal path.

use crate::cleanup;
use crate::error::{Result, RexError};
use crate::models::IsAliveResponse;
use crate::remote::{RemoteRuntime, RemoteRuntimeConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Where a deployment is in its lifecycle. Transitions are owned by
/// `start()`/`stop()`; `Running` implies the startup probe succeeded at
/// least once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeploymentState {
    #[default]
    Unstarted,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[async_trait]
pub trait Deployment: Send + Sync {
    /// Materialize the runtime and block until it answers liveness probes.
    async fn start(&self) -> Result<()>;

    /// Tear everything down. Must be safe to call in any state; cleanup paths
    /// log and continue rather than mask the original error.
    async fn stop(&self) -> Result<()>;

    /// One liveness probe. Errors are fatal (the backing container or
    /// process died); a `false` answer just means "not up yet".
    async fn is_alive(&self, timeout: Option<f64>) -> Result<IsAliveResponse>;

    /// The runtime client, once `start()` has constructed it.
    async fn runtime(&self) -> Result<Arc<RemoteRuntime>>;
}

/// Delay between liveness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Probe `deployment` until it reports alive, bounded by `timeout`.
///
/// A probe that returns an error aborts the wait immediately: the backend
/// noticed its container or child process die, and more probing cannot help.
/// Expiry of the total deadline yields a [`RexError::Timeout`] the caller
/// uses to trigger `stop()` and surface captured logs.
pub async fn wait_until_alive<D>(
    deployment: &D,
    timeout: Duration,
    per_probe_timeout: f64,
) -> Result<IsAliveResponse>
where
    D: Deployment + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let response = deployment.is_alive(Some(per_probe_timeout)).await?;
        if response.is_alive {
            return Ok(response);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RexError::Timeout(format!(
                "runtime did not answer /is_alive within {:.1}s (last: {})",
                timeout.as_secs_f64(),
                response.message
            )));
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

// ---------------------------------------------------------------------------
// Remote-only deployment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RemoteDeploymentConfig {
    pub host: String,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    pub timeout: f64,
}

impl Default for RemoteDeploymentConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1".to_string(),
            port: None,
            auth_token: None,
            timeout: 0.15,
        }
    }
}

/// A deployment that only wraps an already-running runtime.
///
/// Useful when the runtime was started by hand (say, a container kept around
/// for debugging) but the caller wants the uniform [`Deployment`] interface.
pub struct RemoteDeployment {
    config: RemoteDeploymentConfig,
    runtime: Mutex<Option<Arc<RemoteRuntime>>>,
    cleanup_id: std::sync::Mutex<Option<u64>>,
}

impl RemoteDeployment {
    pub fn new(config: RemoteDeploymentConfig) -> Arc<Self> {
        let deployment = Arc::new(Self {
            config,
            runtime: Mutex::new(None),
            cleanup_id: std::sync::Mutex::new(None),
        });
        let id = cleanup::register(deployment.clone());
        if let Ok(mut slot) = deployment.cleanup_id.lock() {
            *slot = Some(id);
        }
        deployment
    }
}

#[async_trait]
impl Deployment for RemoteDeployment {
    async fn start(&self) -> Result<()> {
        tracing::info!(host = %self.config.host, "connecting to remote runtime");
        let runtime = Arc::new(RemoteRuntime::new(RemoteRuntimeConfig {
            host: self.config.host.clone(),
            port: self.config.port,
            auth_token: self.config.auth_token.clone(),
            timeout: self.config.timeout,
        }));
        *self.runtime.lock().await = Some(runtime);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(runtime) = self.runtime.lock().await.take() {
            use crate::runtime::Runtime;
            if let Err(e) = runtime.close().await {
                tracing::warn!(error = %e, "failed to close remote runtime");
            }
        }
        let id = self.cleanup_id.lock().ok().and_then(|mut slot| slot.take());
        if let Some(id) = id {
            cleanup::deregister(id);
        }
        Ok(())
    }

    async fn is_alive(&self, timeout: Option<f64>) -> Result<IsAliveResponse> {
        let runtime = self.runtime().await?;
        use crate::runtime::Runtime;
        runtime.is_alive(timeout).await
    }

    async fn runtime(&self) -> Result<Arc<RemoteRuntime>> {
        self.runtime
            .lock()
            .await
            .clone()
            .ok_or(RexError::DeploymentNotStarted)
    }
}
