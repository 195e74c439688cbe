//! Container-backed deployment using Docker or Podman.
//!
//! Materialization order: acquire the image (pull policy), optionally build a
//! derived image baking in a self-contained runtime, gate on the image
//! architecture, start the container with the serving port forwarded, inject
//! the per-arch `swerex-remote` binary, exec it with a fresh auth token, and
//! probe until it answers. The exec child's stdout/stderr are captured so
//! startup failures can surface what actually happened inside the container.

use crate::cleanup;
use crate::deployment::{Deployment, DeploymentState, wait_until_alive};
use crate::error::{Result, RexError};
use crate::models::IsAliveResponse;
use crate::remote::{RemoteRuntime, RemoteRuntimeConfig};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Name of the runtime server binary, as released per architecture
/// (`swerex-remote-amd64`, `swerex-remote-arm64`).
pub const REMOTE_EXECUTABLE_NAME: &str = "swerex-remote";

const DEFAULT_EXECUTABLE_URL_BASE: &str =
    "https://github.com/SWE-agent/SWE-ReX/releases/latest/download";

/// Per-probe timeout used while waiting for the runtime to come up, seconds.
const RUNTIME_PROBE_TIMEOUT: f64 = 0.15;

/// Whether to pull the image before starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Never,
    /// Pull only if `inspect` says the image is not available locally.
    Missing,
    Always,
}

#[derive(Debug, Clone)]
pub struct DockerDeploymentConfig {
    /// Image to deploy into.
    pub image: String,
    /// Host port to forward to the runtime; picked automatically if `None`.
    pub port: Option<u16>,
    /// Extra arguments passed verbatim to `docker run`.
    pub docker_args: Vec<String>,
    /// Total seconds to wait for the runtime to answer liveness probes.
    pub startup_timeout: f64,
    pub pull: PullPolicy,
    /// Pass `--rm` so the container disappears once killed.
    pub remove_container: bool,
    /// Remove the image again on stop.
    pub remove_images: bool,
    /// `docker` or `podman`.
    pub container_runtime: String,
    /// Platform string forwarded to pull/build/run (e.g. `linux/amd64`).
    pub platform: Option<String>,
    /// When set, build a derived image that bakes the runtime binary into
    /// this directory and links it onto PATH, instead of injecting it into
    /// the running container.
    pub standalone_dir: Option<String>,
    /// Where the per-arch server binary is downloaded from.
    pub executable_url_base: String,
    /// Where the injected binary lands inside the container.
    pub remote_executable_path: String,
}

impl Default for DockerDeploymentConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11".to_string(),
            port: None,
            docker_args: Vec::new(),
            startup_timeout: 180.0,
            pull: PullPolicy::Missing,
            remove_container: true,
            remove_images: false,
            container_runtime: "docker".to_string(),
            platform: None,
            standalone_dir: None,
            executable_url_base: DEFAULT_EXECUTABLE_URL_BASE.to_string(),
            remote_executable_path: format!("/{REMOTE_EXECUTABLE_NAME}"),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: DeploymentState,
    container_name: Option<String>,
    child: Option<tokio::process::Child>,
    runtime: Option<Arc<RemoteRuntime>>,
    port: Option<u16>,
    cleanup_id: Option<u64>,
}

pub struct DockerDeployment {
    config: DockerDeploymentConfig,
    inner: Mutex<Inner>,
    /// Captured stdout/stderr of the `docker exec` child running the server.
    output: Arc<Mutex<String>>,
}

impl DockerDeployment {
    pub fn new(config: DockerDeploymentConfig) -> Arc<Self> {
        let deployment = Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
            output: Arc::new(Mutex::new(String::new())),
        });
        let id = cleanup::register(deployment.clone());
        if let Ok(mut inner) = deployment.inner.try_lock() {
            inner.cleanup_id = Some(id);
        }
        deployment
    }

    pub fn config(&self) -> &DockerDeploymentConfig {
        &self.config
    }

    pub async fn container_name(&self) -> Option<String> {
        self.inner.lock().await.container_name.clone()
    }

    pub async fn state(&self) -> DeploymentState {
        self.inner.lock().await.state
    }

    async fn start_inner(&self) -> Result<()> {
        let t0 = Instant::now();
        let runtime_cmd = &self.config.container_runtime;

        let (image_id, arch) = if let Some(dir) = self.config.standalone_dir.clone() {
            // The pull is scheduled but deliberately not awaited: the build
            // reads the base image from the local cache, and fails with a
            // build error if it is absent.
            {
                let runtime_cmd = runtime_cmd.clone();
                let image = self.config.image.clone();
                let pull = self.config.pull;
                tokio::spawn(async move {
                    if let Err(e) = pull_image(&runtime_cmd, &image, pull).await {
                        tracing::warn!(error = %e, "background image pull failed");
                    }
                });
            }
            let arch = self.inspect_architecture(&self.config.image).await?;
            check_architecture(&arch)?;
            let image_id = self.build_image(&dir, &arch).await?;
            (image_id, arch)
        } else {
            pull_image(runtime_cmd, &self.config.image, self.config.pull).await?;
            let arch = self.inspect_architecture(&self.config.image).await?;
            check_architecture(&arch)?;
            (self.config.image.clone(), arch)
        };

        let port = match self.config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let container_name = container_name_for(&self.config.image);
        let token = Uuid::new_v4().to_string();
        {
            let mut inner = self.inner.lock().await;
            inner.state = DeploymentState::Starting;
            inner.container_name = Some(container_name.clone());
            inner.port = Some(port);
        }

        let mut run = tokio::process::Command::new(runtime_cmd);
        run.arg("run");
        if self.config.remove_container {
            run.arg("--rm");
        }
        run.args(["-p", &format!("{port}:8000")]);
        if let Some(platform) = &self.config.platform {
            run.args(["--platform", platform]);
        }
        run.args(&self.config.docker_args);
        run.args(["--name", &container_name, "-itd", &image_id]);
        tracing::info!(
            container = %container_name,
            image = %self.config.image,
            port,
            "starting container"
        );
        check_output(run).await.map_err(|e| {
            RexError::DeploymentStartup(format!(
                "failed to start container {container_name}: {e}"
            ))
        })?;

        let exec_path = if self.config.standalone_dir.is_some() {
            format!("/usr/local/bin/{REMOTE_EXECUTABLE_NAME}")
        } else {
            let staging = tempfile::tempdir()?;
            let local_path = staging.path().join(REMOTE_EXECUTABLE_NAME);
            let url = format!(
                "{}/{}-{}",
                self.config.executable_url_base, REMOTE_EXECUTABLE_NAME, arch
            );
            download_executable(&url, &local_path).await?;
            self.copy_into_container(
                &container_name,
                &local_path,
                &self.config.remote_executable_path,
            )
            .await?;
            self.config.remote_executable_path.clone()
        };

        // /bin/sh -c so the `&&` is interpreted inside the container, not by
        // the parent shell.
        let start_cmd =
            format!("chmod +x {exec_path} && {exec_path} --port 8000 --auth-token {token}");
        let mut exec = tokio::process::Command::new(runtime_cmd);
        exec.args(["exec", &container_name, "/bin/sh", "-c", &start_cmd]);
        exec.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        tracing::info!(container = %container_name, "executing runtime server in container");
        let mut child = exec.spawn()?;
        self.capture_output(&mut child);

        let runtime = Arc::new(RemoteRuntime::new(RemoteRuntimeConfig {
            host: "http://127.0.0.1".to_string(),
            port: Some(port),
            auth_token: Some(token),
            timeout: RUNTIME_PROBE_TIMEOUT,
        }));
        {
            let mut inner = self.inner.lock().await;
            inner.child = Some(child);
            inner.runtime = Some(runtime);
        }

        let startup_timeout = Duration::from_secs_f64(self.config.startup_timeout);
        match wait_until_alive(self, startup_timeout, RUNTIME_PROBE_TIMEOUT).await {
            Ok(_) => {
                tracing::info!(
                    container = %container_name,
                    "runtime started in {:.2}s",
                    t0.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                let output = self.output.lock().await.clone();
                tracing::error!(
                    container = %container_name,
                    "runtime did not start; container output follows\n{output}"
                );
                if let Err(stop_error) = self.stop().await {
                    tracing::warn!(error = %stop_error, "cleanup after failed start also failed");
                }
                match e {
                    RexError::Timeout(message) => Err(RexError::DeploymentStartup(format!(
                        "{message}\ncontainer output:\n{output}"
                    ))),
                    other => Err(other),
                }
            }
        }
    }

    /// Read the exec child's output in the background so it is available
    /// when startup goes wrong.
    fn capture_output(&self, child: &mut tokio::process::Child) {
        if let Some(stdout) = child.stdout.take() {
            let buffer = self.output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buffer = buffer.lock().await;
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let buffer = self.output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buffer = buffer.lock().await;
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
            });
        }
    }

    async fn inspect_architecture(&self, image: &str) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.config.container_runtime);
        cmd.args(["inspect", "--format", "{{.Architecture}}", image]);
        let output = check_output(cmd).await.map_err(|e| {
            RexError::DeploymentStartup(format!("failed to inspect image {image}: {e}"))
        })?;
        Ok(output.trim().trim_matches('\'').to_string())
    }

    /// Build a derived image that bakes the runtime binary into
    /// `standalone_dir` and links it onto PATH. Returns the image ID.
    async fn build_image(&self, standalone_dir: &str, arch: &str) -> Result<String> {
        tracing::info!(
            image = %self.config.image,
            dir = %standalone_dir,
            "building derived image with a self-contained runtime (one-time per base image)"
        );
        let dockerfile = self.standalone_dockerfile(standalone_dir, arch);
        let mut cmd = tokio::process::Command::new(&self.config.container_runtime);
        cmd.arg("build").arg("-q");
        if let Some(platform) = &self.config.platform {
            cmd.args(["--platform", platform]);
        }
        cmd.args([
            "--build-arg",
            &format!("BASE_IMAGE={}", self.config.image),
            "-",
        ]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RexError::DeploymentStartup(format!(
                "image build failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let image_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !image_id.starts_with("sha256:") {
            return Err(RexError::DeploymentStartup(format!(
                "image build produced an unexpected id: {image_id}"
            )));
        }
        Ok(image_id)
    }

    fn standalone_dockerfile(&self, standalone_dir: &str, arch: &str) -> String {
        let platform_arg = self
            .config
            .platform
            .as_deref()
            .map(|platform| format!("--platform={platform} "))
            .unwrap_or_default();
        format!(
            "ARG BASE_IMAGE\n\n\
             FROM {platform_arg}$BASE_IMAGE\n\
             ADD {base}/{name}-{arch} {dir}/{name}\n\
             RUN chmod +x {dir}/{name} && ln -s {dir}/{name} /usr/local/bin/{name}\n\
             RUN {name} --version\n",
            base = self.config.executable_url_base,
            name = REMOTE_EXECUTABLE_NAME,
            dir = standalone_dir.trim_end_matches('/'),
        )
    }

    /// `docker cp` a file into the container and chown it to the container's
    /// default uid/gid so the runtime can chmod it.
    async fn copy_into_container(
        &self,
        container_name: &str,
        source: &std::path::Path,
        destination: &str,
    ) -> Result<()> {
        let runtime_cmd = &self.config.container_runtime;
        let mut cp = tokio::process::Command::new(runtime_cmd);
        cp.arg("cp")
            .arg(source)
            .arg(format!("{container_name}:{destination}"));
        check_output(cp).await.map_err(|e| {
            RexError::DeploymentStartup(format!("failed to copy executable into container: {e}"))
        })?;

        let mut uid_cmd = tokio::process::Command::new(runtime_cmd);
        uid_cmd.args(["exec", container_name, "id", "-u"]);
        let uid = check_output(uid_cmd)
            .await
            .map_err(RexError::DeploymentStartup)?;
        let mut gid_cmd = tokio::process::Command::new(runtime_cmd);
        gid_cmd.args(["exec", container_name, "id", "-g"]);
        let gid = check_output(gid_cmd)
            .await
            .map_err(RexError::DeploymentStartup)?;

        let mut chown = tokio::process::Command::new(runtime_cmd);
        chown.args([
            "exec",
            container_name,
            "chown",
            "-R",
            &format!("{}:{}", uid.trim(), gid.trim()),
            destination,
        ]);
        check_output(chown).await.map_err(|e| {
            RexError::DeploymentStartup(format!("failed to chown executable in container: {e}"))
        })?;
        Ok(())
    }
}

#[async_trait]
impl Deployment for DockerDeployment {
    async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                DeploymentState::Unstarted | DeploymentState::Stopped => {
                    inner.state = DeploymentState::Building;
                }
                state => {
                    return Err(RexError::DeploymentStartup(format!(
                        "cannot start deployment in state {state:?}"
                    )));
                }
            }
        }
        match self.start_inner().await {
            Ok(()) => {
                self.inner.lock().await.state = DeploymentState::Running;
                Ok(())
            }
            Err(e) => {
                self.inner.lock().await.state = DeploymentState::Stopped;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.inner.lock().await.state = DeploymentState::Stopping;

        // Close the client first so sessions shut down while the container
        // is still reachable.
        let runtime = self.inner.lock().await.runtime.take();
        if let Some(runtime) = runtime {
            use crate::runtime::Runtime;
            if let Err(e) = runtime.close().await {
                tracing::debug!(error = %e, "failed to close runtime client");
            }
        }

        let (container_name, child) = {
            let mut inner = self.inner.lock().await;
            (inner.container_name.take(), inner.child.take())
        };

        if let Some(name) = &container_name {
            let mut kill = tokio::process::Command::new(&self.config.container_runtime);
            kill.args(["kill", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match tokio::time::timeout(Duration::from_secs(10), kill.status()).await {
                Ok(Ok(status)) if status.success() => {
                    tracing::info!(container = %name, "killed container");
                }
                Ok(Ok(status)) => {
                    tracing::warn!(container = %name, code = ?status.code(), "failed to kill container, will try harder");
                }
                Ok(Err(e)) => {
                    tracing::warn!(container = %name, error = %e, "failed to kill container, will try harder");
                }
                Err(_) => {
                    tracing::warn!(container = %name, "timed out killing container, will try harder");
                }
            }
        }

        if let Some(mut child) = child {
            let mut killed = false;
            for _ in 0..3 {
                let _ = child.start_kill();
                if tokio::time::timeout(Duration::from_secs(5), child.wait())
                    .await
                    .is_ok()
                {
                    killed = true;
                    break;
                }
            }
            if !killed {
                tracing::warn!("failed to kill runtime child process with SIGKILL");
            }
        }

        if self.config.remove_images
            && image_available(&self.config.container_runtime, &self.config.image).await
        {
            tracing::info!(image = %self.config.image, "removing image");
            let mut rmi = tokio::process::Command::new(&self.config.container_runtime);
            rmi.args(["rmi", &self.config.image]);
            if let Err(e) = check_output(rmi).await {
                tracing::error!(image = %self.config.image, error = %e, "failed to remove image");
            }
        }

        let cleanup_id = {
            let mut inner = self.inner.lock().await;
            inner.state = DeploymentState::Stopped;
            inner.cleanup_id.take()
        };
        if let Some(id) = cleanup_id {
            cleanup::deregister(id);
        }
        Ok(())
    }

    async fn is_alive(&self, timeout: Option<f64>) -> Result<IsAliveResponse> {
        let runtime = {
            let mut inner = self.inner.lock().await;
            let Some(runtime) = inner.runtime.clone() else {
                return Err(RexError::DeploymentNotStarted);
            };
            let exited = match inner.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                None => {
                    return Err(RexError::DeploymentStartup(
                        "container process not started".to_string(),
                    ));
                }
            };
            if exited {
                drop(inner);
                let output = self.output.lock().await.clone();
                return Err(RexError::DeploymentStartup(format!(
                    "container process terminated.\n{output}"
                )));
            }
            runtime
        };
        use crate::runtime::Runtime;
        runtime.is_alive(timeout).await
    }

    async fn runtime(&self) -> Result<Arc<RemoteRuntime>> {
        self.inner
            .lock()
            .await
            .runtime
            .clone()
            .ok_or(RexError::DeploymentNotStarted)
    }
}

impl Drop for DockerDeployment {
    fn drop(&mut self) {
        // Best-effort synchronous teardown for non-signal exits; the signal
        // path goes through `cleanup::stop_all`.
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(name) = inner.container_name.take() {
                let _ = std::process::Command::new(&self.config.container_runtime)
                    .args(["kill", &name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
            if let Some(mut child) = inner.child.take() {
                let _ = child.start_kill();
            }
        }
    }
}

/// A unique container name derived from the image name.
pub fn container_name_for(image: &str) -> String {
    let sanitized: String = image
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "-_.".contains(*c))
        .collect();
    format!("{sanitized}-{}", Uuid::new_v4())
}

/// Ask the OS for an unused TCP port by binding to an ephemeral one.
pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn check_architecture(arch: &str) -> Result<()> {
    if arch == "amd64" || arch == "arm64" {
        return Ok(());
    }
    Err(RexError::DeploymentStartup(format!(
        "unsupported image architecture: {arch}"
    )))
}

async fn image_available(container_runtime: &str, image: &str) -> bool {
    let mut cmd = tokio::process::Command::new(container_runtime);
    cmd.args(["inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    matches!(cmd.status().await, Ok(status) if status.success())
}

async fn pull_image(container_runtime: &str, image: &str, policy: PullPolicy) -> Result<()> {
    match policy {
        PullPolicy::Never => return Ok(()),
        PullPolicy::Missing if image_available(container_runtime, image).await => return Ok(()),
        _ => {}
    }
    tracing::info!(image = %image, "pulling image");
    let mut cmd = tokio::process::Command::new(container_runtime);
    cmd.args(["pull", image]);
    check_output(cmd)
        .await
        .map(|_| ())
        .map_err(|e| RexError::ImagePull(format!("failed to pull image {image}: {e}")))
}

async fn download_executable(url: &str, destination: &std::path::Path) -> Result<()> {
    tracing::info!(url = %url, "downloading remote executable");
    let response = reqwest::get(url).await.map_err(|e| {
        RexError::DeploymentStartup(format!("failed to download remote executable: {e}"))
    })?;
    let response = response.error_for_status().map_err(|e| {
        RexError::DeploymentStartup(format!("failed to download remote executable: {e}"))
    })?;
    let bytes = response.bytes().await.map_err(|e| {
        RexError::DeploymentStartup(format!("failed to download remote executable: {e}"))
    })?;
    tokio::fs::write(destination, &bytes).await?;
    Ok(())
}

/// Run a command to completion, returning stdout on success and a message
/// with the exit code plus both streams on failure.
async fn check_output(mut cmd: tokio::process::Command) -> std::result::Result<String, String> {
    cmd.stdin(Stdio::null());
    match cmd.output().await {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => Err(format!(
            "exit code {:?}: {}{}",
            output.status.code(),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )),
        Err(e) => Err(e.to_string()),
    }
}
