//! HTTP client for a runtime served by `swerex-remote`.
//!
//! A thin transport shim: each operation serializes its request body, POSTs
//! to the matching endpoint, and rebuilds the typed response. Errors thrown
//! inside the remote runtime travel back as HTTP 511 bodies and are
//! reconstructed into the matching [`RexError`] kind; every other non-2xx is
//! a transport error. `is_alive` is the exception: connection failures there
//! are a *negative answer*, not an error, so the deployment probe loop can
//! keep retrying.

use crate::error::{ExceptionEnvelope, Result, RexError};
use crate::models::{
    Action, CloseResponse, CloseSessionRequest, CloseSessionResponse, Command, CommandResponse,
    CreateSessionRequest, CreateSessionResponse, IsAliveResponse, Observation, ReadFileRequest,
    ReadFileResponse, UploadRequest, UploadResponse, WriteFileRequest, WriteFileResponse,
};
use crate::runtime::Runtime;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;

/// Header carrying the per-deployment auth token.
pub const AUTH_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone)]
pub struct RemoteRuntimeConfig {
    pub host: String,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    /// Default per-request timeout for liveness probes, in seconds.
    pub timeout: f64,
}

impl Default for RemoteRuntimeConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1".to_string(),
            port: None,
            auth_token: None,
            timeout: 0.15,
        }
    }
}

pub struct RemoteRuntime {
    config: RemoteRuntimeConfig,
    client: reqwest::Client,
}

impl RemoteRuntime {
    pub fn new(mut config: RemoteRuntimeConfig) -> Self {
        if !config.host.starts_with("http") {
            tracing::warn!(host = %config.host, "host does not start with http, adding http://");
            config.host = format!("http://{}", config.host);
        }
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self) -> String {
        match self.config.port {
            Some(port) => format!("{}:{}", self.config.host, port),
            None => self.config.host.clone(),
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => builder.header(AUTH_HEADER, token),
            None => builder,
        }
    }

    /// Raise errors found in the response; 511 bodies are rebuilt into typed
    /// errors, other non-2xx become transport errors.
    async fn handle_response_errors(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.as_u16() == 511 {
            let envelope: ExceptionEnvelope = response.json().await.map_err(|e| {
                RexError::Transport(format!("could not parse error transfer body: {e}"))
            })?;
            return Err(RexError::from_transfer(envelope.swerexception));
        }
        if !status.is_success() {
            let url = response.url().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(RexError::Transport(format!(
                "status {status} from {url}: {body}"
            )));
        }
        Ok(response)
    }

    async fn request<Req, Resp>(&self, endpoint: &str, body: Option<&Req>) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut builder = self.client.post(format!("{}/{endpoint}", self.api_url()));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = self
            .with_auth(builder)
            .send()
            .await
            .map_err(|e| RexError::Transport(format!("request to /{endpoint} failed: {e}")))?;
        let response = Self::handle_response_errors(response).await?;
        response
            .json()
            .await
            .map_err(|e| RexError::Transport(format!("invalid response from /{endpoint}: {e}")))
    }
}

#[async_trait]
impl Runtime for RemoteRuntime {
    /// Internal runtime errors are raised; everything else, including a
    /// server that is simply not up yet, yields `is_alive: false` with the
    /// reason in `message`.
    async fn is_alive(&self, timeout: Option<f64>) -> Result<IsAliveResponse> {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let builder = self
            .client
            .get(format!("{}/is_alive", self.api_url()))
            .timeout(Duration::from_secs_f64(timeout));
        let response = match self.with_auth(builder).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(IsAliveResponse {
                    is_alive: false,
                    message: format!("failed to connect to {}: {e}", self.config.host),
                });
            }
        };
        let status = response.status();
        if status.as_u16() == 511 {
            let envelope: ExceptionEnvelope = response.json().await.map_err(|e| {
                RexError::Transport(format!("could not parse error transfer body: {e}"))
            })?;
            return Err(RexError::from_transfer(envelope.swerexception));
        }
        if status.is_success() {
            return response.json().await.map_err(|e| {
                RexError::Transport(format!("invalid response from /is_alive: {e}"))
            });
        }
        let body = response.text().await.unwrap_or_default();
        Ok(IsAliveResponse {
            is_alive: false,
            message: format!(
                "status code {status} from {}/is_alive: {body}",
                self.api_url()
            ),
        })
    }

    async fn create_session(&self, request: CreateSessionRequest) -> Result<CreateSessionResponse> {
        self.request("create_session", Some(&request)).await
    }

    async fn run_in_session(&self, action: Action) -> Result<Observation> {
        self.request("run_in_session", Some(&action)).await
    }

    async fn close_session(&self, request: CloseSessionRequest) -> Result<CloseSessionResponse> {
        self.request("close_session", Some(&request)).await
    }

    async fn execute(&self, command: Command) -> Result<CommandResponse> {
        self.request("execute", Some(&command)).await
    }

    async fn read_file(&self, request: ReadFileRequest) -> Result<ReadFileResponse> {
        self.request("read_file", Some(&request)).await
    }

    async fn write_file(&self, request: WriteFileRequest) -> Result<WriteFileResponse> {
        self.request("write_file", Some(&request)).await
    }

    /// Files POST as-is; directories are zipped to a temp file first and
    /// extracted server-side (`unzip=true`).
    async fn upload(&self, request: UploadRequest) -> Result<UploadResponse> {
        let source = Path::new(&request.source_path).to_path_buf();
        let (bytes, file_name, unzip) = if source.is_dir() {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());
            let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
                let staging = tempfile::tempdir()?;
                let zip_path = staging.path().join("upload.zip");
                zip_directory(&source, &zip_path)?;
                std::fs::read(&zip_path)
            })
            .await
            .map_err(std::io::Error::other)??;
            (bytes, format!("{name}.zip"), "true")
        } else {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            (tokio::fs::read(&source).await?, name, "false")
        };

        let form = reqwest::multipart::Form::new()
            .text("target_path", request.target_path.clone())
            .text("unzip", unzip)
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
        let builder = self
            .client
            .post(format!("{}/upload", self.api_url()))
            .multipart(form);
        let response = self
            .with_auth(builder)
            .send()
            .await
            .map_err(|e| RexError::Transport(format!("request to /upload failed: {e}")))?;
        let response = Self::handle_response_errors(response).await?;
        response
            .json()
            .await
            .map_err(|e| RexError::Transport(format!("invalid response from /upload: {e}")))
    }

    async fn close(&self) -> Result<CloseResponse> {
        self.request::<(), CloseResponse>("close", None).await
    }
}

/// Zip `source` (a directory) into `destination`, preserving relative paths.
fn zip_directory(source: &Path, destination: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(destination)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy();
        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(std::io::Error::other)?;
        } else {
            writer
                .start_file(name, options)
                .map_err(std::io::Error::other)?;
            let mut reader = std::fs::File::open(entry.path())?;
            std::io::copy(&mut reader, &mut writer)?;
        }
    }
    writer.finish().map_err(std::io::Error::other)?;
    Ok(())
}
