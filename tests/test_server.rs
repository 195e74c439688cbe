//! Full HTTP loop: the axum server from `swerex::server` on an ephemeral
//! port, driven through the typed `RemoteRuntime` client. Covers auth
//! rejection, error transfer (511) reconstruction, and multipart uploads.

use swerex::error::RexError;
use swerex::models::{
    Action, CloseSessionRequest, Command, CommandSpec, CreateSessionRequest, ReadFileRequest,
    UploadRequest, WriteFileRequest,
};
use swerex::remote::{RemoteRuntime, RemoteRuntimeConfig};
use swerex::runtime::Runtime;
use swerex::server::{AppState, build_router};

async fn start_server(auth_token: Option<&str>) -> u16 {
    let state = AppState::new(auth_token.map(str::to_string));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn client(port: u16, auth_token: Option<&str>) -> RemoteRuntime {
    RemoteRuntime::new(RemoteRuntimeConfig {
        host: "http://127.0.0.1".to_string(),
        port: Some(port),
        auth_token: auth_token.map(str::to_string),
        timeout: 1.0,
    })
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_server_alive() {
    let port = start_server(None).await;
    let runtime = client(port, None);
    let r = runtime.is_alive(None).await.unwrap();
    assert!(r.is_alive);
}

#[tokio::test]
async fn test_server_dead_is_a_negative_answer() {
    // Nothing listens here; must yield is_alive=false, not an error.
    let unused = swerex::docker::find_free_port().unwrap();
    let runtime = client(unused, None);
    let r = runtime.is_alive(None).await.unwrap();
    assert!(!r.is_alive);
    assert!(!r.message.is_empty());
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_auth_token_round_trip() {
    let port = start_server(Some("sekrit")).await;

    let authed = client(port, Some("sekrit"));
    assert!(authed.is_alive(None).await.unwrap().is_alive);

    let anonymous = client(port, None);
    let r = anonymous.is_alive(None).await.unwrap();
    assert!(!r.is_alive, "missing token must be rejected");

    let err = anonymous
        .execute(Command {
            command: CommandSpec::Shell("echo hi".to_string()),
            shell: true,
            timeout: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RexError::Transport(_)), "got: {err:?}");

    let wrong = client(port, Some("not-the-token"));
    assert!(!wrong.is_alive(None).await.unwrap().is_alive);
}

// ---------------------------------------------------------------------------
// Sessions over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_round_trip_over_http() {
    let port = start_server(None).await;
    let runtime = client(port, None);

    let r = runtime
        .create_session(CreateSessionRequest::default())
        .await
        .unwrap();
    assert!(r.success, "{}", r.failure_reason);

    let r = runtime
        .run_in_session(Action::new("echo 'hello world'"))
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0), "raw: {:?}", r.exit_code_raw);
    assert!(r.output.contains("hello world"));

    let r = runtime
        .close_session(CloseSessionRequest::default())
        .await
        .unwrap();
    assert!(r.success);

    let r = runtime
        .close_session(CloseSessionRequest::default())
        .await
        .unwrap();
    assert!(!r.success);
    assert!(r.failure_reason.contains("does not exist"));
}

#[tokio::test]
async fn test_execute_over_http() {
    let port = start_server(None).await;
    let runtime = client(port, None);
    let r = runtime
        .execute(Command {
            command: CommandSpec::Shell("echo 'hello world'".to_string()),
            shell: true,
            timeout: None,
        })
        .await
        .unwrap();
    assert_eq!(r.exit_code, 0);
    assert_eq!(r.stdout, "hello world\n");
}

// ---------------------------------------------------------------------------
// Files over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_file_round_trip_over_http() {
    let port = start_server(None).await;
    let runtime = client(port, None);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.txt").to_string_lossy().into_owned();

    let w = runtime
        .write_file(WriteFileRequest {
            path: path.clone(),
            content: "test".to_string(),
        })
        .await
        .unwrap();
    assert!(w.success);

    let r = runtime.read_file(ReadFileRequest { path }).await.unwrap();
    assert!(r.success);
    assert_eq!(r.content, "test");
}

#[tokio::test]
async fn test_runtime_error_is_transferred_as_511() {
    let port = start_server(None).await;
    let runtime = client(port, None);

    // A regular file as a path component makes create_dir_all fail, which
    // write_file raises rather than folds into the envelope.
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "file, not a directory").unwrap();
    let path = blocker.join("sub").join("x.txt").to_string_lossy().into_owned();

    let err = runtime
        .write_file(WriteFileRequest {
            path,
            content: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert!(
        matches!(err, RexError::Remote { .. }),
        "expected reconstructed remote error, got: {err:?}"
    );
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_upload_file_over_http() {
    let port = start_server(None).await;
    let runtime = client(port, None);
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.txt");
    std::fs::write(&source, "test").unwrap();
    let target = dir.path().join("uploaded").join("target.txt");

    let r = runtime
        .upload(UploadRequest {
            source_path: source.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
    assert!(r.success);

    let read = runtime
        .read_file(ReadFileRequest {
            path: target.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
    assert_eq!(read.content, "test");
}

#[tokio::test]
async fn test_upload_directory_over_http() {
    let port = start_server(None).await;
    let runtime = client(port, None);
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source_dir");
    std::fs::create_dir_all(source.join("sub")).unwrap();
    std::fs::write(source.join("file1.txt"), "test1").unwrap();
    std::fs::write(source.join("sub").join("file2.txt"), "test2").unwrap();
    let target = dir.path().join("target_dir");

    let r = runtime
        .upload(UploadRequest {
            source_path: source.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
    assert!(r.success);

    for (relative, expected) in [("file1.txt", "test1"), ("sub/file2.txt", "test2")] {
        let read = runtime
            .read_file(ReadFileRequest {
                path: target.join(relative).to_string_lossy().into_owned(),
            })
            .await
            .unwrap();
        assert!(read.success, "missing {relative}: {}", read.failure_reason);
        assert_eq!(read.content, expected, "content mismatch for {relative}");
    }

    // Uploading again yields the same per-file content.
    let r = runtime
        .upload(UploadRequest {
            source_path: source.to_string_lossy().into_owned(),
            target_path: target.to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
    assert!(r.success);
    let read = runtime
        .read_file(ReadFileRequest {
            path: target.join("file1.txt").to_string_lossy().into_owned(),
        })
        .await
        .unwrap();
    assert_eq!(read.content, "test1");
}
