//! Tests for PTY-backed sessions: exit-code fidelity, multi-command joining,
//! heredocs, timeouts, isolation, and interactive sub-REPLs. These drive a
//! real bash through the full registry path.

use swerex::models::{Action, CloseSessionRequest, CreateSessionRequest};
use swerex::runtime::{LocalRuntime, Runtime};

async fn runtime_with_session(name: &str) -> LocalRuntime {
    let runtime = LocalRuntime::new();
    let response = runtime
        .create_session(CreateSessionRequest {
            session: name.to_string(),
        })
        .await
        .unwrap();
    assert!(response.success, "session start failed: {}", response.failure_reason);
    runtime
}

fn action(session: &str, command: &str) -> Action {
    Action {
        session: session.to_string(),
        ..Action::new(command)
    }
}

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Exit-code fidelity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exit_codes() {
    let runtime = runtime_with_session("codes").await;

    let r = runtime.run_in_session(action("codes", "echo 'hello world'")).await.unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0), "raw: {:?}", r.exit_code_raw);

    let r = runtime.run_in_session(action("codes", "doesntexit")).await.unwrap();
    assert_eq!(r.exit_code(), Some(127), "raw: {:?}", r.exit_code_raw);

    let r = runtime.run_in_session(action("codes", "false && true")).await.unwrap();
    assert_eq!(r.exit_code(), Some(1));

    let r = runtime.run_in_session(action("codes", "false || true")).await.unwrap();
    assert_eq!(r.exit_code(), Some(0));

    let r = runtime.run_in_session(action("codes", "(exit 42)")).await.unwrap();
    assert_eq!(r.exit_code(), Some(42));
}

// ---------------------------------------------------------------------------
// Output capture
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_multiple_commands_with_linebreaks() {
    let runtime = runtime_with_session("multi").await;
    let r = runtime
        .run_in_session(action("multi", "\n\n\n echo 'test1' \n  \n \n echo 'test2' \n\n\n"))
        .await
        .unwrap();
    assert!(r.success());
    assert_eq!(r.exit_code(), Some(0));
    assert_eq!(r.output.lines().collect::<Vec<_>>(), vec!["test1", "test2"]);
}

#[tokio::test]
async fn test_multiple_commands_on_one_line() {
    let runtime = runtime_with_session("oneline").await;
    let r = runtime
        .run_in_session(action("oneline", "echo 'hello world'; echo 'hello again'"))
        .await
        .unwrap();
    assert_eq!(r.exit_code(), Some(0));
    assert_eq!(
        r.output.lines().collect::<Vec<_>>(),
        vec!["hello world", "hello again"]
    );
}

#[tokio::test]
async fn test_for_loop_over_lines() {
    let runtime = runtime_with_session("loop").await;
    let r = runtime
        .run_in_session(action("loop", "for i in {1..3};\n do echo 'hello world';\n done"))
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0), "raw: {:?}", r.exit_code_raw);
    assert_eq!(
        r.output.lines().collect::<Vec<_>>(),
        vec!["hello world"; 3]
    );
}

#[tokio::test]
async fn test_heredoc_runs_as_one_command() {
    if !python3_available() {
        return;
    }
    let runtime = runtime_with_session("heredoc").await;
    let command = "python3 <<EOF\nprint('hello world')\nprint('hello world 2')\nEOF";
    let r = runtime.run_in_session(action("heredoc", command)).await.unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0), "raw: {:?}", r.exit_code_raw);
    assert!(r.output.contains("hello world"), "output: {:?}", r.output);
    assert!(r.output.contains("hello world 2"), "output: {:?}", r.output);
}

#[tokio::test]
async fn test_comment_only_command() {
    let runtime = runtime_with_session("comment").await;
    let r = runtime
        .run_in_session(action("comment", "# echo 'hello world'"))
        .await
        .unwrap();
    assert!(r.success());
    assert_eq!(r.exit_code(), Some(0));
    assert_eq!(r.output, "");
}

#[tokio::test]
async fn test_empty_commands() {
    let runtime = runtime_with_session("empty").await;
    for command in ["", "\n", "\n\n \n"] {
        let r = runtime.run_in_session(action("empty", command)).await.unwrap();
        assert!(r.success(), "command {command:?}: {}", r.failure_reason);
        assert_eq!(r.exit_code(), Some(0), "command {command:?}");
    }
}

#[tokio::test]
async fn test_backgrounded_subshell_returns_immediately() {
    let runtime = runtime_with_session("bg").await;
    let r = runtime
        .run_in_session(Action {
            timeout: Some(5.0),
            ..action("bg", "(sleep 10) &")
        })
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0));
}

#[tokio::test]
async fn test_double_bracket_comparison() {
    let runtime = runtime_with_session("brackets").await;
    let r = runtime
        .run_in_session(action("brackets", "[[ $env == $env ]]"))
        .await
        .unwrap();
    assert!(r.success());
    assert_eq!(r.exit_code(), Some(0));
}

#[tokio::test]
async fn test_array_assignment_between_commands() {
    let runtime = runtime_with_session("arrays").await;
    let r = runtime
        .run_in_session(action("arrays", "echo 'hw';A=();echo 'asdf'"))
        .await
        .unwrap();
    assert!(r.success());
    assert_eq!(r.exit_code(), Some(0));
    assert!(r.output.contains("hw"));
    assert!(r.output.contains("asdf"));
}

// ---------------------------------------------------------------------------
// State persistence and isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_state_persists_within_a_session() {
    let runtime = runtime_with_session("state").await;
    runtime.run_in_session(action("state", "cd /tmp")).await.unwrap();
    runtime
        .run_in_session(action("state", "export MARKER=persistent_value"))
        .await
        .unwrap();

    let r = runtime.run_in_session(action("state", "pwd")).await.unwrap();
    assert!(r.output.contains("/tmp"), "cwd should persist, got {:?}", r.output);

    let r = runtime.run_in_session(action("state", "echo $MARKER")).await.unwrap();
    assert!(
        r.output.contains("persistent_value"),
        "env should persist, got {:?}",
        r.output
    );
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let runtime = LocalRuntime::new();
    for name in ["shell1", "shell2"] {
        let r = runtime
            .create_session(CreateSessionRequest {
                session: name.to_string(),
            })
            .await
            .unwrap();
        assert!(r.success);
    }

    runtime.run_in_session(action("shell1", "x=42")).await.unwrap();
    runtime.run_in_session(action("shell2", "y=24")).await.unwrap();

    let r1 = runtime.run_in_session(action("shell1", "echo $x")).await.unwrap();
    let r2 = runtime.run_in_session(action("shell2", "echo $y")).await.unwrap();
    assert_eq!(r1.output.trim(), "42");
    assert_eq!(r2.output.trim(), "24");

    let r3 = runtime.run_in_session(action("shell1", "echo $y")).await.unwrap();
    let r4 = runtime.run_in_session(action("shell2", "echo $x")).await.unwrap();
    assert_eq!(r3.output.trim(), "");
    assert_eq!(r4.output.trim(), "");
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_command_timeout_returns_structured_failure() {
    let runtime = runtime_with_session("timeout").await;
    let r = runtime
        .run_in_session(Action {
            timeout: Some(0.1),
            ..action("timeout", "sleep 3")
        })
        .await
        .unwrap();
    assert!(!r.success());
    assert_eq!(r.exit_code_raw, "-100");
    assert_eq!(r.output, "");
    assert!(r.failure_reason.contains("timeout"), "{}", r.failure_reason);
    assert_eq!(r.expect_string, "");

    // The session must stay usable: the next command completes once the
    // stuck one drains.
    let r = runtime
        .run_in_session(action("timeout", "echo 'still here'"))
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
}

// ---------------------------------------------------------------------------
// Interactive sub-REPLs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_interactive_python_round_trip() {
    if !python3_available() {
        return;
    }
    let runtime = runtime_with_session("repl").await;

    // Force the plain REPL on newer pythons so the prompt stays `>>> `.
    let r = runtime
        .run_in_session(action("repl", "export PYTHON_BASIC_REPL=1"))
        .await
        .unwrap();
    assert!(r.success());

    let r = runtime
        .run_in_session(Action {
            is_interactive_command: true,
            expect: vec![">>> ".to_string()],
            timeout: Some(10.0),
            ..action("repl", "python3")
        })
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.expect_string, ">>> ");

    let r = runtime
        .run_in_session(Action {
            is_interactive_command: true,
            expect: vec![">>> ".to_string()],
            timeout: Some(5.0),
            ..action("repl", "print('hello world')")
        })
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert!(r.output.contains("hello world"), "output: {:?}", r.output);

    let r = runtime
        .run_in_session(Action {
            is_interactive_quit: true,
            timeout: Some(5.0),
            ..action("repl", "quit()\n")
        })
        .await
        .unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0));

    // Back in bash: plain commands work again and echo $? lines up.
    let r = runtime.run_in_session(action("repl", "echo done")).await.unwrap();
    assert!(r.success(), "{}", r.failure_reason);
    assert_eq!(r.exit_code(), Some(0), "raw: {:?}", r.exit_code_raw);
    assert!(r.output.contains("done"), "output: {:?}", r.output);
}

#[tokio::test]
async fn test_interactive_expect_timeout() {
    if !python3_available() {
        return;
    }
    let runtime = runtime_with_session("repl-timeout").await;
    let r = runtime
        .run_in_session(Action {
            is_interactive_command: true,
            expect: vec!["WONTHITTHIS".to_string()],
            timeout: Some(0.5),
            ..action("repl-timeout", "python3")
        })
        .await
        .unwrap();
    assert!(!r.success());
    assert!(r.failure_reason.contains("timeout"), "{}", r.failure_reason);
}

#[tokio::test]
async fn test_exclusive_interactive_flags_rejected() {
    let runtime = runtime_with_session("flags").await;
    let r = runtime
        .run_in_session(Action {
            is_interactive_command: true,
            is_interactive_quit: true,
            ..action("flags", "true")
        })
        .await
        .unwrap();
    assert!(!r.success());
    assert!(r.failure_reason.contains("mutually exclusive"));
}

// ---------------------------------------------------------------------------
// Lifecycle envelopes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unknown_session_is_structured() {
    let runtime = LocalRuntime::new();
    let r = runtime
        .run_in_session(action("non_existent", "echo 'hello world'"))
        .await
        .unwrap();
    assert!(!r.success());
    assert_eq!(r.exit_code_raw, "-312");
    assert!(r.failure_reason.contains("does not exist"));
}

#[tokio::test]
async fn test_duplicate_create_is_structured() {
    let runtime = runtime_with_session("dup").await;
    let r = runtime
        .create_session(CreateSessionRequest {
            session: "dup".to_string(),
        })
        .await
        .unwrap();
    assert!(!r.success);
    assert!(r.failure_reason.contains("already exists"));
}

#[tokio::test]
async fn test_close_twice_is_structured() {
    let runtime = runtime_with_session("closing").await;
    let r = runtime
        .close_session(CloseSessionRequest {
            session: "closing".to_string(),
        })
        .await
        .unwrap();
    assert!(r.success);

    let r = runtime
        .close_session(CloseSessionRequest {
            session: "closing".to_string(),
        })
        .await
        .unwrap();
    assert!(!r.success);
    assert!(r.failure_reason.contains("does not exist"));

    // And the session key is gone for actions too.
    let r = runtime.run_in_session(action("closing", "echo hi")).await.unwrap();
    assert_eq!(r.exit_code_raw, "-312");
}
