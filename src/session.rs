//! Interactive shell sessions backed by a pseudo-terminal (PTY).
//!
//! Each session is a long-lived bash process attached to a real PTY, so child
//! processes see `isatty()=true` and interactive sub-REPLs (python, psql, ...)
//! work. Request/response semantics are imposed on the stream by installing an
//! unlikely string as PS1 and scraping output up to it: a command is done when
//! the prompt sentinel (or a caller-supplied expect string) appears, and the
//! exit code is recovered by sending `echo $?` and scraping once more. Echo is
//! disabled at the termios level before bash starts so the scraper only ever
//! sees output, never its own commands.

use crate::models::{
    Action, CreateSessionResponse, EXIT_CODE_CAPTURE_TIMEOUT, EXIT_CODE_NOT_INITIALIZED,
    EXIT_CODE_TIMEOUT, Observation,
};
use crate::splitter;
use nix::sys::termios::{self, LocalFlags, SetArg};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// The prompt sentinel installed as PS1. End-of-command detection searches the
/// PTY stream for this exact string.
pub const PS1_SENTINEL: &str = "SHELLPS1PREFIX";

/// Marker echoed right after spawn to detect a working shell.
const INIT_MARKER: &str = "fully_initialized";

/// Marker used to re-sync after scrubbing echo on interactive quit.
const ECHO_SCRUB_MARKER: &str = "doneremovingecho";

/// Expect timeout when no per-action timeout is given.
const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the startup handshake expects and the `$?` capture.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// One bash REPL under our control, addressable by a caller-supplied key.
///
/// `shell` is `None` before a successful [`start`](Session::start) and after
/// [`close`](Session::close); operations in that state return structured
/// failures instead of crashing.
pub struct Session {
    shell: Option<Shell>,
}

impl Session {
    pub fn new() -> Self {
        Self { shell: None }
    }

    /// Spawn bash and perform the startup handshake. Returns a structured
    /// failure (never an error) so the registry can pass it straight through.
    pub async fn start(&mut self) -> CreateSessionResponse {
        match Shell::spawn().await {
            Ok((shell, output)) => {
                self.shell = Some(shell);
                CreateSessionResponse {
                    success: true,
                    output,
                    failure_reason: String::new(),
                }
            }
            Err(failure_reason) => CreateSessionResponse {
                success: false,
                output: String::new(),
                failure_reason,
            },
        }
    }

    /// Run one action to completion. At most one action is in flight per
    /// session; the registry serializes callers.
    pub async fn run(&mut self, action: &Action) -> Observation {
        let Some(shell) = self.shell.as_mut() else {
            return Observation::failure(EXIT_CODE_NOT_INITIALIZED, "shell not initialized");
        };
        if action.is_interactive_command && action.is_interactive_quit {
            return Observation::failure(
                "",
                "is_interactive_command and is_interactive_quit are mutually exclusive",
            );
        }

        let plain = !action.is_interactive_command && !action.is_interactive_quit;
        // Rejoining the atoms into one line keeps bash from emitting one
        // prompt per command, which would corrupt exit-code recovery.
        let command = if plain {
            splitter::join_commands(&splitter::split_bash_command(&action.command, true, true))
        } else {
            action.command.clone()
        };

        if let Err(e) = shell.send_line(&command).await {
            return Observation::failure("", e);
        }

        let timeout = action
            .timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_ACTION_TIMEOUT);
        let mut patterns: Vec<&str> = action.expect.iter().map(String::as_str).collect();
        patterns.push(PS1_SENTINEL);
        let (output, matched) = match shell.expect(&patterns, timeout).await {
            Ok(found) => found,
            Err(ExpectError::Timeout) => {
                return Observation::failure(EXIT_CODE_TIMEOUT, "timeout while running command");
            }
            Err(ExpectError::Closed(reason)) => return Observation::failure("", reason),
        };
        let expect_string = patterns[matched].to_string();

        if plain {
            let exit_code_raw = match shell.capture_exit_code().await {
                Ok(raw) => raw,
                Err(_) => {
                    return Observation::failure(
                        EXIT_CODE_CAPTURE_TIMEOUT,
                        "timeout while getting exit code",
                    );
                }
            };
            Observation {
                output,
                exit_code_raw,
                expect_string,
                failure_reason: String::new(),
            }
        } else if action.is_interactive_quit {
            shell.scrub_echo().await;
            Observation {
                output,
                exit_code_raw: "0".to_string(),
                expect_string,
                failure_reason: String::new(),
            }
        } else {
            // Sub-REPLs suppress their own echo imperfectly (readline echoes
            // by hand); drop a single leading copy of the command.
            let trimmed = output.trim_start();
            let trimmed = trimmed
                .strip_prefix(action.command.as_str())
                .unwrap_or(trimmed);
            Observation {
                output: trimmed.trim().to_string(),
                exit_code_raw: "0".to_string(),
                expect_string,
                failure_reason: String::new(),
            }
        }
    }

    /// Terminate the PTY child. Idempotent; later operations on the session
    /// fail structurally.
    pub async fn close(&mut self) {
        let Some(mut shell) = self.shell.take() else {
            return;
        };
        let _ = shell.send_line("exit").await;

        // Drop the PTY handles before waiting: closing the master fd sends
        // SIGHUP to bash, which unblocks the wait below.
        let Shell {
            mut child,
            writer,
            reader,
            ..
        } = shell;
        drop(writer);
        drop(reader);

        if tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .is_err()
        {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// The live half of a [`Session`]: the bash child plus the PTY master split
/// into owned read/write halves, and the bytes read but not yet consumed by
/// an expect.
struct Shell {
    child: tokio::process::Child,
    writer: pty_process::OwnedWritePty,
    reader: pty_process::OwnedReadPty,
    master_fd: RawFd,
    buffer: Vec<u8>,
}

enum ExpectError {
    Timeout,
    Closed(String),
}

impl Shell {
    async fn spawn() -> Result<(Shell, String), String> {
        let (pty, pts) = pty_process::open().map_err(|e| format!("failed to open PTY: {e}"))?;

        // Wide terminal so long commands and output don't wrap.
        pty.resize(pty_process::Size::new(24, 250))
            .map_err(|e| format!("failed to resize PTY: {e}"))?;

        let master_fd = pty.as_raw_fd();
        // Readline honors the ECHO flag it finds at startup; clearing it here
        // keeps commands out of the scraped stream.
        set_echo(master_fd, false).map_err(|e| format!("failed to disable PTY echo: {e}"))?;

        let mut cmd = pty_process::Command::new("/bin/bash");
        let child = cmd
            .spawn(pts)
            .map_err(|e| format!("failed to spawn bash with PTY: {e}"))?;

        let (reader, writer) = pty.into_split();
        let mut shell = Shell {
            child,
            writer,
            reader,
            master_fd,
            buffer: Vec::new(),
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shell.send_line(&format!("echo '{INIT_MARKER}'")).await?;
        let banner = match shell.expect(&[INIT_MARKER], HANDSHAKE_TIMEOUT).await {
            Ok((before, _)) => before,
            Err(_) => return Err("timeout while initializing shell".to_string()),
        };

        shell
            .send_line(&format!(
                "umask 002; export PS1='{PS1_SENTINEL}'; export PS2=''"
            ))
            .await?;
        let rest = match shell.expect(&[PS1_SENTINEL], HANDSHAKE_TIMEOUT).await {
            Ok((before, _)) => before,
            Err(_) => return Err("timeout while setting PS1".to_string()),
        };

        Ok((shell, format!("{banner}\n---\n{rest}")))
    }

    async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("failed to write to PTY: {e}"))?;
        self.writer
            .write_all(b"\n")
            .await
            .map_err(|e| format!("failed to write to PTY: {e}"))?;
        self.writer
            .flush()
            .await
            .map_err(|e| format!("failed to flush PTY: {e}"))
    }

    /// Wait until any of `patterns` appears in the stream, bounded by
    /// `timeout`. Returns the text before the earliest match and the index of
    /// the pattern that matched; the match itself is consumed. Unconsumed
    /// bytes stay buffered for the next expect, which is what makes the
    /// `echo $?` protocol line up.
    async fn expect(
        &mut self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(String, usize), ExpectError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(found) = self.find_match(patterns) {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExpectError::Timeout);
            }
            match tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(ExpectError::Closed("PTY closed (bash exited)".to_string()));
                }
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(ExpectError::Closed(format!("error reading PTY: {e}")));
                }
                Err(_) => return Err(ExpectError::Timeout),
            }
        }
    }

    /// Earliest occurrence of any pattern in the buffer; ties go to the
    /// pattern listed first.
    fn find_match(&mut self, patterns: &[&str]) -> Option<(String, usize)> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (index, pattern) in patterns.iter().enumerate() {
            if pattern.is_empty() {
                continue;
            }
            if let Some(position) = find_subslice(&self.buffer, pattern.as_bytes()) {
                if best.is_none_or(|(best_position, _, _)| position < best_position) {
                    best = Some((position, index, pattern.len()));
                }
            }
        }
        let (position, index, length) = best?;
        let before = String::from_utf8_lossy(&self.buffer[..position]).into_owned();
        self.buffer.drain(..position + length);
        Some((before, index))
    }

    /// Recover `$?` for the command whose prompt we just consumed.
    ///
    /// Quitting a sub-REPL often leaves a double prompt behind, making the
    /// first capture empty; a single extra expect resynchronizes. Dropping
    /// that second chance causes spurious capture timeouts after interactive
    /// quits.
    async fn capture_exit_code(&mut self) -> Result<String, ExpectError> {
        self.send_line("\necho $?")
            .await
            .map_err(ExpectError::Closed)?;
        let (first, _) = self.expect(&[PS1_SENTINEL], HANDSHAKE_TIMEOUT).await?;
        let code = first.trim().to_string();
        if !code.is_empty() {
            return Ok(code);
        }
        let (second, _) = self.expect(&[PS1_SENTINEL], HANDSHAKE_TIMEOUT).await?;
        Ok(second.trim().to_string())
    }

    /// After an interactive quit the sub-REPL may have re-enabled terminal
    /// echo; force it back off and swallow the stale prompt the quit leaks.
    /// Best-effort: a failure here degrades the next observation, not this
    /// one.
    async fn scrub_echo(&mut self) {
        let _ = set_echo(self.master_fd, false);
        wait_no_echo(self.master_fd, HANDSHAKE_TIMEOUT).await;
        if self
            .send_line(&format!(
                "stty -echo; echo '{ECHO_SCRUB_MARKER}'; echo '{ECHO_SCRUB_MARKER}'"
            ))
            .await
            .is_err()
        {
            return;
        }
        if self
            .expect(&[ECHO_SCRUB_MARKER], HANDSHAKE_TIMEOUT)
            .await
            .is_err()
        {
            tracing::warn!("no echo-scrub marker after interactive quit");
        }
        if self
            .expect(&[PS1_SENTINEL], HANDSHAKE_TIMEOUT)
            .await
            .is_err()
        {
            tracing::warn!("no prompt after scrubbing echo");
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn set_echo(fd: RawFd, on: bool) -> nix::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut attrs = termios::tcgetattr(fd)?;
    if on {
        attrs.local_flags.insert(LocalFlags::ECHO);
    } else {
        attrs.local_flags.remove(LocalFlags::ECHO);
    }
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)
}

/// Poll until the terminal reports echo off, bounded by `timeout`.
async fn wait_no_echo(fd: RawFd, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let echo_off = {
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            termios::tcgetattr(fd)
                .map(|attrs| !attrs.local_flags.contains(LocalFlags::ECHO))
                .unwrap_or(true)
        };
        if echo_off || tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
