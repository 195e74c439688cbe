//! Splitting multi-line shell input into atomic commands.
//!
//! Sending a multi-command string to an interactive bash line by line would
//! emit one prompt per command and corrupt exit-code recovery, so the session
//! layer splits the input into atoms and rejoins them into a single line (see
//! [`join_commands`]). The splitter is deliberately line-oriented and
//! heuristic: a line containing `<<WORD` is treated as a heredoc opener even
//! inside quoted strings, and `<<-` / quoted delimiters (`<<'EOF'`) are not
//! recognized. Do not try to fully parse bash here.

enum Mode {
    Normal,
    /// Accumulating heredoc body until a line equals the remembered delimiter.
    Heredoc(String),
    /// The previous line ended with a backslash; glue the next line on.
    Continue,
}

/// Split shell text into atomic commands, respecting heredocs and
/// backslash-escaped line continuations.
///
/// `strip` trims each resulting command; `remove_empty` drops empty ones.
/// A trailing unterminated heredoc or continuation is emitted as-is.
pub fn split_bash_command(input: &str, strip: bool, remove_empty: bool) -> Vec<String> {
    let mut commands: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut mode = Mode::Normal;

    for line in input.lines() {
        match &mode {
            Mode::Heredoc(delimiter) => {
                if !current.is_empty() {
                    current.push('\n');
                }
                current.push_str(line);
                if line.trim() == delimiter {
                    commands.push(std::mem::take(&mut current));
                    mode = Mode::Normal;
                }
            }
            Mode::Continue => {
                if let Some(delimiter) = heredoc_delimiter(line) {
                    current.push_str(line);
                    mode = Mode::Heredoc(delimiter.to_string());
                } else if let Some(head) = line.strip_suffix('\\') {
                    current.push_str(head);
                } else {
                    current.push_str(line);
                    commands.push(std::mem::take(&mut current));
                    mode = Mode::Normal;
                }
            }
            Mode::Normal => {
                if let Some(delimiter) = heredoc_delimiter(line) {
                    current.push_str(line);
                    mode = Mode::Heredoc(delimiter.to_string());
                } else if let Some(head) = line.strip_suffix('\\') {
                    current.push_str(head);
                    mode = Mode::Continue;
                } else if line.trim().is_empty() {
                    commands.push(String::new());
                } else {
                    commands.push(line.to_string());
                }
            }
        }
    }
    if !current.is_empty() {
        commands.push(current);
    }

    if strip {
        for command in &mut commands {
            *command = command.trim().to_string();
        }
    }
    if remove_empty {
        commands.retain(|command| !command.is_empty());
    }
    commands
}

/// Rejoin split atoms into one line bash executes as a unit.
///
/// A `;` separator is only inserted where the preceding atom does not already
/// end with a control operator: `for i in x;` + `do ...;` + `done` must become
/// `for i in x; do ...; done`, since bash rejects the empty command in
/// `for i in x; ; do`.
pub fn join_commands(commands: &[String]) -> String {
    let mut joined = String::new();
    for command in commands {
        if joined.is_empty() {
            joined.push_str(command);
            continue;
        }
        match joined.trim_end().chars().last() {
            Some(';') | Some('&') => joined.push(' '),
            _ => joined.push_str(" ; "),
        }
        joined.push_str(command);
    }
    joined
}

/// The delimiter of a `<<WORD` heredoc opener, if the line contains one.
///
/// Matches `<<` immediately followed by at least one word character, anywhere
/// in the line, scanning overlapping positions so `<<<word` is treated the
/// way the `<<(\w+)` convention reads it.
fn heredoc_delimiter(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    for start in 0..bytes.len().saturating_sub(1) {
        if bytes[start] != b'<' || bytes[start + 1] != b'<' {
            continue;
        }
        let rest = &line[start + 2..];
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end > 0 {
            return Some(&rest[..end]);
        }
    }
    None
}
