/// Quote a value for embedding in a POSIX shell command string.
///
/// Uses single quotes with the `'\''` escape for embedded quotes so the value
/// survives one level of nested command-string evaluation unchanged.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Wrap a command so its stdio is attached to a pseudo-terminal, for agents
/// that refuse to run non-interactively.
pub fn pty_wrap(command: &str) -> String {
    format!("script -qec {} /dev/null", shell_quote(command))
}
