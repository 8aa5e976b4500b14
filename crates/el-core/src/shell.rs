//! POSIX shell quoting for remotely-executed commands

/// Quote a value for safe interpolation into a `sh`/`bash` command line.
///
/// Plain words pass through unquoted; anything else is single-quoted with
/// embedded single quotes rewritten as `'\''`.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
