fn is_separator(c: char) -> bool {
    matches!(c, '/' | '\\')
}

fn is_windows_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.starts_with(b"\\\\") || bytes.starts_with(b"//") {
        return true;
    }

    match bytes {
        [drive, b':'] => drive.is_ascii_alphabetic(),
        [drive, b':', sep, ..] => drive.is_ascii_alphabetic() && matches!(sep, b'/' | b'\\'),
        _ => false,
    }
}

fn is_windows(path: &str) -> bool {
    is_windows_absolute(path) || path.contains('\\')
}

/// Joins a file path onto a directory, detecting Windows and UNIX conventions.
///
/// Absolute right-hand sides replace the base. Pseudo paths such as `<stdin>` are returned as-is.
///
/// ```
/// use symbolic_common::join_path;
///
/// assert_eq!(join_path("/a/b", "c/d"), "/a/b/c/d");
/// assert_eq!(join_path("C:\\a", "b\\c"), "C:\\a\\b\\c");
/// assert_eq!(join_path("/a/b", "/c/d"), "/c/d");
/// ```
pub fn join_path(base: &str, other: &str) -> String {
    if other.starts_with('<') && other.ends_with('>') {
        return other.into();
    }

    if base.is_empty() || other.starts_with('/') || is_windows_absolute(other) {
        return other.into();
    }

    if other.is_empty() {
        return base.into();
    }

    // C:\test + \bar -> C:\bar
    if other.starts_with('\\') {
        return match base.get(..2) {
            Some(drive) if is_windows_absolute(base) => format!("{drive}{other}"),
            _ => other.into(),
        };
    }

    let separator = if is_windows(base) || is_windows(other) {
        '\\'
    } else {
        '/'
    };

    format!(
        "{}{}{}",
        base.trim_end_matches(is_separator),
        separator,
        other.trim_start_matches(is_separator)
    )
}
