//! Utility functions for path manipulation and command output.

use std::path::PathBuf;

use serde::Serialize;

/// Constructs a file system path by joining a directory path with a file or
/// subdirectory name.
///
/// Invalid UTF-8 sequences are replaced with `U+FFFD`.
///
/// # Examples
///
/// ```
/// let path = get_path("/home/user", "session");
/// assert_eq!(path, "/home/user/session");
/// ```
pub fn get_path(dir_path: &str, subdir_path: &str) -> String {
    let path_buf: PathBuf = [dir_path, subdir_path].iter().collect();
    path_buf.to_string_lossy().into_owned()
}

/// Serializes `value` as a single line of JSON.
pub fn to_json_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_simple() {
        let path = get_path("/home/user", "session");
        #[cfg(unix)]
        assert_eq!(path, "/home/user/session");
        #[cfg(windows)]
        assert_eq!(path, "\\home\\user\\session");
    }

    #[test]
    fn test_get_path_relative_paths() {
        let path = get_path(".", "data");
        #[cfg(unix)]
        assert_eq!(path, "./data");
        #[cfg(windows)]
        assert_eq!(path, ".\\data");
    }

    #[test]
    fn test_get_path_with_spaces() {
        let path = get_path("/home/my folder", "my file.txt");
        #[cfg(unix)]
        assert_eq!(path, "/home/my folder/my file.txt");
        #[cfg(windows)]
        assert_eq!(path, "\\home\\my folder\\my file.txt");
    }

    #[test]
    fn test_get_path_multiple_components() {
        let base = get_path("/home", "user");
        let final_path = get_path(&base, "session");
        #[cfg(unix)]
        assert_eq!(final_path, "/home/user/session");
        #[cfg(windows)]
        assert_eq!(final_path, "\\home\\user\\session");
    }

    #[test]
    fn test_to_json_line() {
        let line = to_json_line(&json!({"body": "two\nlines"})).unwrap();
        assert_eq!(line, r#"{"body":"two\nlines"}"#);
        assert!(!line.contains('\n'));
    }
}
