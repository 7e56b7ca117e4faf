//! Canonical path helpers.
//!
//! A canonical path is root-relative, `/`-separated, with no leading or
//! trailing slash. It is the reconciliation key shared by the document
//! store and the container filesystem.

/// Normalize a raw path: strip leading/trailing slashes, drop empty
/// segments and `.` components.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join path segments, skipping empty ones.
/// `join(&["", "sub", "b.txt"])` is `"sub/b.txt"`.
pub fn join(segments: &[&str]) -> String {
    let parts: Vec<&str> = segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect();
    parts.join("/")
}

/// Canonical path of a file inside a folder.
/// The root folder has empty name and path, so root files get bare names.
pub fn file_path(folder_path: &str, folder_name: &str, name: &str) -> String {
    join(&[folder_path, folder_name, name])
}

/// The directory a folder record denotes (its parent chain plus its own name).
pub fn folder_dir(folder_path: &str, folder_name: &str) -> String {
    join(&[folder_path, folder_name])
}

/// Split a canonical path into (parent, name).
/// `"a/b/c.txt"` → `("a/b", "c.txt")`; `"c.txt"` → `("", "c.txt")`.
pub fn split_parent(path: &str) -> (String, String) {
    let norm = normalize(path);
    match norm.rfind('/') {
        Some(idx) => (norm[..idx].to_string(), norm[idx + 1..].to_string()),
        None => (String::new(), norm),
    }
}

/// Depth of a canonical directory path. The root ("") is level 0,
/// `"a"` is 1, `"a/b"` is 2.
pub fn level_of(dir: &str) -> i64 {
    let norm = normalize(dir);
    if norm.is_empty() {
        0
    } else {
        norm.split('/').count() as i64
    }
}

/// True if `path` equals `prefix` or lives underneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let path = normalize(path);
    let prefix = normalize(prefix);
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(normalize("/a/b/"), "a/b");
        assert_eq!(normalize("a//b"), "a/b");
        assert_eq!(normalize("./a/./b"), "a/b");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("/"), "");
    }

    #[test]
    fn joins_skipping_empty() {
        assert_eq!(join(&["", "", "a.txt"]), "a.txt");
        assert_eq!(join(&["sub", "deep", "x.rs"]), "sub/deep/x.rs");
        assert_eq!(join(&["sub/", "/x.rs"]), "sub/x.rs");
    }

    #[test]
    fn file_path_at_root_is_bare_name() {
        assert_eq!(file_path("", "", "main.rs"), "main.rs");
        assert_eq!(file_path("", "src", "main.rs"), "src/main.rs");
        assert_eq!(file_path("src", "bin", "tool.rs"), "src/bin/tool.rs");
    }

    #[test]
    fn split_parent_cases() {
        assert_eq!(split_parent("a/b/c.txt"), ("a/b".into(), "c.txt".into()));
        assert_eq!(split_parent("c.txt"), ("".into(), "c.txt".into()));
        assert_eq!(split_parent("/a/c.txt/"), ("a".into(), "c.txt".into()));
    }

    #[test]
    fn levels() {
        assert_eq!(level_of(""), 0);
        assert_eq!(level_of("a"), 1);
        assert_eq!(level_of("a/b/c"), 3);
    }

    #[test]
    fn is_under_prefixes() {
        assert!(is_under("a/b/c", "a/b"));
        assert!(is_under("a/b", "a/b"));
        assert!(is_under("anything", ""));
        assert!(!is_under("a/bc", "a/b"));
    }
}
