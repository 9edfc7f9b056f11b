//! Slash-delimited paths into a replicant's value tree.
//!
//! Paths are `/`-rooted; the root itself is `"/"`. A `/` occurring inside a
//! key is escaped as `~1`, so the key sequence is always recoverable from the
//! path string.

/// The root path.
pub const ROOT: &str = "/";

/// Escape a single key for use as a path segment.
pub fn escape_key(key: &str) -> String {
    key.replace('/', "~1")
}

/// Recover the original key from an escaped path segment.
pub fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/")
}

/// Split a path into its unescaped key sequence, root first.
///
/// The root path yields no segments.
pub fn segments(path: &str) -> Vec<String> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(unescape_segment)
        .collect()
}

/// Append a key to a base path.
pub fn join(base: &str, key: &str) -> String {
    if base == ROOT {
        format!("/{}", escape_key(key))
    } else {
        format!("{}/{}", base, escape_key(key))
    }
}

/// The path of the container holding the node at `path`, plus the node's own
/// unescaped key. Returns `None` for the root, which has no container.
pub fn split_last(path: &str) -> Option<(String, String)> {
    if path == ROOT || path.is_empty() {
        return None;
    }
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => Some((
            format!("/{}", &trimmed[..idx]),
            unescape_segment(&trimmed[idx + 1..]),
        )),
        None => Some((ROOT.to_string(), unescape_segment(trimmed))),
    }
}

/// The unescaped final key of a path, or `None` for the root.
pub fn last_segment(path: &str) -> Option<String> {
    split_last(path).map(|(_, key)| key)
}

/// Whether `path` lies at or below `ancestor`.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT {
        return true;
    }
    path == ancestor || path.starts_with(&format!("{}/", ancestor))
}
