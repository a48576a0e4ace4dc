//! Lexical path helpers used for storage and bind-point bookkeeping.
//!
//! Paths are handled as UTF-8 strings. Nothing here touches the filesystem
//! except [`is_empty_dir`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io;

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Collapses `.`, `..` and repeated separators. A trailing separator is
/// dropped unless the result is the root itself.
pub fn normalize(path: &str) -> String {
    let absolute = is_absolute(path);
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

pub fn join(base: &str, rest: &str) -> String {
    if base.is_empty() {
        return rest.to_string();
    }
    if rest.is_empty() {
        return base.to_string();
    }
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    format!("{base}/{rest}")
}

/// True when `prefix` equals `path` or names one of its ancestor directories.
pub fn starts_with(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

/// Returns `path` relative to `parent`, or `None` if `parent` is not a prefix.
pub fn relativize<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    if !starts_with(path, parent) {
        return None;
    }
    Some(path[parent.len()..].trim_start_matches('/'))
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

pub fn dirname(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(pos) => &trimmed[..pos],
        None => ".",
    }
}

/// `Ok(true)` for an empty directory, `Ok(false)` for a non-empty one.
/// A missing path or a non-directory is reported as an error.
pub fn is_empty_dir(path: &str) -> io::Result<bool> {
    let mut entries = fs::read_dir(path)?;
    Ok(entries.next().is_none())
}

/// Bind targets must be absolute and either absent or an empty directory.
pub fn is_valid_mount_target(path: &str) -> bool {
    is_absolute(path) && is_empty_dir(path).unwrap_or(true)
}

/// Map key that orders `/` before every other byte, so that a directory sorts
/// directly ahead of everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn rank(byte: u8) -> u16 {
    if byte == b'/' { 0 } else { u16::from(byte) + 1 }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .bytes()
            .map(rank)
            .cmp(other.0.bytes().map(rank))
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for PathKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Longest directory that is an ancestor of both `a` and `b`.
fn common_ancestor<'a>(a: &'a str, b: &str) -> &'a str {
    let mut end = 0;
    for (i, (x, y)) in a.bytes().zip(b.bytes()).enumerate() {
        if x != y {
            break;
        }
        if x == b'/' {
            end = i;
        }
    }
    if end == 0 && is_absolute(a) { "/" } else { &a[..end] }
}

/// Finds the entry whose key is `path` or the nearest ancestor of it.
///
/// Looks at the closest key not above `path`. When that key is not an
/// ancestor, no ancestor sorts between it and the directory both share, so
/// the search resumes from there.
pub fn find_parent<'a, V>(
    map: &'a BTreeMap<PathKey, V>,
    path: &str,
) -> Option<(&'a PathKey, &'a V)> {
    let path = match path.trim_end_matches('/') {
        "" if is_absolute(path) => "/",
        trimmed => trimmed,
    };
    let mut bound = PathKey::new(path);
    loop {
        let (key, value) = map.range(..=&bound).next_back()?;
        if starts_with(path, key.as_str()) {
            return Some((key, value));
        }
        bound = PathKey::new(common_ancestor(path, key.as_str()));
    }
}
