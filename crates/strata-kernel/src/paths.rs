//! Cache paths for fetched module content.
//!
//! Remote locations (archives over HTTP, git mirrors) are kept on disk under
//! one cache root. Each location maps to a path below that root through
//! [`cache_key`], a pure function of the location string.
//!
//! | Purpose | Override | Default |
//! |---------|----------|---------|
//! | Cache root | `$STRATA_CACHE` | `$XDG_CACHE_HOME/strata` |

use std::path::PathBuf;

use directories::BaseDirs;

/// Environment variable overriding the cache root.
pub const CACHE_ENV: &str = "STRATA_CACHE";

/// Get the user's home directory.
///
/// Returns `$HOME` or falls back to `/tmp` if not set.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Get XDG cache home directory.
///
/// Returns `$XDG_CACHE_HOME` or falls back to `~/.cache`.
pub fn xdg_cache_home() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.cache_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".cache"))
}

/// Get the strata cache directory.
///
/// Uses `$STRATA_CACHE` when set and non-empty, else `$XDG_CACHE_HOME/strata`.
pub fn cache_dir() -> PathBuf {
    match std::env::var(CACHE_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => xdg_cache_home().join("strata"),
    }
}

/// Characters that may not appear in a cache path segment.
fn is_unsafe(c: char) -> bool {
    c < ' ' || c > '~' || matches!(c, '"' | '%' | '*' | ':' | '<' | '>' | '?' | '\\' | '|')
}

/// Derive a relative cache path from a location.
///
/// Unsafe characters become `_` and underscores at segment edges are
/// dropped. Empty and dot segments never survive, so the key stays below the
/// cache root. The mapping is not reversible.
///
/// ```
/// use strata_kernel::paths::cache_key;
///
/// assert_eq!(cache_key("https://example.com/lib.zip"), "https/example.com/lib.zip");
/// ```
pub fn cache_key(location: &str) -> String {
    let escaped: String = location
        .chars()
        .map(|c| if is_unsafe(c) { '_' } else { c })
        .collect();

    escaped
        .split('/')
        .map(|segment| segment.trim_matches('_'))
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment {
            "." | ".." => "_",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn xdg_cache_home_is_absolute() {
        assert!(xdg_cache_home().is_absolute());
    }

    #[test]
    fn cache_dir_is_absolute() {
        assert!(cache_dir().is_absolute() || std::env::var(CACHE_ENV).is_ok());
    }

    #[rstest]
    #[case::http("http://host/a/b.zip", "http/host/a/b.zip")]
    #[case::port("https://host:8080/x.zip", "https/host_8080/x.zip")]
    #[case::query("http://host/get?id=1", "http/host/get_id=1")]
    #[case::git("https://host/repo.git", "https/host/repo.git")]
    #[case::dot_dot("http://host/../../etc", "http/host/_/_/etc")]
    #[case::unicode("http://host/caf\u{e9}.zip", "http/host/caf_.zip")]
    fn cache_keys(#[case] location: &str, #[case] expected: &str) {
        assert_eq!(cache_key(location), expected);
    }

    #[test]
    fn cache_key_is_deterministic() {
        let location = "git+ssh://git@host:repo.git";
        assert_eq!(cache_key(location), cache_key(location));
    }

    #[test]
    fn cache_key_never_escapes_root() {
        let key = cache_key("/../../x");
        assert!(!key.starts_with('/'));
        assert!(!key.split('/').any(|s| s == ".."));
    }
}
