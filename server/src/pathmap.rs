//! Host↔container path translation.
//!
//! When the server runs inside a container, filesystem events and CLI
//! arguments arrive in the host namespace while every stored record uses
//! the container namespace. The mapper translates both directions via
//! longest-prefix match so nested mount points can coexist with broader
//! ones. Immutable after construction.

use std::collections::BTreeMap;
use tracing::warn;

/// Bidirectional path translator built from `host:container` pairs.
#[derive(Debug, Default, Clone)]
pub struct PathMapper {
    /// host prefix → container prefix
    host_to_container: BTreeMap<String, String>,
    /// container prefix → host prefix
    container_to_host: BTreeMap<String, String>,
}

impl PathMapper {
    /// Parse a comma-separated `host1:container1,host2:container2` spec.
    ///
    /// Malformed pairs (missing separator, empty side, relative paths) are
    /// logged and skipped; an empty or all-invalid spec yields a mapper
    /// with no mappings (host mode).
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let mut mapper = Self::default();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((host, container)) = pair.split_once(':') else {
                warn!(pair = pair, "Skipping path mapping without ':' separator");
                continue;
            };
            let host = normalize_prefix(host);
            let container = normalize_prefix(container);
            if host.is_empty() || container.is_empty() {
                warn!(pair = pair, "Skipping path mapping with empty side");
                continue;
            }
            if !host.starts_with('/') || !container.starts_with('/') {
                warn!(pair = pair, "Skipping non-absolute path mapping");
                continue;
            }
            mapper
                .host_to_container
                .insert(host.clone(), container.clone());
            mapper.container_to_host.insert(container, host);
        }
        mapper
    }

    /// Translate a host path into the container namespace.
    ///
    /// Picks the mapping whose host prefix is the longest (proper or equal)
    /// prefix of the input and substitutes it. Unmapped paths pass through
    /// unchanged.
    #[must_use]
    pub fn to_container(&self, host_path: &str) -> String {
        translate(&self.host_to_container, host_path)
    }

    /// Translate a container path into the host namespace.
    #[must_use]
    pub fn to_host(&self, container_path: &str) -> String {
        translate(&self.container_to_host, container_path)
    }

    /// True when the path lies under some mapped container prefix, or when
    /// no mappings are configured at all (host mode accepts everything).
    #[must_use]
    pub fn validate_container(&self, path: &str) -> bool {
        if self.container_to_host.is_empty() {
            return true;
        }
        self.container_to_host
            .keys()
            .any(|prefix| prefix_matches(prefix, path))
    }

    /// True if any mappings are configured.
    #[must_use]
    pub fn has_mappings(&self) -> bool {
        !self.host_to_container.is_empty()
    }

    /// Defensive copy of the configured host→container pairs.
    #[must_use]
    pub fn snapshot_mappings(&self) -> Vec<(String, String)> {
        self.host_to_container
            .iter()
            .map(|(h, c)| (h.clone(), c.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Prefix helpers
// ---------------------------------------------------------------------------

/// Strip a trailing slash (but keep a bare "/").
fn normalize_prefix(p: &str) -> String {
    let p = p.trim();
    if p.len() > 1 {
        p.trim_end_matches('/').to_string()
    } else {
        p.to_string()
    }
}

/// Component-aware prefix test: `/a` matches `/a` and `/a/b`, never `/ab`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn translate(map: &BTreeMap<String, String>, path: &str) -> String {
    let best = map
        .iter()
        .filter(|(from, _)| prefix_matches(from, path))
        .max_by_key(|(from, _)| from.len());

    match best {
        Some((from, to)) => {
            let rest = &path[from.len()..];
            format!("{to}{rest}")
        }
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_passes_through() {
        let m = PathMapper::parse("");
        assert!(!m.has_mappings());
        assert_eq!(m.to_container("/Users/alice/proj"), "/Users/alice/proj");
        assert!(m.validate_container("/anything"));
    }

    #[test]
    fn basic_round_trip() {
        let m = PathMapper::parse("/Users/alice/proj:/ws/m0");
        assert_eq!(m.to_container("/Users/alice/proj/src/main.rs"), "/ws/m0/src/main.rs");
        assert_eq!(m.to_host("/ws/m0/src/main.rs"), "/Users/alice/proj/src/main.rs");
        assert_eq!(
            m.to_host(&m.to_container("/Users/alice/proj/a.go")),
            "/Users/alice/proj/a.go"
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let m = PathMapper::parse("/a:/x,/a/b:/y");
        assert_eq!(m.to_container("/a/b/c"), "/y/c");
        assert_eq!(m.to_container("/a/c"), "/x/c");
        assert_eq!(m.to_container("/a/b"), "/y");
    }

    #[test]
    fn component_boundaries_respected() {
        let m = PathMapper::parse("/a:/x");
        // "/ab" shares a string prefix with "/a" but is a different path
        assert_eq!(m.to_container("/ab/c"), "/ab/c");
    }

    #[test]
    fn unmapped_path_unchanged() {
        let m = PathMapper::parse("/home/dev:/ws");
        assert_eq!(m.to_container("/opt/other"), "/opt/other");
        assert_eq!(m.to_host("/opt/other"), "/opt/other");
    }

    #[test]
    fn invalid_pairs_skipped() {
        let m = PathMapper::parse("nocolon,:/x,/y:,relative:also/relative,/ok:/fine");
        assert_eq!(m.snapshot_mappings(), vec![("/ok".to_string(), "/fine".to_string())]);
    }

    #[test]
    fn validate_container_requires_mapped_prefix() {
        let m = PathMapper::parse("/Users/alice/proj:/ws/m0");
        assert!(m.validate_container("/ws/m0"));
        assert!(m.validate_container("/ws/m0/src"));
        assert!(!m.validate_container("/ws/m1"));
        assert!(!m.validate_container("/Users/alice/proj"));
    }

    #[test]
    fn trailing_slashes_normalized() {
        let m = PathMapper::parse("/host/dir/:/container/dir/");
        assert_eq!(m.to_container("/host/dir/file"), "/container/dir/file");
    }

    #[test]
    fn snapshot_is_a_copy() {
        let m = PathMapper::parse("/a:/x");
        let mut snap = m.snapshot_mappings();
        snap.clear();
        assert!(m.has_mappings());
    }
}
