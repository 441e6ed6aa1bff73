//! Alternate-services cache: a small on-disk map from origin to an
//! alternative endpoint, learned from `alt-svc` response headers.
//!
//! Lives at `<cache>/alt-svc.txt`, one entry per line:
//! `origin_host:port alt_host:alt_port`. When no cache directory is
//! configured the client never touches disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub(crate) struct AltSvcCache {
    path: PathBuf,
    entries: HashMap<String, (String, u16)>,
}

impl AltSvcCache {
    pub(crate) fn load(dir: &Path) -> Self {
        let path = dir.join("alt-svc.txt");
        let mut entries = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(&path) {
            for line in contents.lines() {
                let Some((origin, alt)) = line.split_once(' ') else {
                    continue;
                };
                if let Some(endpoint) = parse_endpoint(alt) {
                    entries.insert(origin.to_string(), endpoint);
                }
            }
        }
        AltSvcCache { path, entries }
    }

    /// The alternative endpoint for `origin` (`host:port`), if any.
    pub(crate) fn lookup(&self, origin: &str) -> Option<(String, u16)> {
        self.entries.get(origin).cloned()
    }

    /// Record an `alt-svc` header observed for `origin`. Persists on
    /// change. Returns whether the cache changed.
    pub(crate) fn learn(&mut self, origin: &str, header: &str) -> bool {
        if header.trim() == "clear" {
            let removed = self.entries.remove(origin).is_some();
            if removed {
                self.persist();
            }
            return removed;
        }
        let Some((alt_host, alt_port)) = parse_header(header) else {
            return false;
        };
        let host = if alt_host.is_empty() {
            origin.rsplit_once(':').map_or(origin, |(h, _)| h).to_string()
        } else {
            alt_host
        };
        let entry = (host, alt_port);
        if self.entries.get(origin) == Some(&entry) {
            return false;
        }
        self.entries.insert(origin.to_string(), entry);
        self.persist();
        true
    }

    fn persist(&self) {
        let mut contents = String::new();
        for (origin, (host, port)) in &self.entries {
            contents.push_str(origin);
            contents.push(' ');
            contents.push_str(host);
            contents.push(':');
            contents.push_str(&port.to_string());
            contents.push('\n');
        }
        if let Err(e) = std::fs::write(&self.path, contents) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist alt-svc cache");
        }
    }
}

/// Parse the first alternative from an `alt-svc` header value, e.g.
/// `h2=":443"; ma=3600, h3="alt.example:443"`. An empty host means
/// "same host".
fn parse_header(value: &str) -> Option<(String, u16)> {
    let first = value.split(',').next()?.trim();
    let params = first.split(';').next()?.trim();
    let (_protocol, quoted) = params.split_once('=')?;
    let endpoint = quoted.trim().trim_matches('"');
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

fn parse_endpoint(value: &str) -> Option<(String, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("altsvc-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parse_alt_svc_header_forms() {
        assert_eq!(
            parse_header("h2=\"alt.example:443\"; ma=3600"),
            Some(("alt.example".to_string(), 443))
        );
        assert_eq!(parse_header("h2=\":8443\""), Some((String::new(), 8443)));
        assert_eq!(parse_header("garbage"), None);
    }

    #[test]
    fn learn_and_lookup_round_trip() {
        let dir = temp_dir("round-trip");
        let mut cache = AltSvcCache::load(&dir);

        assert!(cache.learn("example.com:80", "h2=\"alt.example:8080\""));
        assert_eq!(
            cache.lookup("example.com:80"),
            Some(("alt.example".to_string(), 8080))
        );

        // Re-learning the same entry is a no-op.
        assert!(!cache.learn("example.com:80", "h2=\"alt.example:8080\""));

        // A fresh cache sees the persisted file.
        let reloaded = AltSvcCache::load(&dir);
        assert_eq!(
            reloaded.lookup("example.com:80"),
            Some(("alt.example".to_string(), 8080))
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_alt_host_means_same_host() {
        let dir = temp_dir("same-host");
        let mut cache = AltSvcCache::load(&dir);
        cache.learn("example.com:80", "h2=\":9000\"");
        assert_eq!(
            cache.lookup("example.com:80"),
            Some(("example.com".to_string(), 9000))
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_removes_the_entry() {
        let dir = temp_dir("clear");
        let mut cache = AltSvcCache::load(&dir);
        cache.learn("example.com:80", "h2=\":9000\"");
        assert!(cache.learn("example.com:80", "clear"));
        assert_eq!(cache.lookup("example.com:80"), None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
