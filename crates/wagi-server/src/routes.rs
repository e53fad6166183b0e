//! The route table.
//!
//! A [`RouteTable`] is an immutable snapshot mapping route patterns to
//! modules. It is built from a configuration, then published whole; requests
//! hold the snapshot they matched against until they finish.
//!
//! Patterns are literal paths. A trailing `/...` makes a prefix route that
//! also matches every path beneath it. When several routes match, an exact
//! route beats a prefix route, a host-specific route beats a host-agnostic
//! one, and a longer prefix beats a shorter one.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use url::Url;

use wagi_common::WagiConfig;
use wagi_core::cgi;
use wagi_core::{ModuleSpec, WagiHost};

use crate::bindle::{BindleResolver, merge_bindles};

/// A host a route answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    host: String,
    port: Option<u16>,
}

impl HostPattern {
    /// Parse an absolute URI such as `https://example.com:8443`.
    ///
    /// Only an explicit port is kept.
    pub fn parse(uri: &str) -> Option<Self> {
        let url = Url::parse(uri).ok()?;
        Some(Self {
            host: url.host_str()?.to_ascii_lowercase(),
            port: url.port(),
        })
    }

    /// Returns `true` if a `Host` header value matches.
    pub fn matches(&self, host: &str) -> bool {
        let (name, port) = split_host(host);
        name.eq_ignore_ascii_case(&self.host) && self.port.is_none_or(|p| port == Some(p))
    }
}

/// One route in the table.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pattern: String,
    prefix: String,
    wildcard: bool,
    hosts: Vec<HostPattern>,
    module: Arc<ModuleSpec>,
}

impl RouteEntry {
    /// Create an entry for `pattern`.
    ///
    /// Hostnames that are not absolute URIs are logged and ignored.
    pub fn new(pattern: &str, hostnames: &[String], module: Arc<ModuleSpec>) -> Self {
        let hosts = hostnames
            .iter()
            .filter_map(|h| {
                let parsed = HostPattern::parse(h);
                if parsed.is_none() {
                    warn!(hostname = %h, route = %pattern, "Ignoring invalid hostname");
                }
                parsed
            })
            .collect();

        Self {
            pattern: pattern.to_string(),
            prefix: cgi::route_prefix(pattern).to_string(),
            wildcard: cgi::is_wildcard(pattern),
            hosts,
            module,
        }
    }

    /// The configured pattern, wildcard marker included.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The module serving this route.
    pub fn module(&self) -> &Arc<ModuleSpec> {
        &self.module
    }

    /// Returns `true` for a prefix route.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    fn matches_path(&self, path: &str) -> bool {
        let path = normalize(path);
        if self.wildcard {
            self.prefix.is_empty()
                || path == self.prefix
                || path
                    .strip_prefix(self.prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        } else {
            path == self.prefix
        }
    }

    fn matches_host(&self, host: Option<&str>) -> bool {
        self.hosts.is_empty() || host.is_some_and(|h| self.hosts.iter().any(|p| p.matches(h)))
    }

    fn specificity(&self) -> (bool, bool, usize) {
        (!self.wildcard, !self.hosts.is_empty(), self.prefix.len())
    }

    fn same_binding(&self, other: &Self) -> bool {
        self.prefix == other.prefix && self.wildcard == other.wildcard && self.hosts == other.hosts
    }
}

/// Outcome of a route lookup.
#[derive(Debug)]
pub enum RouteMatch<'a> {
    /// A route accepts the request.
    Found(&'a RouteEntry),

    /// A route matches the path but not the method.
    MethodNotAllowed {
        /// The method the best matching route accepts.
        allowed: &'a str,
    },

    /// No route matches.
    NotFound,
}

/// An immutable set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route.
    ///
    /// Returns `false`, leaving the table unchanged, if a route with the same
    /// pattern and hostnames exists.
    pub fn insert(&mut self, entry: RouteEntry) -> bool {
        if self.entries.iter().any(|e| e.same_binding(&entry)) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Find the route for a request.
    ///
    /// `host` is the request's `Host` value, port included.
    pub fn lookup(&self, method: &str, path: &str, host: Option<&str>) -> RouteMatch<'_> {
        let mut candidates: Vec<&RouteEntry> = self
            .entries
            .iter()
            .filter(|e| e.matches_path(path) && e.matches_host(host))
            .collect();

        if candidates.is_empty() {
            return RouteMatch::NotFound;
        }
        candidates.sort_by_key(|e| std::cmp::Reverse(e.specificity()));

        match candidates
            .iter()
            .copied()
            .find(|e| e.module.http_method.eq_ignore_ascii_case(method))
        {
            Some(entry) => RouteMatch::Found(entry),
            None => RouteMatch::MethodNotAllowed {
                allowed: &candidates[0].module.http_method,
            },
        }
    }

    /// Routes in insertion order.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a table from a configuration.
    ///
    /// Bindles are resolved first and merged with the configured modules.
    /// Modules are then added in name order, each followed by the sub-routes
    /// it declares. A module whose file is missing, or whose sub-route query
    /// fails, is logged; the rest of the table is still built.
    ///
    /// Blocks while modules compile; call it from a blocking worker.
    #[instrument(skip_all, fields(modules = config.modules.len(), bindles = config.bindles.len()))]
    pub fn build(config: &WagiConfig, host: &WagiHost, bindles: &dyn BindleResolver) -> Self {
        let mut table = Self::new();

        for (name, info) in merge_bindles(config, bindles) {
            let spec = Arc::new(ModuleSpec::from_config(config, &info));

            if !spec.path.is_file() {
                warn!(
                    module = %name,
                    path = %spec.path.display(),
                    "Module file not found, skipping"
                );
                continue;
            }
            if spec.authorize || !spec.roles.is_empty() || !spec.policies.is_empty() {
                warn!(module = %name, "Authorization settings are not enforced by this server");
            }

            if !table.insert(RouteEntry::new(&info.route, &info.hostnames, Arc::clone(&spec))) {
                warn!(module = %name, route = %info.route, "Duplicate route, skipping");
                continue;
            }

            match host.query_routes(&spec) {
                Ok(sub_routes) => {
                    let parent = cgi::route_prefix(&info.route);
                    for sub in sub_routes {
                        let route = compose(parent, &sub.route);
                        let entry = RouteEntry::new(
                            &route,
                            &info.hostnames,
                            Arc::new(spec.with_entrypoint(&sub.entrypoint)),
                        );
                        if !table.insert(entry) {
                            warn!(module = %name, route = %route, "Duplicate sub-route, skipping");
                        }
                    }
                }
                Err(e) => {
                    error!(module = %name, error = %e, "Failed to query sub-routes");
                }
            }
        }

        info!(routes = table.len(), "Route table built");
        table
    }
}

/// Join a parent prefix and a sub-route.
fn compose(prefix: &str, route: &str) -> String {
    let route = route.trim_start_matches('/');
    format!("{prefix}/{route}")
}

/// Drop a trailing slash, so `/hello/` matches `/hello`.
fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// Split a `Host` value into name and optional port.
fn split_host(host: &str) -> (&str, Option<u16>) {
    if host.starts_with('[') {
        // IPv6 literal; the brackets stay part of the name.
        return match host.find(']') {
            Some(end) => (
                &host[..=end],
                host[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok()),
            ),
            None => (host, None),
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) => (name, port.parse().ok()),
        None => (host, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pattern: &str) -> RouteEntry {
        entry_with(pattern, &[], "GET")
    }

    fn entry_with(pattern: &str, hostnames: &[&str], method: &str) -> RouteEntry {
        let hostnames: Vec<String> = hostnames.iter().map(ToString::to_string).collect();
        let module = ModuleSpec {
            http_method: method.to_string(),
            ..ModuleSpec::new(format!(
                "{}{}.wasm",
                pattern.replace('/', "_"),
                hostnames.join(",")
            ))
        };
        RouteEntry::new(pattern, &hostnames, Arc::new(module))
    }

    fn table(entries: Vec<RouteEntry>) -> RouteTable {
        let mut table = RouteTable::new();
        for e in entries {
            assert!(table.insert(e));
        }
        table
    }

    fn found<'a>(m: RouteMatch<'a>) -> &'a str {
        match m {
            RouteMatch::Found(e) => e.pattern(),
            other => panic!("expected a route, got {other:?}"),
        }
    }

    #[test]
    fn test_exact_route() {
        let t = table(vec![entry("/hello")]);
        assert_eq!(found(t.lookup("GET", "/hello", None)), "/hello");
        assert_eq!(found(t.lookup("GET", "/hello/", None)), "/hello");
        assert!(matches!(
            t.lookup("GET", "/hello/world", None),
            RouteMatch::NotFound
        ));
        assert!(matches!(t.lookup("GET", "/hell", None), RouteMatch::NotFound));
    }

    #[test]
    fn test_wildcard_route() {
        let t = table(vec![entry("/static/...")]);
        assert_eq!(found(t.lookup("GET", "/static", None)), "/static/...");
        assert_eq!(found(t.lookup("GET", "/static/a/b", None)), "/static/...");
        assert!(matches!(
            t.lookup("GET", "/staticfile", None),
            RouteMatch::NotFound
        ));
    }

    #[test]
    fn test_root_routes() {
        let t = table(vec![entry("/"), entry("/...")]);
        assert_eq!(found(t.lookup("GET", "/", None)), "/");
        assert_eq!(found(t.lookup("GET", "/anything", None)), "/...");
    }

    #[test]
    fn test_most_specific_wins() {
        let t = table(vec![entry("/..."), entry("/api/..."), entry("/api/users")]);
        assert_eq!(found(t.lookup("GET", "/api/users", None)), "/api/users");
        assert_eq!(found(t.lookup("GET", "/api/orders", None)), "/api/...");
        assert_eq!(found(t.lookup("GET", "/other", None)), "/...");
    }

    #[test]
    fn test_method_not_allowed() {
        let t = table(vec![entry_with("/submit", &[], "POST")]);
        assert_eq!(found(t.lookup("POST", "/submit", None)), "/submit");
        assert!(matches!(
            t.lookup("GET", "/submit", None),
            RouteMatch::MethodNotAllowed { allowed: "POST" }
        ));
    }

    #[test]
    fn test_hostnames() {
        let t = table(vec![
            entry_with("/", &["https://a.example.com"], "GET"),
            entry_with("/", &["http://b.example.com:8080"], "GET"),
        ]);

        let a = match t.lookup("GET", "/", Some("A.example.com")) {
            RouteMatch::Found(e) => e.module().path.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let b = match t.lookup("GET", "/", Some("b.example.com:8080")) {
            RouteMatch::Found(e) => e.module().path.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(a, b);

        assert!(matches!(
            t.lookup("GET", "/", Some("b.example.com:9090")),
            RouteMatch::NotFound
        ));
        assert!(matches!(t.lookup("GET", "/", None), RouteMatch::NotFound));
    }

    #[test]
    fn test_host_specific_beats_any_host() {
        let t = table(vec![
            entry_with("/", &[], "GET"),
            entry_with("/", &["https://special.example.com"], "GET"),
        ]);
        let hit = match t.lookup("GET", "/", Some("special.example.com")) {
            RouteMatch::Found(e) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert!(!hit.hosts.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut t = RouteTable::new();
        assert!(t.insert(entry("/hello")));
        assert!(!t.insert(entry("/hello/")));
        assert!(t.insert(entry("/hello/...")));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("example.com"), ("example.com", None));
        assert_eq!(split_host("example.com:8080"), ("example.com", Some(8080)));
        assert_eq!(split_host("[::1]:3000"), ("[::1]", Some(3000)));
        assert_eq!(split_host("[::1]"), ("[::1]", None));
    }

    #[test]
    fn test_compose() {
        assert_eq!(compose("", "/hello"), "/hello");
        assert_eq!(compose("/app", "/files/..."), "/app/files/...");
        assert_eq!(compose("/app", "hello"), "/app/hello");
    }
}
