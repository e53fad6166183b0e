//! Translation of an HTTP request into the WAGI process interface.
//!
//! A guest sees the request as a CGI/1.1 program would: request metadata in
//! environment variables, the path suffix and query in argv, and the body on
//! stdin. This module computes the environment and argv; it has no knowledge
//! of the HTTP framework in front of it.

use std::net::IpAddr;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

/// Value of `GATEWAY_INTERFACE`.
pub const GATEWAY_INTERFACE: &str = "CGI/1.1";

/// Value of `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = "WAGI/1";

/// Suffix marking a route as a prefix match.
pub const WILDCARD_SUFFIX: &str = "/...";

/// Headers never forwarded to the guest.
const HIDDEN_HEADERS: [&str; 2] = ["authorization", "connection"];

/// The parts of an HTTP request the guest can observe.
#[derive(Debug, Clone, Default)]
pub struct CgiRequest {
    /// Request method, e.g. `GET`.
    pub method: String,

    /// Request path as received, percent-encoded.
    pub path: String,

    /// Raw query string without the leading `?`.
    pub query: Option<String>,

    /// Header name/value pairs in arrival order; names may repeat.
    pub headers: Vec<(String, String)>,

    /// The `Host` the request was addressed to, including any port.
    pub host: String,

    /// URL scheme, `http` or `https`.
    pub scheme: String,

    /// Protocol version, e.g. `HTTP/1.1`.
    pub protocol: String,

    /// Address of the peer, when known.
    pub remote_addr: Option<IpAddr>,

    /// Request body.
    pub body: Bytes,
}

impl CgiRequest {
    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The decoded request path.
    pub fn decoded_path(&self) -> String {
        percent_decode_str(&self.path).decode_utf8_lossy().into_owned()
    }
}

/// An ordered environment in which later assignments replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: Vec<(String, String)>,
}

impl CgiEnvironment {
    /// Set a variable, replacing any existing value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns `true` if the variable is set.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Variables in insertion order.
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Append a value to a variable, comma-separated.
    fn append(&mut self, key: String, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => {
                existing.1.push(',');
                existing.1.push_str(value);
            }
            None => self.vars.push((key, value.to_string())),
        }
    }
}

/// Returns `true` if the route ends in the wildcard marker.
pub fn is_wildcard(route: &str) -> bool {
    route.ends_with(WILDCARD_SUFFIX)
}

/// The route with any wildcard marker and trailing slash removed.
pub fn route_prefix(route: &str) -> &str {
    route.trim_end_matches('.').trim_end_matches('/')
}

/// `SCRIPT_NAME` for a route.
pub fn script_name(route: &str) -> &str {
    match route_prefix(route) {
        "" => "/",
        prefix => prefix,
    }
}

/// The decoded request path beyond a wildcard route's prefix.
///
/// Empty for routes without a wildcard.
pub fn path_info(request: &CgiRequest, route: &str) -> String {
    if !is_wildcard(route) {
        return String::new();
    }

    let prefix = route_prefix(route);
    request
        .decoded_path()
        .get(prefix.len()..)
        .unwrap_or_default()
        .to_string()
}

/// Build the CGI environment for a request matched against `route`.
pub fn build_env(request: &CgiRequest, route: &str) -> CgiEnvironment {
    let mut env = CgiEnvironment::default();
    let remote = request
        .remote_addr
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let (server_name, server_port) = split_host(&request.host);

    env.set("AUTH_TYPE", "");

    if !request.body.is_empty() {
        env.set("CONTENT_LENGTH", request.body.len().to_string());
        env.set(
            "CONTENT_TYPE",
            request.header("content-type").unwrap_or_default(),
        );
    }

    env.set("GATEWAY_INTERFACE", GATEWAY_INTERFACE);
    env.set("X_MATCHED_ROUTE", route);
    env.set("QUERY_STRING", request.query.as_deref().unwrap_or_default());
    env.set("REMOTE_ADDR", remote.clone());
    env.set("REMOTE_HOST", remote);
    env.set("REMOTE_USER", "");
    env.set("REQUEST_METHOD", request.method.as_str());
    env.set("SCRIPT_NAME", script_name(route));
    env.set("SERVER_NAME", server_name);
    env.set("SERVER_PORT", server_port.unwrap_or(80).to_string());
    env.set("SERVER_PROTOCOL", request.protocol.as_str());
    env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);

    let path_info = path_info(request, route);
    let raw_path_info: String = url::form_urlencoded::byte_serialize(path_info.as_bytes()).collect();
    let full_url_prefix = if is_wildcard(route) {
        route_prefix(route)
    } else {
        route
    };
    let query = request
        .query
        .as_deref()
        .filter(|q| !q.is_empty())
        .map(|q| format!("?{q}"))
        .unwrap_or_default();

    env.set("PATH_INFO", path_info.clone());
    env.set("PATH_TRANSLATED", path_info);
    env.set(
        "X_FULL_URL",
        format!(
            "{}://{}{full_url_prefix}{raw_path_info}{query}",
            request.scheme, request.host
        ),
    );
    env.set("X_RAW_PATH_INFO", raw_path_info);

    for (name, value) in &request.headers {
        if HIDDEN_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        env.append(header_variable(name), value);
    }

    env
}

/// `HTTP_` variable name for a header.
pub fn header_variable(name: &str) -> String {
    format!("HTTP_{}", name.replace('-', "_").to_ascii_uppercase())
}

/// Build the guest's argv.
///
/// The default vector is `PATH_INFO` followed by the decoded `&`-separated
/// query tokens. A template replaces it: the template is split on whitespace,
/// `${ARGS}` expands to the query tokens and `${SCRIPT_NAME}` to the script
/// name.
pub fn build_args(request: &CgiRequest, route: &str, template: Option<&str>) -> Vec<String> {
    let query_args: Vec<String> = request
        .query
        .as_deref()
        .filter(|q| !q.is_empty())
        .map(|q| q.split('&').map(decode_query_token).collect())
        .unwrap_or_default();

    let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
        let mut args = Vec::with_capacity(query_args.len() + 1);
        args.push(path_info(request, route));
        args.extend(query_args);
        return args;
    };

    let script = script_name(route);
    let mut args = Vec::new();
    for token in template.split_whitespace() {
        if token == "${ARGS}" {
            args.extend(query_args.iter().cloned());
        } else {
            args.push(token.replace("${SCRIPT_NAME}", script));
        }
    }
    args
}

/// Decode one query token: `+` is a space, then percent-decoding.
fn decode_query_token(token: &str) -> String {
    let spaced = token.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Split a `Host` value into name and optional port.
fn split_host(host: &str) -> (&str, Option<u16>) {
    if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal
        return match rest.split_once(']') {
            Some((addr, port)) => (addr, port.strip_prefix(':').and_then(|p| p.parse().ok())),
            None => (host, None),
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name, Some(port)),
            Err(_) => (host, None),
        },
        None => (host, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: Option<&str>) -> CgiRequest {
        CgiRequest {
            method: "GET".into(),
            path: path.into(),
            query: query.map(Into::into),
            headers: vec![
                ("Host".into(), "example.com:3000".into()),
                ("User-Agent".into(), "test".into()),
                ("Authorization".into(), "Bearer secret".into()),
                ("Connection".into(), "keep-alive".into()),
            ],
            host: "example.com:3000".into(),
            scheme: "http".into(),
            protocol: "HTTP/1.1".into(),
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            body: Bytes::new(),
        }
    }

    #[test]
    fn test_exact_route_env() {
        let env = build_env(&request("/hello", None), "/hello");

        assert_eq!(env.get("PATH_INFO"), Some(""));
        assert_eq!(env.get("PATH_TRANSLATED"), Some(""));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/hello"));
        assert_eq!(env.get("X_MATCHED_ROUTE"), Some("/hello"));
        assert_eq!(env.get("GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(env.get("SERVER_SOFTWARE"), Some("WAGI/1"));
        assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
        assert_eq!(env.get("SERVER_PORT"), Some("3000"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("127.0.0.1"));
        assert_eq!(env.get("REMOTE_HOST"), Some("127.0.0.1"));
        assert_eq!(env.get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(env.get("AUTH_TYPE"), Some(""));
        assert_eq!(env.get("REMOTE_USER"), Some(""));
        assert_eq!(env.get("QUERY_STRING"), Some(""));
        assert_eq!(
            env.get("X_FULL_URL"),
            Some("http://example.com:3000/hello")
        );
    }

    #[test]
    fn test_wildcard_route_env() {
        let env = build_env(&request("/prefix/a/b", Some("x=1")), "/prefix/...");

        assert_eq!(env.get("PATH_INFO"), Some("/a/b"));
        assert_eq!(env.get("X_RAW_PATH_INFO"), Some("%2Fa%2Fb"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/prefix"));
        assert_eq!(env.get("X_MATCHED_ROUTE"), Some("/prefix/..."));
        assert_eq!(env.get("QUERY_STRING"), Some("x=1"));
        assert_eq!(
            env.get("X_FULL_URL"),
            Some("http://example.com:3000/prefix%2Fa%2Fb?x=1")
        );
    }

    #[test]
    fn test_root_wildcard() {
        let req = request("/anything/here", None);
        assert_eq!(path_info(&req, "/..."), "/anything/here");
        assert_eq!(script_name("/..."), "/");
        assert_eq!(script_name("/"), "/");
    }

    #[test]
    fn test_headers_forwarded() {
        let env = build_env(&request("/", None), "/");

        assert_eq!(env.get("HTTP_USER_AGENT"), Some("test"));
        assert_eq!(env.get("HTTP_HOST"), Some("example.com:3000"));
        assert!(!env.contains("HTTP_AUTHORIZATION"));
        assert!(!env.contains("HTTP_CONNECTION"));
    }

    #[test]
    fn test_repeated_headers_joined() {
        let mut req = request("/", None);
        req.headers.push(("Accept".into(), "text/html".into()));
        req.headers.push(("accept".into(), "text/plain".into()));

        let env = build_env(&req, "/");
        assert_eq!(env.get("HTTP_ACCEPT"), Some("text/html,text/plain"));
    }

    #[test]
    fn test_content_vars_only_with_body() {
        let env = build_env(&request("/", None), "/");
        assert!(!env.contains("CONTENT_LENGTH"));
        assert!(!env.contains("CONTENT_TYPE"));

        let mut req = request("/", None);
        req.method = "POST".into();
        req.body = Bytes::from_static(b"a=1&b=2");
        req.headers
            .push(("Content-Type".into(), "application/x-www-form-urlencoded".into()));

        let env = build_env(&req, "/");
        assert_eq!(env.get("CONTENT_LENGTH"), Some("7"));
        assert_eq!(
            env.get("CONTENT_TYPE"),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_default_port() {
        let mut req = request("/", None);
        req.host = "example.com".into();
        let env = build_env(&req, "/");
        assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
        assert_eq!(env.get("SERVER_PORT"), Some("80"));
    }

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("localhost"), ("localhost", None));
        assert_eq!(split_host("localhost:8080"), ("localhost", Some(8080)));
        assert_eq!(split_host("[::1]:3000"), ("::1", Some(3000)));
        assert_eq!(split_host("[::1]"), ("::1", None));
    }

    #[test]
    fn test_args_default() {
        let req = request("/fibonacci", Some("23"));
        assert_eq!(build_args(&req, "/fibonacci", None), vec!["", "23"]);

        let req = request("/files/a%20b", Some("name=hello+world&x=%26"));
        assert_eq!(
            build_args(&req, "/files/...", None),
            vec!["/a b", "name=hello world", "x=&"]
        );

        let req = request("/hello", None);
        assert_eq!(build_args(&req, "/hello", None), vec![""]);
    }

    #[test]
    fn test_args_template() {
        let req = request("/script", Some("a&b"));
        assert_eq!(
            build_args(&req, "/script", Some("python ${SCRIPT_NAME} ${ARGS}")),
            vec!["python", "/script", "a", "b"]
        );
    }

    #[test]
    fn test_env_set_replaces() {
        let mut env = CgiEnvironment::default();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(
            env.vars(),
            &[
                ("A".to_string(), "3".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
    }
}
