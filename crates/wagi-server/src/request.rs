//! HTTP request conversion for module execution.
//!
//! This module converts an axum request into the framework-independent
//! [`CgiRequest`] the WAGI translator works from.

use std::net::IpAddr;

use axum::http::header::HOST;
use axum::http::request::Parts;
use bytes::Bytes;

use wagi_core::CgiRequest;

/// The `Host` a request was addressed to.
///
/// Taken from the `Host` header, falling back to the URI authority.
pub fn request_host(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(ToString::to_string))
}

/// Build a [`CgiRequest`] from request parts and the collected body.
///
/// Header values that are not valid UTF-8 are dropped.
pub fn cgi_request(parts: &Parts, body: Bytes, remote_addr: Option<IpAddr>) -> CgiRequest {
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    CgiRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers,
        host: request_host(parts).unwrap_or_default(),
        scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
        protocol: format!("{:?}", parts.version),
        remote_addr,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request};

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn test_cgi_request() {
        let parts = parts(
            Request::builder()
                .method(Method::POST)
                .uri("/api/users?id=7&sort")
                .header("Host", "example.com:3000")
                .header("Content-Type", "application/json")
                .body(())
                .unwrap(),
        );

        let body = Bytes::from(r#"{"name": "test"}"#);
        let req = cgi_request(&parts, body, Some("10.0.0.1".parse().unwrap()));

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/users");
        assert_eq!(req.query.as_deref(), Some("id=7&sort"));
        assert_eq!(req.host, "example.com:3000");
        assert_eq!(req.scheme, "http");
        assert_eq!(req.protocol, "HTTP/1.1");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.body.len(), 16);
    }

    #[test]
    fn test_host_from_authority() {
        let parts = parts(
            Request::builder()
                .uri("http://internal:8080/")
                .body(())
                .unwrap(),
        );
        assert_eq!(request_host(&parts).as_deref(), Some("internal:8080"));
    }

    #[test]
    fn test_no_host() {
        let parts = parts(Request::builder().uri("/").body(()).unwrap());
        assert!(request_host(&parts).is_none());
        assert_eq!(cgi_request(&parts, Bytes::new(), None).host, "");
    }
}
