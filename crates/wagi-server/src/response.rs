//! HTTP response conversion.
//!
//! Guest output becomes a streaming axum response; host-generated answers
//! (errors, 404, 405) use [`HostResponse`].

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use tokio_util::io::ReaderStream;
use tracing::warn;

use wagi_core::WagiResponse;

/// A response produced by the server itself rather than a guest.
#[derive(Debug, Clone)]
pub struct HostResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl HostResponse {
    /// Create a simple text response.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.as_bytes().to_vec(),
        }
    }

    /// Create an error response with JSON body.
    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::json!({
            "error": message
        })
        .to_string();

        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.into_bytes(),
        }
    }

    /// Add a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Convert to Axum response.
    pub fn into_axum_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                response.headers_mut().append(name, value);
            }
        }

        response
    }
}

/// Convert a guest response into a streaming axum response.
///
/// Headers the guest wrote that are not valid HTTP are logged and dropped.
/// Repeated headers are kept in order.
pub fn guest_response(response: WagiResponse) -> Response<Body> {
    let WagiResponse { head, body, .. } = response;

    let mut out = Response::new(Body::from_stream(ReaderStream::new(body)));
    *out.status_mut() = StatusCode::from_u16(head.status).unwrap_or_else(|_| {
        warn!(status = head.status, "Module returned an invalid status code");
        StatusCode::INTERNAL_SERVER_ERROR
    });

    for (name, value) in &head.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let resp = HostResponse::text(404, "Not Found");
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body, b"Not Found");
        assert_eq!(
            resp.headers[0],
            (
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string()
            )
        );
    }

    #[test]
    fn test_error_response() {
        let resp = HostResponse::error(500, "Internal server error");
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body, br#"{"error":"Internal server error"}"#);
    }

    #[test]
    fn test_with_header() {
        let resp = HostResponse::text(405, "Method Not Allowed").with_header("Allow", "POST");

        assert_eq!(resp.headers.len(), 2);
        assert_eq!(resp.headers[1], ("Allow".to_string(), "POST".to_string()));
    }

    #[test]
    fn test_into_axum_response() {
        let resp = HostResponse::text(405, "nope")
            .with_header("Allow", "GET")
            .with_header("bad header", "x")
            .into_axum_response();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()["allow"], "GET");
        assert_eq!(resp.headers().len(), 2);
    }

    #[test]
    fn test_invalid_status_falls_back() {
        let resp = HostResponse::text(1000, "x").into_axum_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
