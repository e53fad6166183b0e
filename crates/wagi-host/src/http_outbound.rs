//! Outbound HTTP on behalf of guest modules.
//!
//! [`HttpProxy`] holds the state behind the `wasi_experimental_http` host
//! functions for one module instance: the permission set, the shared
//! connection-pooled client, and the table of open responses keyed by handle.
//! Every failure is a [`ProxyError`], which maps onto the fixed integer codes
//! returned across the ABI.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::Permissions;

/// Methods a guest may use.
pub const ALLOWED_METHODS: [&str; 8] = [
    "DELETE", "GET", "HEAD", "OPTIONS", "PATCH", "POST", "PUT", "TRACE",
];

/// Errors surfaced to the guest as integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("memory not found")]
    MemoryNotFound,
    #[error("memory access error")]
    MemoryAccess,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("header not found")]
    HeaderNotFound,
    #[error("invalid utf-8")]
    Utf8,
    #[error("destination not allowed")]
    DestinationNotAllowed,
    #[error("invalid method")]
    InvalidMethod,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid url")]
    InvalidUrl,
    #[error("request failed")]
    RequestFailed,
    #[error("runtime error")]
    Runtime,
    #[error("too many sessions")]
    TooManySessions,
}

impl ProxyError {
    /// The code returned to the guest.
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidHandle => 1,
            Self::MemoryNotFound => 2,
            Self::MemoryAccess => 3,
            Self::BufferTooSmall => 4,
            Self::HeaderNotFound => 5,
            Self::Utf8 => 6,
            Self::DestinationNotAllowed => 7,
            Self::InvalidMethod => 8,
            Self::InvalidEncoding => 9,
            Self::InvalidUrl => 10,
            Self::RequestFailed => 11,
            Self::Runtime => 12,
            Self::TooManySessions => 13,
        }
    }
}

/// A buffered response held open for the guest.
#[derive(Debug)]
struct OutboundResponse {
    headers: HeaderMap,
    body: Bytes,
    position: usize,
}

/// Per-instance outbound HTTP state.
///
/// Each request that executes a module owns its own proxy; nothing here is
/// shared between instances except the pooled [`Client`].
#[derive(Debug)]
pub struct HttpProxy {
    client: Client,
    permissions: Permissions,
    responses: HashMap<u32, OutboundResponse>,
    last_handle: u32,
}

impl HttpProxy {
    /// Create a proxy for one module instance.
    pub fn new(client: Client, permissions: Permissions) -> Self {
        Self {
            client,
            permissions,
            responses: HashMap::new(),
            last_handle: 0,
        }
    }

    /// Build the shared client used by every proxy.
    pub fn default_client() -> reqwest::Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("wagi/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    /// The permissions this proxy enforces.
    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Number of responses currently open.
    pub fn open_responses(&self) -> usize {
        self.responses.len()
    }

    /// Perform a request and register its response.
    ///
    /// Blocks the calling thread on the ambient tokio runtime; call it from a
    /// blocking worker. Returns the status code and the new handle.
    pub fn request(
        &mut self,
        url: &str,
        method: &str,
        headers: &str,
        body: &[u8],
    ) -> Result<(u16, u32), ProxyError> {
        let url = self.validate_url(url)?;
        let method = validate_method(method)?;
        let headers = parse_request_headers(headers)?;

        if self.responses.len() >= self.permissions.max_open_responses() as usize {
            warn!(
                open = self.responses.len(),
                max = self.permissions.max_open_responses(),
                "Too many open outbound responses"
            );
            return Err(ProxyError::TooManySessions);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            warn!(error = %e, "No async runtime available for outbound request");
            ProxyError::Runtime
        })?;

        debug!(method = %method, url = %url, "Executing outbound request");

        let request = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .body(body.to_vec());

        let (status, headers, body) = runtime
            .block_on(async move {
                let response = request.send().await?;
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let body = response.bytes().await?;
                Ok::<_, reqwest::Error>((status, headers, body))
            })
            .map_err(|e| {
                warn!(url = %url, error = %e, "Outbound request failed");
                ProxyError::RequestFailed
            })?;

        self.last_handle = self.last_handle.checked_add(1).ok_or(ProxyError::Runtime)?;
        let handle = self.last_handle;
        self.responses.insert(
            handle,
            OutboundResponse {
                headers,
                body,
                position: 0,
            },
        );

        info!(
            url = %url,
            status = status,
            handle = handle,
            "Outbound request completed"
        );

        Ok((status, handle))
    }

    /// Look up one response header, joining repeated values with `;`.
    pub fn header_get(&self, handle: u32, name: &str) -> Result<String, ProxyError> {
        let response = self.response(handle)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| ProxyError::HeaderNotFound)?;

        let values = response
            .headers
            .get_all(&name)
            .iter()
            .map(|v| v.to_str().map_err(|_| ProxyError::InvalidEncoding))
            .collect::<Result<Vec<_>, _>>()?;

        if values.is_empty() {
            trace!(handle = handle, header = %name, "Header not found");
            return Err(ProxyError::HeaderNotFound);
        }

        Ok(values.join(";"))
    }

    /// Serialize every response header as `Name:v1;v2\n` lines.
    pub fn headers_get_all(&self, handle: u32) -> Result<String, ProxyError> {
        let response = self.response(handle)?;
        let mut out = String::new();

        for name in response.headers.keys() {
            let values = response
                .headers
                .get_all(name)
                .iter()
                .map(|v| v.to_str().map_err(|_| ProxyError::InvalidEncoding))
                .collect::<Result<Vec<_>, _>>()?;
            out.push_str(name.as_str());
            out.push(':');
            out.push_str(&values.join(";"));
            out.push('\n');
        }

        Ok(out)
    }

    /// Read up to `max` body bytes, advancing the handle's cursor.
    ///
    /// An empty slice means the body is exhausted.
    pub fn body_read(&mut self, handle: u32, max: usize) -> Result<&[u8], ProxyError> {
        let response = self
            .responses
            .get_mut(&handle)
            .ok_or(ProxyError::InvalidHandle)?;

        let start = response.position;
        let end = start.saturating_add(max).min(response.body.len());
        response.position = end;
        Ok(&response.body[start..end])
    }

    /// Release a response.
    pub fn close(&mut self, handle: u32) -> Result<(), ProxyError> {
        self.responses
            .remove(&handle)
            .map(|_| trace!(handle = handle, "Outbound response closed"))
            .ok_or(ProxyError::InvalidHandle)
    }

    fn response(&self, handle: u32) -> Result<&OutboundResponse, ProxyError> {
        self.responses.get(&handle).ok_or(ProxyError::InvalidHandle)
    }

    fn validate_url(&self, url: &str) -> Result<Url, ProxyError> {
        if url.is_empty() {
            return Err(ProxyError::InvalidUrl);
        }

        let parsed = Url::parse(url).map_err(|_| ProxyError::InvalidUrl)?;
        if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
            return Err(ProxyError::InvalidUrl);
        }

        if !self.permissions.is_url_allowed(&parsed) {
            warn!(
                host = parsed.host_str().unwrap_or_default(),
                "Outbound request blocked: host not allowed"
            );
            return Err(ProxyError::DestinationNotAllowed);
        }

        Ok(parsed)
    }
}

fn validate_method(method: &str) -> Result<Method, ProxyError> {
    let upper = method.trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&upper.as_str()) {
        return Err(ProxyError::InvalidMethod);
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| ProxyError::InvalidMethod)
}

/// Parse a newline-delimited `Name: value` header block.
fn parse_request_headers(raw: &str) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(ProxyError::InvalidEncoding)?;
        let name =
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| ProxyError::InvalidEncoding)?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| ProxyError::InvalidEncoding)?;
        headers.append(name, value);
    }

    Ok(headers)
}
