//! Capability-based security for outbound HTTP.
//!
//! This module provides the [`Permissions`] struct, which defines which
//! destinations a guest module may reach and how many responses it may hold
//! open at once.

use std::collections::HashSet;

use url::Url;

/// Default cap on open response handles per module instance.
pub const DEFAULT_MAX_OPEN_RESPONSES: u32 = 10;

/// Outbound HTTP permissions for one module instance.
///
/// # Security Philosophy
///
/// - By default, nothing is allowed
/// - Each destination host must be explicitly granted
/// - Host matching is exact and case-insensitive; there are no wildcards
/// - Permissions are immutable during execution
#[derive(Debug, Clone)]
pub struct Permissions {
    /// Allowed destination hosts, lower-cased.
    allowed_hosts: HashSet<String>,

    /// Maximum simultaneously open response handles.
    max_open_responses: u32,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            allowed_hosts: HashSet::new(),
            max_open_responses: DEFAULT_MAX_OPEN_RESPONSES,
        }
    }
}

impl Permissions {
    /// Create a permission set that allows nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a builder for constructing permissions.
    pub fn builder() -> PermissionsBuilder {
        PermissionsBuilder::default()
    }

    /// Returns `true` if at least one destination is allowed.
    pub fn has_allowed_hosts(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    /// Maximum simultaneously open response handles.
    pub fn max_open_responses(&self) -> u32 {
        self.max_open_responses
    }

    /// Check if a request to the given URL is allowed.
    pub fn is_url_allowed(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| self.allowed_hosts.contains(&host.to_ascii_lowercase()))
    }
}

/// Builder for [`Permissions`].
#[derive(Debug, Default)]
pub struct PermissionsBuilder {
    inner: Permissions,
}

impl PermissionsBuilder {
    /// Allow requests to the hosts of the given absolute URIs.
    ///
    /// Entries that do not parse as absolute URIs, or that have no host,
    /// grant nothing.
    #[must_use]
    pub fn allow_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = uris
            .into_iter()
            .filter_map(|uri| Url::parse(uri.as_ref()).ok())
            .filter_map(|url| url.host_str().map(str::to_ascii_lowercase));
        self.inner.allowed_hosts.extend(hosts);
        self
    }

    /// Set the maximum number of simultaneously open responses.
    #[must_use]
    pub fn max_open_responses(mut self, max: u32) -> Self {
        self.inner.max_open_responses = max;
        self
    }

    /// Build the permissions.
    #[must_use]
    pub fn build(self) -> Permissions {
        self.inner
    }
}
