//! Resolved module endpoints.

use std::collections::BTreeMap;
use std::path::PathBuf;

use reqwest::Client;

use wagi_common::modules::MAX_HTTP_REQUEST_LIMIT;
use wagi_common::{ModuleInfo, WagiConfig};
use wagi_host::{HttpProxy, Permissions};

/// Entrypoint invoked when none is configured.
pub const DEFAULT_ENTRYPOINT: &str = "_start";

/// Export a module may provide to declare sub-routes.
pub const ROUTES_EXPORT: &str = "_routes";

/// Everything needed to invoke a module for a request.
///
/// Immutable once a route table has been built around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Module file on disk.
    pub path: PathBuf,

    /// Exported function to call.
    pub entrypoint: String,

    /// Argument template replacing the default argv.
    pub argv: Option<String>,

    /// Guest path to host path directory mappings.
    pub volumes: BTreeMap<String, String>,

    /// Extra environment variables.
    pub environment: BTreeMap<String, String>,

    /// Absolute URIs the module may reach through outbound HTTP.
    pub allowed_hosts: Vec<String>,

    /// Cap on simultaneously open outbound responses.
    pub max_http_requests: u32,

    /// Accepted HTTP method, upper-cased.
    pub http_method: String,

    /// Require an authenticated caller.
    pub authorize: bool,

    /// Roles, any of which grants access.
    pub roles: Vec<String>,

    /// Named authorization policies.
    pub policies: Vec<String>,
}

impl ModuleSpec {
    /// A spec for `path` with default settings.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            argv: None,
            volumes: BTreeMap::new(),
            environment: BTreeMap::new(),
            allowed_hosts: Vec::new(),
            max_http_requests: wagi_common::modules::DEFAULT_HTTP_REQUEST_LIMIT,
            http_method: "GET".to_string(),
            authorize: false,
            roles: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Build a spec from a configured module entry.
    ///
    /// The module file is resolved against the configuration's module path.
    pub fn from_config(config: &WagiConfig, info: &ModuleInfo) -> Self {
        Self {
            path: config.module_path().join(&info.filename),
            entrypoint: info.entrypoint().to_string(),
            argv: info.argv.clone(),
            volumes: info.volumes.clone(),
            environment: info.environment.clone(),
            allowed_hosts: info.allowed_hosts.clone(),
            max_http_requests: config.effective_http_request_limit(info),
            http_method: info.http_method(),
            authorize: info.authorize,
            roles: info.roles.clone(),
            policies: info.policies.clone(),
        }
    }

    /// The same module invoked through another entrypoint.
    #[must_use]
    pub fn with_entrypoint(&self, entrypoint: impl Into<String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            ..self.clone()
        }
    }

    /// Set the outbound request cap, clamped to the hard ceiling.
    #[must_use]
    pub fn with_max_http_requests(mut self, max: u32) -> Self {
        self.max_http_requests = max.clamp(1, MAX_HTTP_REQUEST_LIMIT);
        self
    }

    /// Returns `true` if the module may make outbound HTTP requests.
    pub fn allows_outbound_http(&self) -> bool {
        !self.allowed_hosts.is_empty()
    }

    /// Outbound HTTP permissions derived from the allow-list.
    pub fn permissions(&self) -> Permissions {
        Permissions::builder()
            .allow_uris(&self.allowed_hosts)
            .max_open_responses(self.max_http_requests)
            .build()
    }

    /// A fresh proxy for one invocation, if outbound HTTP is allowed.
    pub fn http_proxy(&self, client: &Client) -> Option<HttpProxy> {
        self.allows_outbound_http()
            .then(|| HttpProxy::new(client.clone(), self.permissions()))
    }
}
