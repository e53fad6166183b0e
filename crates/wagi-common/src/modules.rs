//! The WAGI module and bindle configuration schema.
//!
//! [`WagiConfig`] maps logical names to [`ModuleInfo`] and [`BindleInfo`]
//! entries. It can be embedded in the `[wagi]` section of the main
//! configuration file or converted from a legacy `modules.toml`
//! (see [`WagiConfig::from_modules_toml`]).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::config_file::ConfigFileError;
use crate::error::ConfigError;

/// Default directory that module file names are resolved against.
pub const DEFAULT_MODULE_PATH: &str = "modules";

/// Default cap on open outbound HTTP responses per module instance.
pub const DEFAULT_HTTP_REQUEST_LIMIT: u32 = 10;

/// Hard ceiling for any configured outbound HTTP request limit.
pub const MAX_HTTP_REQUEST_LIMIT: u32 = 500;

/// Module configuration for one WAGI process.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WagiConfig {
    /// Directory module file names are relative to.
    #[serde(default)]
    pub module_path: Option<PathBuf>,

    /// Wasmtime compilation cache configuration file.
    #[serde(default)]
    pub cache_config_path: Option<PathBuf>,

    /// Base URL of the bindle server used to resolve `bindles`.
    #[serde(default)]
    pub bindle_server: Option<String>,

    /// Process-wide default for the outbound HTTP request limit.
    #[serde(default)]
    pub max_http_requests: Option<u32>,

    /// Modules keyed by logical name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleInfo>,

    /// Bindles keyed by logical name.
    #[serde(default)]
    pub bindles: BTreeMap<String, BindleInfo>,
}

/// One configured module.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleInfo {
    /// Route pattern; a trailing `/...` makes it a wildcard.
    #[serde(default)]
    pub route: String,

    /// Module file name, relative to `module_path`.
    #[serde(default, alias = "module", alias = "file_name")]
    pub filename: String,

    /// Exported function to invoke (default `_start`).
    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Argument template replacing the computed argv.
    ///
    /// Whitespace separated; `${SCRIPT_NAME}` and `${ARGS}` are expanded.
    #[serde(default)]
    pub argv: Option<String>,

    /// Guest path to host path directory mappings.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,

    /// Extra environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Accepted HTTP method (GET or POST, default GET).
    #[serde(default)]
    pub http_method: Option<String>,

    /// Absolute URIs the module may reach through outbound HTTP.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Cap on open outbound HTTP responses.
    #[serde(default)]
    pub max_http_requests: Option<u32>,

    /// Absolute URIs naming the hosts this route answers for.
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Require an authenticated caller.
    #[serde(default)]
    pub authorize: bool,

    /// Roles, any of which grants access.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Named authorization policies.
    #[serde(default)]
    pub policies: Vec<String>,
}

/// One configured bindle.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BindleInfo {
    /// Bindle name (`name/version`).
    #[serde(default, alias = "bindle_name")]
    pub name: String,

    /// Route prefix the bindle's parcels are mounted under.
    #[serde(default)]
    pub route: String,

    /// Extra environment variables for every module in the bindle.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Absolute URIs naming the hosts the routes answer for.
    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl WagiConfig {
    /// The effective module directory.
    pub fn module_path(&self) -> PathBuf {
        self.module_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_PATH))
    }

    /// The process-wide outbound HTTP request limit.
    pub fn default_http_request_limit(&self) -> u32 {
        match self.max_http_requests {
            Some(limit) if limit > 0 => limit.min(MAX_HTTP_REQUEST_LIMIT),
            _ => DEFAULT_HTTP_REQUEST_LIMIT,
        }
    }

    /// The outbound HTTP request limit for one module.
    ///
    /// A module override is honoured when it is positive and below the hard
    /// ceiling; otherwise the process-wide default applies.
    pub fn effective_http_request_limit(&self, module: &ModuleInfo) -> u32 {
        match module.max_http_requests {
            Some(limit) if limit > 0 && limit < MAX_HTTP_REQUEST_LIMIT => limit,
            _ => self.default_http_request_limit(),
        }
    }

    /// Returns `true` if neither modules nor bindles are configured.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty() && self.bindles.is_empty()
    }

    /// Validate the configuration, collecting every violation.
    ///
    /// A missing individual module file is not reported here; route table
    /// construction skips such modules with a warning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut report = ConfigError::new();
        let mut mappings = RouteMappings::default();
        let module_path = self.module_path();

        if !self.modules.is_empty() && !module_path.is_dir() {
            report.push(format!("Module Path not found {}", module_path.display()));
        }

        if let Some(cache) = &self.cache_config_path {
            if !cache.is_file() {
                report.push(format!(
                    "Wasmtime cache config file {} does not exist",
                    cache.display()
                ));
            }
        }

        match &self.bindle_server {
            Some(server) if Url::parse(server).is_err() => {
                report.push("Bindle Server is Invalid");
            }
            None if !self.bindles.is_empty() => {
                report.push("Bindle Server is not configured but there are bindle definitions");
            }
            _ => {}
        }

        if let Some(limit) = self.max_http_requests {
            if limit > MAX_HTTP_REQUEST_LIMIT {
                report.push(format!(
                    "MaxHttpRequests of {limit} not allowed - maximum is {MAX_HTTP_REQUEST_LIMIT}"
                ));
            }
        }

        for (name, module) in &self.modules {
            validate_module(name, module, &mut mappings, &mut report);
        }

        for (name, bindle) in &self.bindles {
            validate_bindle(name, bindle, self, &mut mappings, &mut report);
        }

        report.into_result()
    }

    /// Convert a legacy `modules.toml` document.
    ///
    /// The document is a `[[module]]` array; each entry's logical name is its
    /// route trimmed of `.` and `/`, or `root` for `/`.
    pub fn from_modules_toml(content: &str) -> Result<Self, ConfigFileError> {
        let legacy: LegacyModules = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;

        let mut modules = BTreeMap::new();
        for entry in legacy.module {
            let name = legacy_module_name(&entry.route);
            let info = ModuleInfo {
                route: entry.route,
                filename: entry.module,
                entrypoint: entry.entrypoint,
                argv: entry.argv,
                volumes: entry.volumes,
                allowed_hosts: entry.allowed_hosts,
                max_http_requests: entry.http_max_concurrency,
                ..ModuleInfo::default()
            };
            if modules.insert(name.clone(), info).is_some() {
                warn!(module = %name, "Duplicate module name in modules.toml, keeping the last entry");
            }
        }

        Ok(Self {
            module_path: Some(PathBuf::from(".")),
            modules,
            ..Self::default()
        })
    }

    /// Read and convert a legacy `modules.toml` file.
    pub fn from_modules_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut config = Self::from_modules_toml(&content)?;
        config.module_path = Some(
            path.parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        );
        Ok(config)
    }
}

impl ModuleInfo {
    /// The entrypoint to invoke.
    pub fn entrypoint(&self) -> &str {
        self.entrypoint.as_deref().unwrap_or("_start")
    }

    /// The accepted HTTP method, upper-cased.
    pub fn http_method(&self) -> String {
        self.http_method
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
            .to_ascii_uppercase()
    }
}

fn validate_module(
    name: &str,
    module: &ModuleInfo,
    mappings: &mut RouteMappings,
    report: &mut ConfigError,
) {
    if module.route.is_empty() {
        report.push(format!(
            "Route should not be null or empty for module name {name}"
        ));
        return;
    }

    if has_template_braces(&module.route) {
        report.push(format!(
            "Route '{}' cannot contain either {{ or }} - module name {name}",
            module.route
        ));
    }

    if module.filename.is_empty() {
        report.push(format!("Missing module file name for module name {name}"));
    } else if !has_module_extension(&module.filename) {
        report.push(format!(
            "Module Filename extension should be either .wat or .wasm Filename: {} for module name {name}",
            module.filename
        ));
    }

    if !matches!(module.http_method().as_str(), "GET" | "POST") {
        report.push(format!(
            "Module HttpMethod should be either GET or POST for module name {name}"
        ));
    }

    for host in &module.allowed_hosts {
        if Url::parse(host).is_err() {
            report.push(format!(
                "Invalid Uri for allowed host {host} for module name {name}"
            ));
        }
    }

    for hostname in &module.hostnames {
        if Url::parse(hostname).is_err() {
            report.push(format!(
                "Invalid Uri for hostname {hostname} for module name {name}"
            ));
        }
    }

    if mappings.insert(&module.route, &module.hostnames) {
        report.push(format!(
            "Attempt to associate Route '{}' with hostnames '{}' for Module name '{name}' failed, route is already mapped to one or more hosts",
            module.route,
            display_hostnames(&module.hostnames)
        ));
    }
}

fn validate_bindle(
    name: &str,
    bindle: &BindleInfo,
    config: &WagiConfig,
    mappings: &mut RouteMappings,
    report: &mut ConfigError,
) {
    if bindle.route.is_empty() {
        report.push(format!(
            "Route should not be null or empty for bindle {name}"
        ));
        return;
    }

    if has_template_braces(&bindle.route) {
        report.push(format!(
            "Bindle route '{}' cannot contain either {{ or }} for bindle {name}",
            bindle.route
        ));
    }

    if config.modules.contains_key(name) {
        report.push(format!(
            "Bindle '{name}' is a duplicate of a Module name - names must be unique"
        ));
    }

    if bindle.name.is_empty() {
        report.push(format!("Bindle Name missing for bindle {name}"));
    }

    if mappings.insert(&bindle.route, &bindle.hostnames) {
        report.push(format!(
            "Attempt to associate Route '{}' with hostnames '{}' for Bindle name '{name}' failed, route is already mapped to one or more hosts",
            bindle.route,
            display_hostnames(&bindle.hostnames)
        ));
    }
}

/// Returns `true` if the file name has a `.wasm` or `.wat` extension.
pub fn has_module_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wasm") || e.eq_ignore_ascii_case("wat"))
}

fn has_template_braces(route: &str) -> bool {
    route.contains('{') && route.contains('}')
}

fn display_hostnames(hostnames: &[String]) -> String {
    if hostnames.is_empty() {
        "*".to_string()
    } else {
        hostnames.join(",")
    }
}

fn legacy_module_name(route: &str) -> String {
    if route == "/" {
        "root".to_string()
    } else {
        route.trim_end_matches('.').trim_matches('/').to_string()
    }
}

/// Tracks which hostnames each normalized route is mapped to.
///
/// `*` stands for "any host" and conflicts with every later mapping.
#[derive(Default)]
struct RouteMappings {
    routes: HashMap<String, Vec<String>>,
}

impl RouteMappings {
    /// Record a mapping, returning `true` if it conflicts with an existing one.
    ///
    /// Only the same route on the same host conflicts; an any-host route and
    /// a host-specific route may share a path.
    fn insert(&mut self, route: &str, hostnames: &[String]) -> bool {
        let key = normalize_route_key(route);
        let hosts: Vec<String> = if hostnames.is_empty() {
            vec!["*".to_string()]
        } else {
            hostnames.iter().map(|h| h.to_ascii_lowercase()).collect()
        };

        let existing = self.routes.entry(key).or_default();
        let mut conflict = false;
        for host in hosts {
            if existing.contains(&host) {
                conflict = true;
            } else {
                existing.push(host);
            }
        }
        conflict
    }
}

fn normalize_route_key(route: &str) -> String {
    let trimmed = route.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Deserialize)]
struct LegacyModules {
    #[serde(default)]
    module: Vec<LegacyModule>,
}

#[derive(Deserialize)]
struct LegacyModule {
    route: String,
    module: String,
    #[serde(default)]
    entrypoint: Option<String>,
    #[serde(default)]
    volumes: BTreeMap<String, String>,
    #[serde(default)]
    allowed_hosts: Vec<String>,
    #[serde(default)]
    http_max_concurrency: Option<u32>,
    #[serde(default)]
    argv: Option<String>,
}
