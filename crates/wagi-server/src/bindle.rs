//! Bindle resolution.
//!
//! A bindle is a package of modules and supporting files described by an
//! invoice. [`BindleResolver`] turns a configured bindle into ordinary module
//! entries whose files live in a local cache under the module path:
//!
//! ```text
//! <module_path>/<parcel sha256>/<parcel name>        module parcels
//! <module_path>/<parcel sha256>/<bindle name>/...    files, mounted at /
//! ```
//!
//! Invoices and parcel content come from a [`BindleSource`]: a local
//! directory (`file://` server URL) or a Bindle HTTP server.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use wagi_common::{BindleInfo, ModuleInfo, WagiConfig};

/// Media type of module parcels.
pub const WASM_MEDIA_TYPE: &str = "application/wasm";

/// Feature group carrying WAGI parcel settings.
const WAGI_FEATURE: &str = "wagi";

/// Bindle resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum BindleError {
    /// No bindle server is configured.
    #[error("No bindle server configured for bindle '{name}'")]
    NotConfigured { name: String },

    /// An invoice or parcel could not be fetched.
    #[error("Failed to fetch '{what}': {reason}")]
    Fetch { what: String, reason: String },

    /// The invoice could not be parsed.
    #[error("Invalid invoice for bindle '{name}': {reason}")]
    InvalidInvoice { name: String, reason: String },

    /// A parcel name escapes its cache directory.
    #[error("Attempt to traverse file system with path {path}")]
    PathTraversal { path: String },

    /// A parcel could not be written to the cache.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BindleError {
    fn fetch(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Fetch {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// A bindle invoice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Invoice {
    /// Parcels in the bindle.
    #[serde(default, rename = "parcel")]
    pub parcels: Vec<Parcel>,
}

/// One parcel of a bindle.
#[derive(Debug, Clone, Deserialize)]
pub struct Parcel {
    /// Parcel metadata.
    pub label: Label,

    /// Group membership.
    #[serde(default)]
    pub conditions: Conditions,
}

/// Parcel metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Content digest, also the parcel id.
    pub sha256: String,

    /// Media type, e.g. `application/wasm`.
    pub media_type: String,

    /// File name.
    pub name: String,

    /// Feature groups of string settings.
    #[serde(default)]
    pub feature: BTreeMap<String, BTreeMap<String, String>>,
}

/// Parcel group conditions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Groups this parcel belongs to.
    #[serde(default)]
    pub member_of: Vec<String>,

    /// Groups this parcel needs.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl Parcel {
    fn wagi_feature(&self, key: &str) -> Option<&str> {
        self.label
            .feature
            .get(WAGI_FEATURE)
            .and_then(|f| f.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// A top-level module parcel.
    fn is_module(&self) -> bool {
        self.label.media_type == WASM_MEDIA_TYPE && self.conditions.member_of.is_empty()
    }

    /// A supporting file for a module.
    fn is_file(&self) -> bool {
        self.wagi_feature("file")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

impl Invoice {
    /// Parse an invoice document.
    pub fn from_toml(name: &str, content: &str) -> Result<Self, BindleError> {
        toml::from_str(content).map_err(|e| BindleError::InvalidInvoice {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Where invoices and parcels come from.
///
/// Implementations block; they are called while the route table is built.
pub trait BindleSource: Send + Sync {
    /// Fetch the invoice of a bindle.
    fn invoice(&self, bindle: &str) -> Result<Invoice, BindleError>;

    /// Fetch the content of one parcel.
    fn parcel(&self, bindle: &str, sha256: &str) -> Result<Bytes, BindleError>;
}

/// A bindle directory on local disk.
///
/// Layout: `<root>/<bindle>/invoice.toml` and `<root>/<bindle>/parcels/<sha256>`.
#[derive(Debug, Clone)]
pub struct FileBindleSource {
    root: PathBuf,
}

impl FileBindleSource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bindle_dir(&self, bindle: &str) -> Result<PathBuf, BindleError> {
        Ok(self.root.join(checked_relative(bindle)?))
    }
}

impl BindleSource for FileBindleSource {
    fn invoice(&self, bindle: &str) -> Result<Invoice, BindleError> {
        let path = self.bindle_dir(bindle)?.join("invoice.toml");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BindleError::fetch(path.display().to_string(), e))?;
        Invoice::from_toml(bindle, &content)
    }

    fn parcel(&self, bindle: &str, sha256: &str) -> Result<Bytes, BindleError> {
        let path = self
            .bindle_dir(bindle)?
            .join("parcels")
            .join(checked_relative(sha256)?);
        std::fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| BindleError::fetch(path.display().to_string(), e))
    }
}

/// A Bindle HTTP server.
///
/// Invoices are read from `<base>/_i/<bindle>` and parcels from
/// `<base>/_i/<bindle>@<sha256>`.
#[derive(Debug, Clone)]
pub struct HttpBindleSource {
    client: Client,
    base: Url,
}

impl HttpBindleSource {
    /// Create a source for the server at `base`.
    pub fn new(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn url(&self, path: &str) -> Result<Url, BindleError> {
        let base = self.base.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/_i/{path}")).map_err(|e| BindleError::fetch(path, e))
    }

    fn get(&self, path: &str) -> Result<Bytes, BindleError> {
        let url = self.url(path)?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BindleError::fetch(url.as_str(), e))?;
        let client = self.client.clone();

        handle.block_on(async move {
            let response = client
                .get(url.clone())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| BindleError::fetch(url.as_str(), e))?;
            response
                .bytes()
                .await
                .map_err(|e| BindleError::fetch(url.as_str(), e))
        })
    }
}

impl BindleSource for HttpBindleSource {
    fn invoice(&self, bindle: &str) -> Result<Invoice, BindleError> {
        let body = self.get(bindle)?;
        Invoice::from_toml(bindle, &String::from_utf8_lossy(&body))
    }

    fn parcel(&self, bindle: &str, sha256: &str) -> Result<Bytes, BindleError> {
        self.get(&format!("{bindle}@{sha256}"))
    }
}

/// Turns configured bindles into module entries.
pub trait BindleResolver: Send + Sync {
    /// Resolve one bindle into `(logical name, module)` pairs.
    fn resolve(&self, key: &str, bindle: &BindleInfo)
    -> Result<Vec<(String, ModuleInfo)>, BindleError>;
}

/// Resolver used when no bindle server is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBindleResolver;

impl BindleResolver for NoBindleResolver {
    fn resolve(
        &self,
        _key: &str,
        bindle: &BindleInfo,
    ) -> Result<Vec<(String, ModuleInfo)>, BindleError> {
        Err(BindleError::NotConfigured {
            name: bindle.name.clone(),
        })
    }
}

/// Resolves bindles by caching their parcels on local disk.
#[derive(Debug)]
pub struct ParcelResolver<S> {
    source: S,
    cache_dir: PathBuf,
}

impl<S: BindleSource> ParcelResolver<S> {
    /// Create a resolver writing parcels under `cache_dir`.
    ///
    /// `cache_dir` must be the configuration's module path: module filenames
    /// are returned relative to it, the way configured modules name theirs.
    pub fn new(source: S, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
        }
    }

    /// Write a parcel to `dir/name` unless it is already cached.
    fn fetch_parcel(
        &self,
        dir: &Path,
        bindle: &str,
        label: &Label,
    ) -> Result<PathBuf, BindleError> {
        let path = dir.join(checked_relative(&label.name)?);
        if path.is_file() {
            debug!(path = %path.display(), "Parcel already cached");
            return Ok(path);
        }

        let content = self.source.parcel(bindle, &label.sha256)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &content)?;
        debug!(path = %path.display(), bytes = content.len(), "Parcel written");
        Ok(path)
    }
}

impl<S: BindleSource> BindleResolver for ParcelResolver<S> {
    #[instrument(skip(self, bindle), fields(bindle = %bindle.name))]
    fn resolve(
        &self,
        key: &str,
        bindle: &BindleInfo,
    ) -> Result<Vec<(String, ModuleInfo)>, BindleError> {
        let invoice = self.source.invoice(&bindle.name)?;
        let mut modules = Vec::new();

        for parcel in invoice.parcels.iter().filter(|p| p.is_module()) {
            let module_dir = self.cache_dir.join(checked_relative(&parcel.label.sha256)?);
            let path = self.fetch_parcel(&module_dir, &bindle.name, &parcel.label)?;
            let filename = path.strip_prefix(&self.cache_dir).unwrap_or(&path);

            let mut info = ModuleInfo {
                route: compose_route(&bindle.route, parcel.wagi_feature("route").unwrap_or("/")),
                filename: filename.display().to_string(),
                entrypoint: parcel.wagi_feature("entrypoint").map(str::to_string),
                allowed_hosts: parcel
                    .wagi_feature("allowed_hosts")
                    .map(|hosts| {
                        hosts
                            .split(',')
                            .map(str::trim)
                            .filter(|h| !h.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                environment: bindle.environment.clone(),
                hostnames: bindle.hostnames.clone(),
                ..ModuleInfo::default()
            };

            let asset_dir = module_dir.join(checked_relative(&bindle.name)?);
            for group in &parcel.conditions.requires {
                let members = invoice
                    .parcels
                    .iter()
                    .filter(|p| p.conditions.member_of.contains(group) && p.is_file());
                for member in members {
                    self.fetch_parcel(&asset_dir, &bindle.name, &member.label)?;
                    if info.volumes.is_empty() {
                        info.volumes
                            .insert("/".to_string(), asset_dir.display().to_string());
                    }
                }
            }

            let name = format!("{key}:{}", parcel.label.name);
            info!(module = %name, route = %info.route, "Resolved bindle parcel");
            modules.push((name, info));
        }

        Ok(modules)
    }
}

/// Pick a resolver for the configured bindle server.
pub fn resolver_for(config: &WagiConfig, client: &Client) -> Arc<dyn BindleResolver> {
    let Some(server) = config.bindle_server.as_deref() else {
        return Arc::new(NoBindleResolver);
    };

    let cache_dir = config.module_path();
    match Url::parse(server) {
        Ok(url) if url.scheme() == "file" => match url.to_file_path() {
            Ok(root) => Arc::new(ParcelResolver::new(FileBindleSource::new(root), cache_dir)),
            Err(()) => {
                warn!(server = %server, "Bindle server path is not a local path");
                Arc::new(NoBindleResolver)
            }
        },
        Ok(url) if matches!(url.scheme(), "http" | "https") => Arc::new(ParcelResolver::new(
            HttpBindleSource::new(client.clone(), url),
            cache_dir,
        )),
        Ok(url) => {
            warn!(scheme = %url.scheme(), "Unsupported bindle server scheme");
            Arc::new(NoBindleResolver)
        }
        Err(e) => {
            warn!(server = %server, error = %e, "Invalid bindle server URL");
            Arc::new(NoBindleResolver)
        }
    }
}

/// Configured modules plus the modules of every resolvable bindle.
///
/// A bindle that fails to resolve is logged and skipped, as is any bindle
/// module whose logical name is already taken.
pub fn merge_bindles(
    config: &WagiConfig,
    resolver: &dyn BindleResolver,
) -> BTreeMap<String, ModuleInfo> {
    let mut modules = config.modules.clone();

    for (key, bindle) in &config.bindles {
        match resolver.resolve(key, bindle) {
            Ok(entries) => {
                for (name, info) in entries {
                    if modules.contains_key(&name) {
                        warn!(module = %name, bindle = %bindle.name, "Duplicate module name, skipping bindle module");
                        continue;
                    }
                    modules.insert(name, info);
                }
            }
            Err(e) => {
                error!(bindle = %bindle.name, error = %e, "Failed to resolve bindle, skipping");
            }
        }
    }

    modules
}

/// `prefix + suffix`, where a `/` suffix leaves the prefix unchanged.
fn compose_route(prefix: &str, suffix: &str) -> String {
    if suffix == "/" {
        return prefix.to_string();
    }
    format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        suffix.trim_start_matches('/')
    )
}

/// A relative path that stays inside its base directory.
fn checked_relative(name: &str) -> Result<&Path, BindleError> {
    let path = Path::new(name);
    let contained = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if contained {
        Ok(path)
    } else {
        Err(BindleError::PathTraversal {
            path: name.to_string(),
        })
    }
}
