//! Per-request WAGI execution.
//!
//! [`WagiHost`] ties the pieces together for one request:
//!
//! 1. Resolve the compiled module
//! 2. Translate the request into environment, argv and stdin
//! 3. Run the entrypoint on the calling (blocking) thread
//! 4. Drain stderr into the log
//! 5. Parse the header block from stdout and hand back a streaming body

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use wagi_common::RuntimeError;

use crate::cgi::{self, CgiEnvironment, CgiRequest};
use crate::endpoint::{ModuleSpec, ROUTES_EXPORT};
use crate::output::{self, ParsedResponse, ResponseBody};
use crate::store::{ExecutionContext, WorkerContext};
use crate::temp::TempResource;
use crate::{InstanceRunner, ModuleResolver};

/// A guest's answer: status and headers parsed, body still on disk.
#[derive(Debug)]
pub struct WagiResponse {
    /// Parsed status and headers.
    pub head: ParsedResponse,

    /// Remaining guest output.
    pub body: ResponseBody,

    /// Wall-clock duration of the guest call.
    pub duration: Duration,
}

/// One sub-route declared by a module's `_routes` export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRoute {
    /// Route suffix, composed with the parent route's prefix.
    pub route: String,

    /// Entrypoint serving the route.
    pub entrypoint: String,
}

/// Executes WAGI modules.
///
/// Cheap to share behind an [`Arc`]; every call gets its own store, stdio
/// files and outbound HTTP session.
#[derive(Debug)]
pub struct WagiHost {
    resolver: Arc<ModuleResolver>,
    runner: InstanceRunner,
    client: Client,
}

impl WagiHost {
    /// Create a host.
    ///
    /// `client` is shared by the outbound HTTP sessions of all requests.
    pub fn new(resolver: Arc<ModuleResolver>, runner: InstanceRunner, client: Client) -> Self {
        Self {
            resolver,
            runner,
            client,
        }
    }

    /// The module cache.
    pub fn resolver(&self) -> &Arc<ModuleResolver> {
        &self.resolver
    }

    /// The instance runner.
    pub fn runner(&self) -> &InstanceRunner {
        &self.runner
    }

    /// The HTTP client shared by outbound sessions.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Run a module for a request on a blocking worker.
    ///
    /// # Errors
    ///
    /// Same as [`WagiHost::execute`].
    pub async fn handle(
        self: Arc<Self>,
        spec: Arc<ModuleSpec>,
        route: String,
        request: CgiRequest,
        request_id: String,
    ) -> Result<WagiResponse, RuntimeError> {
        tokio::task::spawn_blocking(move || self.execute(&spec, &route, &request, &request_id))
            .await
            .map_err(|e| RuntimeError::trap(format!("Execution task failed: {e}")))?
    }

    /// Run a module for a request, blocking the calling thread.
    ///
    /// `route` is the pattern the request matched, wildcard marker included.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be loaded or run, or if its
    /// output is not a valid WAGI response.
    #[instrument(
        skip(self, spec, request),
        fields(module = %spec.path.display(), entrypoint = %spec.entrypoint)
    )]
    pub fn execute(
        &self,
        spec: &ModuleSpec,
        route: &str,
        request: &CgiRequest,
        request_id: &str,
    ) -> Result<WagiResponse, RuntimeError> {
        let env = cgi::build_env(request, route);
        let args = cgi::build_args(request, route, spec.argv.as_deref());

        let (duration, stdout) = self.invoke(spec, env, args, request.body.clone(), request_id)?;

        let head = output::parse_response(stdout.reopen()?, self.runner.config().max_header_bytes)?;
        debug!(
            status = head.status,
            headers = head.headers.len(),
            "Parsed response headers"
        );

        let body = ResponseBody::open(stdout, head.body_offset)?;
        Ok(WagiResponse {
            head,
            body,
            duration,
        })
    }

    /// Ask a module for its sub-routes.
    ///
    /// Runs the `_routes` export in a throwaway instance with an empty
    /// request. A module without the export declares no sub-routes.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be loaded or the export fails.
    #[instrument(skip(self, spec), fields(module = %spec.path.display()))]
    pub fn query_routes(&self, spec: &ModuleSpec) -> Result<Vec<SubRoute>, RuntimeError> {
        let module = self.resolver.get_module(&spec.path)?;
        if !module.exports_function(ROUTES_EXPORT) {
            return Ok(Vec::new());
        }

        let spec = spec.with_entrypoint(ROUTES_EXPORT);
        let (_, stdout) = self.invoke(
            &spec,
            CgiEnvironment::default(),
            vec![ROUTES_EXPORT.to_string()],
            Bytes::new(),
            ROUTES_EXPORT,
        )?;

        let routes = parse_sub_routes(BufReader::new(stdout.reopen()?))?;
        info!(count = routes.len(), "Module declared sub-routes");
        Ok(routes)
    }

    /// Run the module's entrypoint, returning the duration and the stdout file.
    fn invoke(
        &self,
        spec: &ModuleSpec,
        env: CgiEnvironment,
        args: Vec<String>,
        stdin: Bytes,
        request_id: &str,
    ) -> Result<(Duration, TempResource), RuntimeError> {
        let module = self.resolver.get_module(&spec.path)?;

        let context = ExecutionContext::new(env, args, &stdin)?
            .with_environment(&spec.environment)
            .with_volumes(&spec.volumes);
        let worker = WorkerContext::new(
            context.build_wasi()?,
            spec.http_proxy(&self.client),
            request_id,
        );

        let result = self.runner.run(&module, &spec.entrypoint, worker);

        // Stderr is logged whether or not the call succeeded.
        drain_stderr(&context.stderr, spec);

        let duration = result?;
        Ok((duration, context.stdout))
    }
}

/// Log each non-empty stderr line as a warning.
fn drain_stderr(stderr: &TempResource, spec: &ModuleSpec) {
    let file = match stderr.reopen() {
        Ok(file) => file,
        Err(e) => {
            warn!(error = %e, "Failed to read module stderr");
            return;
        }
    };

    for line in BufReader::new(file).split(b'\n') {
        let Ok(line) = line else { break };
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if !text.is_empty() {
            warn!(
                module = %spec.path.display(),
                entrypoint = %spec.entrypoint,
                "{text}"
            );
        }
    }
}

/// Parse `route entrypoint` lines.
///
/// Blank lines are skipped. A line with only a route is logged and skipped;
/// tokens past the entrypoint are ignored.
fn parse_sub_routes(output: impl BufRead) -> Result<Vec<SubRoute>, RuntimeError> {
    let mut routes = Vec::new();

    for line in output.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(route) = parts.next() else { continue };

        match parts.next() {
            Some(entrypoint) => routes.push(SubRoute {
                route: route.to_string(),
                entrypoint: entrypoint.to_string(),
            }),
            None => warn!(line = %line, "Sub-route without an entrypoint"),
        }
    }

    Ok(routes)
}
