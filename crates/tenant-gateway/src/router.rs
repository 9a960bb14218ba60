//! Tenant router
//!
//! Maps host names to handler units, creating and loading units lazily on
//! first request. A background change detector re-checks every registered
//! unit on each tick, reloading stale units and evicting those whose
//! deployment vanished or broke.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use tenant_gateway_sdk::{Chunk, Environ, HandlerError, StartResponse};

use crate::config::RouterConfig;
use crate::error::TenantError;
use crate::runtime::{HandlerUnit, IsolatedBody, ModuleHost};

/// Registry and configuration shared with the change detector
struct RouterState {
    config: Arc<RouterConfig>,
    modules: ModuleHost,
    registry: DashMap<String, Arc<HandlerUnit>>,
    // One slot per host with a first load in flight
    loading: DashMap<String, Arc<Mutex<()>>>,
    ticks: watch::Sender<u64>,
}

impl RouterState {
    fn new(config: RouterConfig, modules: ModuleHost) -> Self {
        let (ticks, _) = watch::channel(0);
        Self {
            config: Arc::new(config),
            modules,
            registry: DashMap::new(),
            loading: DashMap::new(),
            ticks,
        }
    }

    fn resolve(&self, host_name: &str) -> Result<Arc<HandlerUnit>, TenantError> {
        if let Some(unit) = self.registry.get(host_name) {
            return Ok(Arc::clone(unit.value()));
        }

        let path = self.config.deployment_path(host_name);
        if !is_valid_host_name(host_name) {
            return Err(TenantError::NotFound {
                host: host_name.to_string(),
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"),
            });
        }

        // Later callers for the same host wait on the slot instead of loading again
        let slot = Arc::clone(self.loading.entry(host_name.to_string()).or_default().value());
        let flight = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let registered = self.registry.get(host_name).map(|unit| Arc::clone(unit.value()));
        let result = match registered {
            Some(unit) => Ok(unit),
            None => HandlerUnit::open(host_name, path, Arc::clone(&self.config), self.modules.clone()).map(|unit| {
                let unit = Arc::new(unit);
                self.registry.insert(host_name.to_string(), Arc::clone(&unit));
                unit
            }),
        };
        drop(flight);

        // The last caller out removes the slot; a failed load leaves nothing behind
        self.loading
            .remove_if(host_name, |_, current| Arc::ptr_eq(current, &slot) && Arc::strong_count(current) == 2);

        result
    }

    fn poll_once(&self) {
        let units: Vec<Arc<HandlerUnit>> = self.registry.iter().map(|entry| Arc::clone(entry.value())).collect();

        for unit in units {
            self.check(&unit);
        }

        self.ticks.send_modify(|tick| *tick += 1);
    }

    fn check(&self, unit: &Arc<HandlerUnit>) {
        let started = Instant::now();
        let outcome = unit
            .probe_version()
            .and_then(|current| unit.reload_if_stale(current));

        match outcome {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                self.evict(unit);
                tracing::info!(
                    tenant = %unit.host_name(),
                    event = "evict",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    age_ms = unit.age().map(|age| age.as_millis() as u64),
                    reason = %err,
                    "Tenant deployment removed"
                );
            }
            Err(err) => {
                self.evict(unit);
                tracing::error!(
                    tenant = %unit.host_name(),
                    event = "evict",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    age_ms = unit.age().map(|age| age.as_millis() as u64),
                    error = %err,
                    "Tenant reload failed"
                );
            }
        }
    }

    /// Remove `unit` if it is still the registered instance for its host
    fn evict(&self, unit: &Arc<HandlerUnit>) -> bool {
        self.registry
            .remove_if(unit.host_name(), |_, registered| Arc::ptr_eq(registered, unit))
            .is_some()
    }
}

/// Routes requests to tenants and keeps their code current
pub struct TenantRouter {
    state: Arc<RouterState>,
    shutdown_tx: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TenantRouter {
    /// Create the router and spawn its change detector.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RouterConfig, modules: ModuleHost) -> Self {
        let state = Arc::new(RouterState::new(config, modules));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            base_path = %state.config.base_path.display(),
            poll_interval_ms = state.config.poll_interval.as_millis() as u64,
            "Starting tenant router"
        );

        let watcher = tokio::spawn(run_change_detector(Arc::clone(&state), shutdown_rx));

        Self {
            state,
            shutdown_tx,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    pub fn modules(&self) -> &ModuleHost {
        &self.state.modules
    }

    /// Look up the unit for `host_name`, loading it on first use.
    ///
    /// Blocks while loading; call from a blocking context.
    pub fn resolve(&self, host_name: &str) -> Result<Arc<HandlerUnit>, TenantError> {
        self.state.resolve(host_name)
    }

    /// Serve one request.
    ///
    /// The returned body keeps the tenant's isolation window open until it is
    /// drained or dropped, and logs the request when it completes.
    pub fn dispatch(
        &self,
        environ: &Environ,
        start_response: &mut dyn StartResponse,
    ) -> Result<ResponseBody, TenantError> {
        let started = Instant::now();
        let config = &self.state.config;

        let host_name = environ
            .get(&config.host_key)
            .ok_or_else(|| TenantError::MissingHost(config.host_key.clone()))?;
        let script_name = environ.get(&config.script_name_key).unwrap_or_default().to_string();

        let result = self
            .resolve(host_name)
            .and_then(|unit| unit.serve(environ, start_response));

        match result {
            Ok(body) => Ok(ResponseBody {
                body,
                tenant: host_name.to_string(),
                script_name,
                started,
                chunks: 0,
            }),
            Err(err) => {
                tracing::warn!(
                    tenant = %host_name,
                    script_name = %script_name,
                    event = "serve",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Request failed"
                );
                Err(err)
            }
        }
    }

    /// Registered unit for `host_name`, without loading
    pub fn get(&self, host_name: &str) -> Option<Arc<HandlerUnit>> {
        self.state.registry.get(host_name).map(|unit| Arc::clone(unit.value()))
    }

    /// Registered host names, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state.registry.iter().map(|entry| entry.key().clone()).collect();
        hosts.sort_unstable();
        hosts
    }

    /// Receiver of the number of completed change detector ticks
    pub fn subscribe_ticks(&self) -> watch::Receiver<u64> {
        self.state.ticks.subscribe()
    }

    /// Run one change detector pass on the calling thread
    pub fn poll_once(&self) {
        self.state.poll_once();
    }

    /// Whether the change detector is still running
    pub fn is_running(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the change detector and wait for it to exit
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                tracing::error!("Change detector exited abnormally: {}", e);
            }
            tracing::info!("Tenant router stopped");
        }
    }
}

impl Drop for TenantRouter {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for TenantRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRouter")
            .field("hosts", &self.hosts())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_change_detector(state: Arc<RouterState>, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.poll_interval;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(interval) => {}
        }

        if shutdown_requested(&shutdown) {
            break;
        }

        let tick = Arc::clone(&state);
        if let Err(e) = tokio::task::spawn_blocking(move || tick.poll_once()).await {
            tracing::error!("Change detector tick failed: {}", e);
        }
    }

    tracing::debug!("Change detector stopped");
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the router is gone
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

fn is_valid_host_name(host_name: &str) -> bool {
    !host_name.is_empty()
        && !host_name.starts_with('.')
        && !host_name.contains(['/', '\\', '\0'])
}

/// Response body of one dispatched request
///
/// Logs the completion line when exhausted or dropped.
pub struct ResponseBody {
    body: IsolatedBody,
    tenant: String,
    script_name: String,
    started: Instant,
    chunks: usize,
}

impl ResponseBody {
    /// Drain the whole body
    pub fn into_bytes(mut self) -> Result<Bytes, HandlerError> {
        let mut out = BytesMut::new();
        for chunk in &mut self {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl Iterator for ResponseBody {
    type Item = Result<Chunk, HandlerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.body.next()?;
        if item.is_ok() {
            self.chunks += 1;
        }
        Some(item)
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.body.release();
        tracing::info!(
            tenant = %self.tenant,
            script_name = %self.script_name,
            event = "serve",
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            chunks = self.chunks,
            "Request served"
        );
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("tenant", &self.tenant)
            .field("chunks", &self.chunks)
            .finish()
    }
}
