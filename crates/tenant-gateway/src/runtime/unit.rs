//! Handler units
//!
//! A `HandlerUnit` owns one tenant's loaded code: the resolved deployment,
//! its private dependency directories, the entry point taken from the
//! designated module, the version marker of the last successful load and the
//! private cache of the tenant's modules.
//!
//! Loading and serving both happen inside an isolation window (see
//! `namespace`). A new entry point is only published after its import fully
//! succeeded, so concurrent requests observe either the old or the new code.

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Instant, SystemTime};

use regex_lite::Regex;

use tenant_gateway_sdk::{App, Body, Chunk, Environ, HandlerError, StartResponse};

use super::namespace::{IsolationGuard, Module, ModuleCache, ModuleHost};
use crate::config::RouterConfig;
use crate::error::{panic_message, LoadError, TenantError};

/// Version marker of a deployment
///
/// The resolved code directory together with its modification time, so both a
/// symlink swap and a touch of the directory mark a unit as stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub target: PathBuf,
    pub modified: SystemTime,
}

impl Version {
    /// Resolve `code_path` (following symlinks) and stat it
    pub fn probe(code_path: &Path) -> io::Result<Self> {
        let target = fs::canonicalize(code_path)?;
        let modified = fs::metadata(&target)?.modified()?;
        Ok(Self { target, modified })
    }
}

struct EntryPoint {
    app: Arc<dyn App>,
    // Keeps the module's library mapped while the app is in use
    _module: Arc<Module>,
}

/// Everything published by one successful load
struct Loaded {
    entry: EntryPoint,
    resolved_path: PathBuf,
    dependency_paths: Vec<PathBuf>,
    loaded_at: Instant,
}

impl Loaded {
    fn search_path(&self, code_dir: &str) -> Vec<PathBuf> {
        std::iter::once(self.resolved_path.join(code_dir))
            .chain(self.dependency_paths.iter().cloned())
            .collect()
    }
}

/// One tenant's loaded code and isolation state
pub struct HandlerUnit {
    host_name: String,
    deployment_path: PathBuf,
    config: Arc<RouterConfig>,
    modules: ModuleHost,
    loaded: RwLock<Option<Arc<Loaded>>>,
    version: Mutex<Option<Version>>,
    private: Arc<Mutex<ModuleCache>>,
    loads: AtomicU64,
}

impl HandlerUnit {
    /// Create an unloaded unit
    pub fn new(
        host_name: impl Into<String>,
        deployment_path: impl Into<PathBuf>,
        config: Arc<RouterConfig>,
        modules: ModuleHost,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            deployment_path: deployment_path.into(),
            config,
            modules,
            loaded: RwLock::new(None),
            version: Mutex::new(None),
            private: Arc::new(Mutex::new(ModuleCache::new())),
            loads: AtomicU64::new(0),
        }
    }

    /// Create a unit, load it and record the deployment's current version
    pub fn open(
        host_name: impl Into<String>,
        deployment_path: impl Into<PathBuf>,
        config: Arc<RouterConfig>,
        modules: ModuleHost,
    ) -> Result<Self, TenantError> {
        let unit = Self::new(host_name, deployment_path, config, modules);
        // Probed first, so a change made during the load is seen as stale later
        let version = unit.probe_version()?;
        unit.load()?;
        *unit.version.lock().unwrap_or_else(PoisonError::into_inner) = Some(version);
        Ok(unit)
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Resolved deployment of the last successful load
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.snapshot().map(|loaded| loaded.resolved_path.clone())
    }

    /// Dependency directories of the last successful load
    pub fn dependency_paths(&self) -> Vec<PathBuf> {
        self.snapshot()
            .map(|loaded| loaded.dependency_paths.clone())
            .unwrap_or_default()
    }

    /// Current entry point, if the unit has been loaded
    pub fn entry_point(&self) -> Option<Arc<dyn App>> {
        self.snapshot().map(|loaded| Arc::clone(&loaded.entry.app))
    }

    /// Version recorded at the last successful load
    pub fn version(&self) -> Option<Version> {
        self.version.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of successful loads
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Names of the modules held in the private cache, sorted
    pub fn private_modules(&self) -> Vec<String> {
        let cache = self.private.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = cache.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Stat the deployment's code directory for its current version
    pub fn probe_version(&self) -> Result<Version, TenantError> {
        let code_path = self.deployment_path.join(&self.config.code_dir);
        Version::probe(&code_path).map_err(|source| TenantError::NotFound {
            host: self.host_name.clone(),
            path: code_path,
            source,
        })
    }

    /// Import the designated module and publish its entry point
    pub fn load(&self) -> Result<(), TenantError> {
        self.load_with("load", false)
    }

    /// Reload when `current` differs from the recorded version.
    ///
    /// Returns whether a reload happened. On failure the previous entry point
    /// and version stay in place, so the next check retries.
    pub fn reload_if_stale(&self, current: Version) -> Result<bool, TenantError> {
        if self.version().as_ref() == Some(&current) {
            return Ok(false);
        }

        self.load_with("reload", true)?;
        *self.version.lock().unwrap_or_else(PoisonError::into_inner) = Some(current);
        Ok(true)
    }

    fn load_with(&self, event: &'static str, fresh: bool) -> Result<(), TenantError> {
        let started = Instant::now();
        tracing::debug!(tenant = %self.host_name, event, "Loading tenant");

        let resolved_path = fs::canonicalize(&self.deployment_path).map_err(|source| TenantError::NotFound {
            host: self.host_name.clone(),
            path: self.deployment_path.clone(),
            source,
        })?;

        let dependency_paths = discover_dependency_paths(
            &resolved_path.join(&self.config.venv_name),
            &self.config.dependency_pattern,
        );

        let mut search_path = vec![resolved_path.join(&self.config.code_dir)];
        search_path.extend(dependency_paths.iter().cloned());

        let mut guard = self.modules.enter(search_path, &self.private, fresh);
        let entry = match self.import_entry(&mut guard) {
            Ok(entry) => entry,
            Err(source) => {
                guard.abandon();
                tracing::warn!(
                    tenant = %self.host_name,
                    event,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %source,
                    "Tenant failed to load"
                );
                return Err(TenantError::LoadFailed {
                    host: self.host_name.clone(),
                    source,
                });
            }
        };
        drop(guard);

        let loaded = Arc::new(Loaded {
            entry,
            resolved_path,
            dependency_paths,
            loaded_at: Instant::now(),
        });
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = Some(loaded);
        self.loads.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            tenant = %self.host_name,
            event,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tenant loaded"
        );
        Ok(())
    }

    fn import_entry(&self, guard: &mut IsolationGuard) -> Result<EntryPoint, LoadError> {
        let module = guard.import(&self.config.module_name)?;
        let app = module
            .exports
            .app(&self.config.attribute)
            .ok_or_else(|| LoadError::MissingAttribute {
                module: self.config.module_name.clone(),
                attribute: self.config.attribute.clone(),
            })?;

        Ok(EntryPoint { app, _module: module })
    }

    /// Serve one request inside this tenant's isolation window.
    ///
    /// The window stays open until the returned body is exhausted, fails, or
    /// is dropped.
    pub fn serve(
        &self,
        environ: &Environ,
        start_response: &mut dyn StartResponse,
    ) -> Result<IsolatedBody, TenantError> {
        let loaded = self
            .snapshot()
            .ok_or_else(|| TenantError::NotLoaded(self.host_name.clone()))?;

        let guard = self.modules.enter(loaded.search_path(&self.config.code_dir), &self.private, false);
        let app = Arc::clone(&loaded.entry.app);

        match panic::catch_unwind(AssertUnwindSafe(|| app.call(environ, start_response))) {
            Ok(Ok(body)) => Ok(IsolatedBody {
                body: Some(body),
                guard: Some(guard),
                _loaded: loaded,
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref())).into()),
        }
    }

    /// Time since the current code was loaded
    pub fn age(&self) -> Option<std::time::Duration> {
        self.snapshot().map(|loaded| loaded.loaded_at.elapsed())
    }

    fn snapshot(&self) -> Option<Arc<Loaded>> {
        self.loaded.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for HandlerUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerUnit")
            .field("host_name", &self.host_name)
            .field("deployment_path", &self.deployment_path)
            .field("version", &self.version())
            .field("loads", &self.loads())
            .finish()
    }
}

/// A response body produced inside its tenant's isolation window
///
/// The window is closed when the body is exhausted, yields an error, panics,
/// or is dropped unfinished.
pub struct IsolatedBody {
    body: Option<Body>,
    guard: Option<IsolationGuard>,
    _loaded: Arc<Loaded>,
}

impl IsolatedBody {
    /// Whether the isolation window is still open
    pub fn is_isolated(&self) -> bool {
        self.guard.is_some()
    }

    /// Stop producing and close the isolation window
    pub fn release(&mut self) {
        self.body = None;
        self.guard = None;
    }
}

impl Iterator for IsolatedBody {
    type Item = Result<Chunk, HandlerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let body = self.body.as_mut()?;

        match panic::catch_unwind(AssertUnwindSafe(|| body.next())) {
            Ok(Some(Ok(chunk))) => Some(Ok(chunk)),
            Ok(Some(Err(err))) => {
                self.release();
                Some(Err(err))
            }
            Ok(None) => {
                self.release();
                None
            }
            Err(payload) => {
                self.release();
                Some(Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
            }
        }
    }
}

impl std::fmt::Debug for IsolatedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedBody")
            .field("isolated", &self.is_isolated())
            .finish()
    }
}

/// Find the dependency directories matching `pattern` under `root`.
///
/// The pattern is a `/`-separated relative path whose segments may use `*`
/// and `?` wildcards. Matches at each level are sorted.
pub fn discover_dependency_paths(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let mut current = vec![root.to_path_buf()];

    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();

        if !segment.contains(['*', '?']) {
            next.extend(current.iter().map(|dir| dir.join(segment)));
        } else {
            let Some(matcher) = segment_matcher(segment) else {
                tracing::warn!(pattern, "Invalid dependency pattern");
                return Vec::new();
            };

            for dir in &current {
                let Ok(entries) = fs::read_dir(dir) else { continue };
                let mut matched: Vec<PathBuf> = entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.file_name().to_str().is_some_and(|name| matcher.is_match(name)))
                    .map(|entry| entry.path())
                    .collect();
                matched.sort();
                next.extend(matched);
            }
        }

        current = next;
    }

    current.retain(|path| path.is_dir());
    current
}

fn segment_matcher(segment: &str) -> Option<Regex> {
    let mut expr = String::from("^");
    for c in segment.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex_lite::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}
