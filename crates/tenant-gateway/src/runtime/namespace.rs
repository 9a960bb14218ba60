//! Process-wide module table and the isolation window around it
//!
//! All tenants share one `Namespace`: a table of imported modules keyed by
//! name and an ordered search path used to locate new ones. A tenant's modules
//! are only present in the table while that tenant holds an `IsolationGuard`.
//! When the guard is released the search path is restored and every module
//! that is not part of the base set moves into the tenant's private cache, to
//! be merged back the next time the tenant enters.
//!
//! Entering blocks on a single process-wide lock, so at most one load or
//! request is inside its window at any instant.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use tenant_gateway_sdk::Exports;

use super::loader::{ImportScope, ModuleLoader};
use crate::error::LoadError;

/// An imported module
#[derive(Debug)]
pub struct Module {
    /// Name the module was imported under
    pub name: String,

    /// File the module was loaded from
    pub origin: PathBuf,

    /// Everything the module published
    pub exports: Arc<Exports>,
}

impl Module {
    pub fn new(name: impl Into<String>, origin: impl Into<PathBuf>, exports: Exports) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            exports: Arc::new(exports),
        }
    }
}

/// Modules owned by one tenant while it is outside its isolation window
pub type ModuleCache = HashMap<String, Arc<Module>>;

/// The shared module table and search path
#[derive(Debug, Default)]
pub struct Namespace {
    modules: HashMap<String, Arc<Module>>,
    search_path: Vec<PathBuf>,
    base: HashSet<String>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: add a module that every tenant can see
    pub fn with_builtin(mut self, module: Module) -> Self {
        self.base.insert(module.name.clone());
        self.modules.insert(module.name.clone(), Arc::new(module));
        self
    }

    /// Builder pattern: add a search path entry visible to every tenant
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_path.push(path.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub(crate) fn insert(&mut self, module: Arc<Module>) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Names currently in the table, sorted
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn merge(&mut self, cache: &ModuleCache) {
        for (name, module) in cache {
            if !self.base.contains(name) {
                self.modules.insert(name.clone(), Arc::clone(module));
            }
        }
    }

    fn evict_private(&mut self) -> ModuleCache {
        let private: Vec<String> = self
            .modules
            .keys()
            .filter(|name| !self.base.contains(*name))
            .cloned()
            .collect();

        private
            .into_iter()
            .filter_map(|name| self.modules.remove_entry(&name))
            .collect()
    }
}

/// Owner of the shared namespace and the loader used to fill it
///
/// Cheap to clone; every clone refers to the same namespace.
#[derive(Clone)]
pub struct ModuleHost {
    namespace: Arc<Mutex<Namespace>>,
    loader: Arc<dyn ModuleLoader>,
}

impl ModuleHost {
    /// Create a host with an empty base namespace
    pub fn new(loader: impl ModuleLoader + 'static) -> Self {
        Self::with_namespace(loader, Namespace::new())
    }

    /// Create a host around a prepared namespace. Whatever it holds now is the
    /// base set that survives every isolation exit.
    pub fn with_namespace(loader: impl ModuleLoader + 'static, mut namespace: Namespace) -> Self {
        namespace.base.extend(namespace.modules.keys().cloned());

        Self {
            namespace: Arc::new(Mutex::new(namespace)),
            loader: Arc::new(loader),
        }
    }

    /// Open an isolation window for one tenant.
    ///
    /// Blocks until no other window is open. `paths` are placed in front of
    /// the search path and the tenant's cached modules are merged into the
    /// table. With `discard_cached` the cache is emptied first (its modules
    /// belong to code that is being replaced); abandoning the guard restores it.
    ///
    /// Must not be called from within an async context.
    pub fn enter(
        &self,
        paths: Vec<PathBuf>,
        private: &Arc<StdMutex<ModuleCache>>,
        discard_cached: bool,
    ) -> IsolationGuard {
        let mut namespace = Arc::clone(&self.namespace).blocking_lock_owned();
        let saved_path = namespace.search_path.clone();

        let discarded = {
            let mut cache = private.lock().unwrap_or_else(PoisonError::into_inner);
            let discarded = discard_cached.then(|| mem::take(&mut *cache));
            namespace.merge(&cache);
            discarded
        };

        let mut search_path = paths;
        search_path.extend(saved_path.iter().cloned());
        namespace.search_path = search_path;

        IsolationGuard {
            namespace,
            loader: Arc::clone(&self.loader),
            saved_path,
            private: Arc::clone(private),
            discarded,
            abandoned: false,
        }
    }

    /// Names of the modules in the shared table, sorted. Blocks while a window is open.
    pub fn loaded_modules(&self) -> Vec<String> {
        self.namespace.blocking_lock().module_names()
    }

    /// Whether an isolation window is currently open
    pub fn is_busy(&self) -> bool {
        self.namespace.try_lock().is_err()
    }
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost")
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// An open isolation window
///
/// Dropping the guard closes the window on every exit path, including panics
/// and response bodies abandoned before exhaustion.
pub struct IsolationGuard {
    namespace: OwnedMutexGuard<Namespace>,
    loader: Arc<dyn ModuleLoader>,
    saved_path: Vec<PathBuf>,
    private: Arc<StdMutex<ModuleCache>>,
    discarded: Option<ModuleCache>,
    abandoned: bool,
}

impl IsolationGuard {
    /// Import a module through the current search path
    pub fn import(&mut self, name: &str) -> Result<Arc<Module>, LoadError> {
        let loader = Arc::clone(&self.loader);
        let mut scope = ImportScope::new(&mut self.namespace, loader.as_ref());
        scope.import_module(name)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Close the window without keeping anything imported inside it.
    ///
    /// The tenant's private cache is left as it was before `enter`.
    pub fn abandon(mut self) {
        self.abandoned = true;
    }
}

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        self.namespace.search_path = mem::take(&mut self.saved_path);
        let evicted = self.namespace.evict_private();

        let mut cache = self.private.lock().unwrap_or_else(PoisonError::into_inner);
        if self.abandoned {
            if let Some(previous) = self.discarded.take() {
                *cache = previous;
            }
        } else {
            *cache = evicted;
        }
    }
}
