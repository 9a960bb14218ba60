//! Module loading
//!
//! A `ModuleLoader` turns a module name into a `Module`, locating it through
//! the search path of the open isolation window. Nested imports made by a
//! module's initializer go back through the same `ImportScope`, so they are
//! answered from the shared table first and recorded there afterwards.
//!
//! `DylibLoader` is the production loader: each module is a dynamic library
//! (.so/.dylib/.dll) exporting the SDK's module initializer.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use uuid::Uuid;

use tenant_gateway_sdk::{Exports, ImportError, Importer, ModuleInit, MODULE_INIT_SYMBOL};

use super::namespace::{Module, Namespace};
use crate::error::{panic_message, LoadError};

/// Locates and initializes modules
pub trait ModuleLoader: Send + Sync {
    /// Load module `name`, resolving any nested imports through `scope`
    fn load(&self, name: &str, scope: &mut ImportScope<'_>) -> Result<Module, LoadError>;
}

/// Import state for one isolation window
pub struct ImportScope<'a> {
    namespace: &'a mut Namespace,
    loader: &'a dyn ModuleLoader,
    loading: Vec<String>,
}

impl<'a> ImportScope<'a> {
    pub fn new(namespace: &'a mut Namespace, loader: &'a dyn ModuleLoader) -> Self {
        Self {
            namespace,
            loader,
            loading: Vec::new(),
        }
    }

    pub fn search_path(&self) -> &[PathBuf] {
        self.namespace.search_path()
    }

    /// First file called `file_name` along the search path
    pub fn find(&self, file_name: &str) -> Option<PathBuf> {
        self.search_path()
            .iter()
            .map(|dir| dir.join(file_name))
            .find(|candidate| candidate.is_file())
    }

    pub fn not_found(&self, name: &str) -> LoadError {
        LoadError::ModuleNotFound {
            name: name.to_string(),
            search_path: self.search_path().to_vec(),
        }
    }

    /// Import `name`, reusing the table entry if it is already present
    pub fn import_module(&mut self, name: &str) -> Result<Arc<Module>, LoadError> {
        if let Some(module) = self.namespace.get(name) {
            return Ok(module);
        }

        if self.loading.iter().any(|pending| pending == name) {
            return Err(LoadError::CircularImport(name.to_string()));
        }

        self.loading.push(name.to_string());
        let loader = self.loader;
        let result = panic::catch_unwind(AssertUnwindSafe(|| loader.load(name, self)));
        self.loading.pop();

        let module = match result {
            Ok(loaded) => Arc::new(loaded?),
            Err(payload) => {
                return Err(LoadError::Panicked {
                    module: name.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            }
        };

        tracing::debug!(module = %name, origin = ?module.origin, "Imported module");
        self.namespace.insert(Arc::clone(&module));
        Ok(module)
    }
}

impl Importer for ImportScope<'_> {
    fn import(&mut self, name: &str) -> Result<Arc<Exports>, ImportError> {
        self.import_module(name)
            .map(|module| Arc::clone(&module.exports))
            .map_err(|e| ImportError::new(e.to_string()))
    }
}

/// Loads modules from dynamic libraries
///
/// Libraries are opened from a private copy so that a library rebuilt in place
/// is loaded as new code instead of the already-mapped image. The copy is
/// deleted once the library is unloaded.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    shadow_dir: PathBuf,
}

impl DylibLoader {
    /// Loader that copies libraries into the system temp directory before opening them
    pub fn new() -> Self {
        Self::with_shadow_dir(std::env::temp_dir().join("tenant-gateway"))
    }

    /// Loader that copies libraries into `dir` before opening them
    pub fn with_shadow_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            shadow_dir: dir.into(),
        }
    }

    fn shadow_copy(&self, path: &Path, name: &str) -> Result<PathBuf, LoadError> {
        let copy = self
            .shadow_dir
            .join(format!("{}-{}", Uuid::new_v4(), format_library_name(name)));
        std::fs::create_dir_all(&self.shadow_dir)
            .and_then(|_| std::fs::copy(path, &copy))
            .map_err(|e| LoadError::Library {
                path: path.to_path_buf(),
                message: format!("Failed to copy library to {:?}: {}", copy, e),
            })?;

        Ok(copy)
    }
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// An opened shadow copy; closing it deletes the copy
struct ShadowLibrary {
    library: Option<Library>,
    copy: PathBuf,
}

impl Drop for ShadowLibrary {
    fn drop(&mut self) {
        drop(self.library.take());
        if let Err(e) = std::fs::remove_file(&self.copy) {
            tracing::warn!(path = ?self.copy, "Failed to remove library copy: {}", e);
        }
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, name: &str, scope: &mut ImportScope<'_>) -> Result<Module, LoadError> {
        let path = scope
            .find(&format_library_name(name))
            .ok_or_else(|| scope.not_found(name))?;

        let copy = self.shadow_copy(&path, name)?;

        // Safety: tenant libraries are trusted code built against the SDK;
        // their initializers run when the library is opened.
        let library = match unsafe { Library::new(&copy) } {
            Ok(library) => library,
            Err(e) => {
                let _ = std::fs::remove_file(&copy);
                return Err(LoadError::Library {
                    path,
                    message: e.to_string(),
                });
            }
        };

        // Safety: the symbol is the SDK's `export_module!` initializer, and the
        // library is anchored to the exports so the code outlives every use.
        let init = unsafe { library.get::<ModuleInit>(MODULE_INIT_SYMBOL).map(|symbol| *symbol) };
        let shadow = ShadowLibrary {
            library: Some(library),
            copy,
        };
        let init = init.map_err(|e| LoadError::Init {
            module: name.to_string(),
            message: format!("Missing module initializer: {}", e),
        })?;

        // Safety: `init` was resolved from the library held by `shadow`
        let mut exports = unsafe { init(scope) }.map_err(|e| LoadError::Init {
            module: name.to_string(),
            message: e.to_string(),
        })?;
        exports.anchor(Arc::new(shadow));

        tracing::info!(module = %name, path = ?path, "Loaded module library");
        Ok(Module::new(name, path, exports))
    }
}

/// Format the library filename for the current platform
#[cfg(target_os = "windows")]
pub fn format_library_name(module_name: &str) -> String {
    format!("{}.dll", module_name)
}

#[cfg(target_os = "linux")]
pub fn format_library_name(module_name: &str) -> String {
    format!("lib{}.so", module_name)
}

#[cfg(target_os = "macos")]
pub fn format_library_name(module_name: &str) -> String {
    format!("lib{}.dylib", module_name)
}

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub fn format_library_name(module_name: &str) -> String {
    format!("lib{}.so", module_name)
}
