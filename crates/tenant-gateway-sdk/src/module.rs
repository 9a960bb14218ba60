//! Module exports and the library entry point
//!
//! Every tenant library exports one initializer under [`MODULE_INIT_SYMBOL`].
//! The initializer may import other modules (its private dependencies) through
//! the [`Importer`] it receives and returns its [`Exports`].
//!
//! # Example
//!
//! ```ignore
//! use tenant_gateway_sdk::prelude::*;
//!
//! fn init(importer: &mut dyn Importer) -> Result<Exports, ImportError> {
//!     let dep = importer.import("dep")?;
//!     let word = dep.value("word").unwrap_or_default().to_string();
//!     Ok(Exports::new().with_app("app", move |_: &Environ, start: &mut dyn StartResponse| {
//!         start.start(200, vec![]);
//!         Ok(Body::text(word.clone()))
//!     }))
//! }
//!
//! export_module!(init);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::App;

/// Name of the initializer symbol looked up in every tenant library
pub const MODULE_INIT_SYMBOL: &[u8] = b"tenant_module_init";

/// Signature of the module initializer
pub type ModuleInit = unsafe extern "C" fn(&mut dyn Importer) -> Result<Exports, ImportError>;

/// Failure to import or initialize a module
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ImportError(pub String);

impl ImportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Imports modules through the gateway's search path
pub trait Importer {
    fn import(&mut self, name: &str) -> Result<Arc<Exports>, ImportError>;
}

/// What a module publishes: named applications and named values
#[derive(Default)]
pub struct Exports {
    apps: HashMap<String, Arc<dyn App>>,
    values: HashMap<String, String>,
    // Dropped after the apps, whose code may live in the anchored library
    anchor: Option<Arc<dyn Any + Send + Sync>>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern: export an application under `name`
    pub fn with_app(mut self, name: impl Into<String>, app: impl App + 'static) -> Self {
        self.apps.insert(name.into(), Arc::new(app));
        self
    }

    /// Builder pattern: export a value under `name`
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn app(&self, name: &str) -> Option<Arc<dyn App>> {
        self.apps.get(name).cloned()
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Names of everything exported, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().chain(self.values.keys()).map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Tie the lifetime of a resource (the loaded library) to these exports.
    #[doc(hidden)]
    pub fn anchor(&mut self, resource: Arc<dyn Any + Send + Sync>) {
        self.anchor = Some(resource);
    }
}

impl std::fmt::Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exports")
            .field("names", &self.names())
            .field("anchored", &self.anchor.is_some())
            .finish()
    }
}

/// Run a module initializer, turning a panic into an `ImportError`.
///
/// A panic must not unwind out of the `extern "C"` initializer.
#[doc(hidden)]
pub fn run_init<F>(init: F) -> Result<Exports, ImportError>
where
    F: FnOnce() -> Result<Exports, ImportError>,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(init)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ImportError(format!("initializer panicked: {}", message)))
    })
}

/// Export a module initializer from a tenant library
///
/// # Example
///
/// ```ignore
/// fn init(_importer: &mut dyn Importer) -> Result<Exports, ImportError> {
///     Ok(Exports::new().with_app("app", hello))
/// }
///
/// export_module!(init);
/// ```
#[macro_export]
macro_rules! export_module {
    ($init:path) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn tenant_module_init(
            importer: &mut dyn $crate::Importer,
        ) -> ::std::result::Result<$crate::Exports, $crate::ImportError> {
            $crate::module::run_init(|| $init(importer))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Body, Environ, StartResponse};

    fn hello(_: &Environ, start: &mut dyn StartResponse) -> Result<Body, crate::HandlerError> {
        start.start(200, vec![]);
        Ok(Body::text("hello"))
    }

    #[test]
    fn test_exports_lookup() {
        let exports = Exports::new().with_app("app", hello).with_value("word", "delta");

        assert!(exports.app("app").is_some());
        assert!(exports.app("missing").is_none());
        assert_eq!(exports.value("word"), Some("delta"));
        assert_eq!(exports.names(), vec!["app", "word"]);
    }

    fn init(importer: &mut dyn Importer) -> Result<Exports, ImportError> {
        let word = importer.import("dep")?.value("word").unwrap_or("none").to_string();
        Ok(Exports::new().with_value("word", word))
    }

    export_module!(init);

    struct Fixed(Arc<Exports>);

    impl Importer for Fixed {
        fn import(&mut self, name: &str) -> Result<Arc<Exports>, ImportError> {
            match name {
                "dep" => Ok(Arc::clone(&self.0)),
                other => Err(ImportError::new(format!("no module {}", other))),
            }
        }
    }

    #[test]
    fn test_exported_initializer() {
        let entry: ModuleInit = tenant_module_init;
        let mut importer = Fixed(Arc::new(Exports::new().with_value("word", "delta")));

        let exports = unsafe { entry(&mut importer) }.unwrap();
        assert_eq!(exports.value("word"), Some("delta"));
    }

    #[test]
    fn test_initializer_panic_becomes_error() {
        let err = run_init(|| panic!("bad build")).unwrap_err();
        assert_eq!(err.0, "initializer panicked: bad build");
    }
}
