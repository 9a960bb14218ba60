//! Tenant Gateway SDK - Types and utilities for writing tenant applications
//!
//! A tenant is compiled as a dynamic library that exports a single module
//! initializer (see [`export_module!`]). The gateway opens the library, runs
//! the initializer and looks up the configured attribute (an [`App`]) in the
//! returned [`Exports`].

pub mod app;
pub mod environ;
pub mod error;
pub mod module;
pub mod response;

pub mod prelude {
    //! Common imports for tenant applications
    pub use crate::app::App;
    pub use crate::environ::{keys, Environ};
    pub use crate::error::HandlerError;
    pub use crate::module::{Exports, ImportError, Importer};
    pub use crate::response::{Body, Chunk, StartResponse};
    pub use crate::export_module;
    pub use serde_json::json;
}

// Re-export key types at crate root
pub use app::App;
pub use environ::Environ;
pub use error::HandlerError;
pub use module::{Exports, ImportError, Importer, ModuleInit, MODULE_INIT_SYMBOL};
pub use response::{Body, Chunk, StartResponse};
