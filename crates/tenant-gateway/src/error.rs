//! Error types for tenant resolution, loading and serving

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use tenant_gateway_sdk::HandlerError;

/// Failure to import a tenant's module or resolve its entry point
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("No module named {name:?} on search path {search_path:?}")]
    ModuleNotFound { name: String, search_path: Vec<PathBuf> },

    #[error("Module {module:?} has no attribute {attribute:?}")]
    MissingAttribute { module: String, attribute: String },

    #[error("Failed to open library {path:?}: {message}")]
    Library { path: PathBuf, message: String },

    #[error("Module {module:?} failed to initialize: {message}")]
    Init { module: String, message: String },

    #[error("Circular import of module {0:?}")]
    CircularImport(String),

    #[error("Module {module:?} panicked while loading: {message}")]
    Panicked { module: String, message: String },
}

/// Errors surfaced by the tenant router
#[derive(Error, Debug)]
pub enum TenantError {
    /// The deployment directory could not be located or resolved
    #[error("Deployment for {host} not found at {path:?}: {source}")]
    NotFound {
        host: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The deployment exists but its code could not be loaded
    #[error("Failed to load {host}: {source}")]
    LoadFailed {
        host: String,
        #[source]
        source: LoadError,
    },

    /// The tenant's own code failed while handling a request
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Tenant {0} has not been loaded")]
    NotLoaded(String),

    #[error("Request is missing the {0} field")]
    MissingHost(String),
}

impl TenantError {
    /// Whether the deployment itself is gone (as opposed to broken)
    pub fn is_not_found(&self) -> bool {
        matches!(self, TenantError::NotFound { .. })
    }

    /// Convert the error to an HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            TenantError::Handler(err) => err.status_code(),
            TenantError::MissingHost(_) => 400,
            _ => 500,
        }
    }
}

/// Extract a printable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let not_found = TenantError::NotFound {
            host: "aries".into(),
            path: PathBuf::from("/var/www/aries"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(not_found.is_not_found());
        assert_eq!(not_found.status_code(), 500);

        let broken = TenantError::LoadFailed {
            host: "aries".into(),
            source: LoadError::CircularImport("app".into()),
        };
        assert!(!broken.is_not_found());
        assert_eq!(broken.status_code(), 500);

        assert_eq!(TenantError::MissingHost("HTTP_HOST".into()).status_code(), 400);
        assert_eq!(TenantError::from(HandlerError::BadRequest("x".into())).status_code(), 400);
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
    }
}
