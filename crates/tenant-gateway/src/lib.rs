//! Tenant Gateway - multi-tenant application host
//!
//! Routes requests to tenant applications by host name, loads each tenant's
//! code lazily, reloads it when its deployment changes on disk and evicts
//! tenants whose deployment was removed or broke.

pub mod config;
pub mod error;
pub mod router;
pub mod runtime;
pub mod server;

pub use config::{AppConfig, RouterConfig};
pub use error::{LoadError, TenantError};
pub use router::{ResponseBody, TenantRouter};
pub use runtime::{DylibLoader, HandlerUnit, ModuleHost};
