//! Runtime module - tenant code loading and isolation
//!
//! This module provides:
//! - The process-wide module table and search path (`Namespace`)
//! - The isolation window around every load and request (`IsolationGuard`)
//! - Module loaders, including dynamic library loading (`DylibLoader`)
//! - Handler units: one tenant's loaded code and its reload logic

pub mod loader;
pub mod namespace;
pub mod unit;

#[cfg(test)]
pub(crate) mod testing;

pub use loader::{DylibLoader, ImportScope, ModuleLoader};
pub use namespace::{IsolationGuard, Module, ModuleCache, ModuleHost, Namespace};
pub use unit::{HandlerUnit, IsolatedBody, Version};
