//! Application configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tenant layout and change-detection settings, fixed at router construction
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Directory holding one deployment directory per host name
    pub base_path: PathBuf,

    /// Private dependency root inside a deployment
    pub venv_name: String,

    /// Pattern, relative to the dependency root, matching dependency directories
    pub dependency_pattern: String,

    /// Code subdirectory inside a deployment
    pub code_dir: String,

    /// Module imported from the code directory
    pub module_name: String,

    /// Attribute of the module used as the entry point
    pub attribute: String,

    /// Change detector cadence
    pub poll_interval: Duration,

    /// Request field naming the tenant
    pub host_key: String,

    /// Request field carrying the base path (used in log lines)
    pub script_name_key: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/var/www"),
            venv_name: ".venv".to_string(),
            dependency_pattern: "lib/python*/site-packages".to_string(),
            code_dir: "wsgi".to_string(),
            module_name: "app".to_string(),
            attribute: "app".to_string(),
            poll_interval: Duration::from_secs(1),
            host_key: tenant_gateway_sdk::environ::keys::HTTP_HOST.to_string(),
            script_name_key: tenant_gateway_sdk::environ::keys::SCRIPT_NAME.to_string(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            base_path: env::var("TENANT_GATEWAY_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),

            venv_name: env::var("TENANT_GATEWAY_VENV_NAME").unwrap_or(defaults.venv_name),

            dependency_pattern: env::var("TENANT_GATEWAY_DEPENDENCY_PATTERN")
                .unwrap_or(defaults.dependency_pattern),

            code_dir: env::var("TENANT_GATEWAY_CODE_DIR").unwrap_or(defaults.code_dir),

            module_name: env::var("TENANT_GATEWAY_MODULE_NAME").unwrap_or(defaults.module_name),

            attribute: env::var("TENANT_GATEWAY_ATTRIBUTE").unwrap_or(defaults.attribute),

            poll_interval: env::var("TENANT_GATEWAY_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),

            host_key: defaults.host_key,
            script_name_key: defaults.script_name_key,
        }
    }

    /// Deployment directory for a host
    pub fn deployment_path(&self, host_name: &str) -> PathBuf {
        self.base_path.join(host_name)
    }
}

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub router: RouterConfig,

    /// Port the gateway listens on
    pub listen_port: u16,

    /// Largest request body read into the environment
    pub max_body_bytes: usize,

    /// Value placed in `SCRIPT_NAME` for every request
    pub script_name: String,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            router: RouterConfig::from_env(),

            listen_port: env::var("TENANT_GATEWAY_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8080),

            max_body_bytes: env::var("TENANT_GATEWAY_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024),

            script_name: env::var("TENANT_GATEWAY_SCRIPT_NAME").unwrap_or_default(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
