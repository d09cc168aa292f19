//! Runtime configuration.
//!
//! Aggregates configuration for every component into a single [`Config`]
//! loadable from YAML plus environment variables, mirroring the layered
//! `config` crate setup a host application wires up once at startup.

mod agent;
mod storage;
mod workpool;

pub use agent::AgentRuntimeConfig;
pub use storage::StorageConfig;
pub use workpool::WorkpoolConfig;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "keystone.yaml";
/// Environment variable for an explicit configuration file path.
pub const CONFIG_ENV_VAR: &str = "KEYSTONE_CONFIG";
/// Prefix for configuration environment variables (`KEYSTONE__STORAGE__DSN`, ...).
pub const CONFIG_ENV_PREFIX: &str = "KEYSTONE";
/// Environment variable that, when absent, means "production" for the
/// test-mode guard.
pub const PRODUCTION_MARKER_ENV_VAR: &str = "KEYSTONE_PRODUCTION";

/// Heuristic cap on admin listing endpoints, chosen to keep a single
/// response bounded without paging; revisit if any deployment's backlog
/// legitimately exceeds it.
pub const ADMIN_LIST_CAP: usize = 10_000;

/// Top-level middleware pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Enable validation-against-registry middleware.
    pub validation: bool,
    /// Enable structured logging middleware (timing, correlation).
    pub logging: bool,
    /// Enable rate limiting keyed by `(user, command)`.
    pub rate_limit: bool,
    /// Maximum commands per `(user, command)` per `rate_limit_window`.
    pub rate_limit_max: u32,
    /// Rate limit window, in seconds.
    pub rate_limit_window_secs: u64,
    /// Enable the auth middleware (requires `envelope.user_id`).
    pub auth: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            validation: true,
            logging: true,
            rate_limit: false,
            rate_limit_max: 100,
            rate_limit_window_secs: 60,
            auth: false,
        }
    }
}

/// Main runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend configuration.
    pub storage: StorageConfig,
    /// Workpool scheduling configuration.
    pub workpool: WorkpoolConfig,
    /// Agent bounded-context runtime defaults.
    pub agent: AgentRuntimeConfig,
    /// Command orchestrator middleware configuration.
    pub middleware: MiddlewareConfig,
    /// Explicit test-mode flag.
    ///
    /// When `true`, test-only admin operations are permitted regardless of
    /// `PRODUCTION_MARKER_ENV_VAR`.
    pub test_mode: bool,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `keystone.yaml` in the current directory, if present.
    /// 2. The file named by `path`, if given.
    /// 3. The file named by `CONFIG_ENV_VAR`, if set.
    /// 4. Environment variables prefixed `CONFIG_ENV_PREFIX` (`__`-separated).
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// A default configuration suitable for tests and embedded use.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.test_mode = true;
        config
    }

    /// Whether test-only operations are permitted right now.
    ///
    /// Production is the default; a test-only operation runs only if one of:
    /// an explicit test-mode flag is set, or the production marker
    /// environment variable is absent *and* a test-harness global
    /// (`cfg(test)`) is compiled in.
    pub fn test_mode_allowed(&self) -> bool {
        if self.test_mode {
            return true;
        }
        cfg!(test) && std::env::var(PRODUCTION_MARKER_ENV_VAR).is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_middleware_defaults() {
        let config = Config::default();
        assert!(config.middleware.validation);
        assert!(config.middleware.logging);
        assert!(!config.middleware.rate_limit);
    }

    #[test]
    fn for_test_allows_test_only_operations() {
        let config = Config::for_test();
        assert!(config.test_mode_allowed());
    }

    #[test]
    fn production_default_blocks_test_only_operations_when_marker_set() {
        std::env::set_var(PRODUCTION_MARKER_ENV_VAR, "1");
        let config = Config::default();
        assert!(!config.test_mode_allowed());
        std::env::remove_var(PRODUCTION_MARKER_ENV_VAR);
    }
}
