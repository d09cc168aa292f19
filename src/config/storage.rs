use serde::Deserialize;

/// Storage backend selection and connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `"memory"` (default, no external deps) or `"sqlite"`.
    pub backend: String,
    /// SQLite connection string (e.g. `sqlite://keystone.db` or
    /// `sqlite::memory:`). Ignored for the `memory` backend.
    pub dsn: String,
    /// Maximum pooled connections (SQLite backend only).
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            dsn: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}
