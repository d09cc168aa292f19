use serde::Deserialize;

/// Workpool scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkpoolConfig {
    /// Upper bound on concurrently running tasks across all partitions.
    /// A single-process deployment typically wants something in the 3-10 range.
    pub max_parallelism: usize,
    /// Default maximum attempts before a task is dead-lettered.
    pub default_max_attempts: u32,
    /// Default initial backoff, in milliseconds.
    pub default_initial_backoff_ms: u64,
    /// Default exponential base for backoff growth.
    pub default_backoff_base: f64,
    /// Maximum backoff delay, in milliseconds, regardless of attempt count.
    pub max_backoff_ms: u64,
}

impl Default for WorkpoolConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            default_max_attempts: 5,
            default_initial_backoff_ms: 50,
            default_backoff_base: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}
