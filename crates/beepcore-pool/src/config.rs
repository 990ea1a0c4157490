use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable overriding the initial worker count.
pub const THREADS_ENV: &str = "BEEPCORE_THREADS";

/// Worker count used when nothing else is configured.
pub const DEFAULT_THREADS: usize = 5;

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers started by [`WorkerPool::new`](crate::WorkerPool::new).
    pub threads: usize,
}

impl PoolConfig {
    /// Read `BEEPCORE_THREADS`, falling back to [`DEFAULT_THREADS`] when it
    /// is unset, unparsable or zero.
    pub fn from_env() -> Self {
        let threads = std::env::var(THREADS_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0)
            .unwrap_or(DEFAULT_THREADS);
        Self { threads }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_partial() {
        let config = PoolConfig::from_json(r#"{"threads": 2}"#).unwrap();
        assert_eq!(config.threads, 2);
        assert!(PoolConfig::from_json(r#"{"threads": "many"}"#).is_err());
    }

    #[test]
    fn test_with_threads() {
        assert_eq!(PoolConfig::from_env().with_threads(9).threads, 9);
    }
}
