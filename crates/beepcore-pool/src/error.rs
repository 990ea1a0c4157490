/// Errors that can occur while managing the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The pool was asked for zero threads.
    #[error("worker pool needs at least one thread")]
    NoThreads,

    /// The pool is shutting down.
    #[error("worker pool is stopping")]
    Stopping,

    /// Configuration could not be parsed.
    #[error("invalid pool configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
