//! Worker threads for asynchronous channel dispatch.
//!
//! Frame delivery, threaded channel creation and threaded close all run as
//! tasks on a [`WorkerPool`]. Workers pull [`PoolMessage`]s from a shared
//! [`BlockingQueue`]; control messages travel through the same queue as
//! tasks so resizing and shutdown are ordered with respect to queued work.

pub mod config;
pub mod error;
pub mod pool;
pub mod queue;
pub mod sync;

pub use config::{PoolConfig, DEFAULT_THREADS, THREADS_ENV};
pub use error::{PoolError, Result};
pub use pool::{PoolMessage, PoolStats, Task, WorkerPool};
pub use queue::BlockingQueue;
