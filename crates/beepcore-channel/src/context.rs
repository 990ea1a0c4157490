use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use beepcore_pool::sync::{lock, read, write};
use beepcore_pool::WorkerPool;
use tracing::debug;

use crate::admin::{AdminParser, ManagementParser};
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::flow::FrameSizeHandler;
use crate::profiles::ProfileRegistry;

/// Process-wide state shared by every channel: worker pool, profile
/// registry, management parser and configuration.
pub struct Context {
    config: ChannelConfig,
    pool: WorkerPool,
    profiles: ProfileRegistry,
    parser: Box<dyn AdminParser>,
    frame_size: RwLock<Option<Arc<dyn FrameSizeHandler>>>,
}

impl Context {
    pub fn new(config: ChannelConfig) -> Result<Arc<Self>> {
        Self::with_parser(config, ManagementParser)
    }

    /// Use a custom parser for channel 0 messages.
    pub fn with_parser(config: ChannelConfig, parser: impl AdminParser + 'static) -> Result<Arc<Self>> {
        let pool = WorkerPool::from_config(&config.pool)?;
        debug!(threads = config.pool.threads, "context initialized");
        Ok(Arc::new(Self {
            config,
            pool,
            profiles: ProfileRegistry::new(),
            parser: Box::new(parser),
            frame_size: RwLock::new(None),
        }))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn parser(&self) -> &dyn AdminParser {
        self.parser.as_ref()
    }

    /// Run `task` on the worker pool. Returns false when the pool is stopping.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(task)
    }

    /// Run `task` on the worker pool, or on the calling thread once the pool
    /// is stopping. Completion callbacks are reported either way.
    pub fn submit_or_run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(task)));
        let queued = Arc::clone(&slot);
        let submitted = self.pool.submit(move || {
            let task = lock(&queued).take();
            if let Some(task) = task {
                task();
            }
        });
        if !submitted {
            debug!("worker pool stopping, task runs inline");
            let task = lock(&slot).take();
            if let Some(task) = task {
                task();
            }
        }
    }

    /// Install the process-wide frame size handler, the last level consulted
    /// before the built-in default.
    pub fn set_frame_size_handler(&self, handler: Option<Arc<dyn FrameSizeHandler>>) {
        *write(&self.frame_size) = handler;
    }

    pub fn frame_size_handler(&self) -> Option<Arc<dyn FrameSizeHandler>> {
        read(&self.frame_size).clone()
    }

    /// Stop the worker pool. Pending asynchronous deliveries are discarded.
    pub fn shutdown(&self) {
        self.pool.stop();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("profiles", &self.profiles)
            .finish()
    }
}
