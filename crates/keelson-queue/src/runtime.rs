// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable queue runtime.
//!
//! [`QueueRuntime`] runs the worker pool, cron scheduler, lease rescuer and job
//! pruner as tasks of an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use keelson_queue::{Config, QueueRuntime, WorkflowRegistry, connect};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = connect(&config).await?;
//!
//!     let runtime = QueueRuntime::builder()
//!         .store(store)
//!         .config(config)
//!         .registry(WorkflowRegistry::new().register(place_order()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.queue().enqueue_workflow("default", "place_order", inputs, &actor, Default::default()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use keelson_core::WorkflowExecutor;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::QueueError;
use crate::persistence::{JobStore, PostgresJobStore, SqliteJobStore};
use crate::pruner::{JobPruner, JobPrunerConfig};
use crate::queue::JobQueue;
use crate::registry::WorkflowRegistry;
use crate::rescuer::{LeaseRescuer, LeaseRescuerConfig};
use crate::scheduler::{CronEntry, CronScheduler};
use crate::worker::{Worker, WorkerPool};

/// Open the store named by `config.database_url` and run its migrations.
///
/// `sqlite:` URLs use [`SqliteJobStore`], `postgres://` and `postgresql://`
/// URLs use [`PostgresJobStore`].
pub async fn connect(config: &Config) -> std::result::Result<Arc<dyn JobStore>, QueueError> {
    let url = config.database_url.as_str();
    if url.starts_with("sqlite:") {
        info!("Using SQLite job store");
        Ok(Arc::new(SqliteJobStore::connect(url).await?))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        info!("Using PostgreSQL job store");
        Ok(Arc::new(PostgresJobStore::connect(url).await?))
    } else {
        Err(QueueError::UnsupportedDatabase(url.to_string()))
    }
}

/// Builder for creating a [`QueueRuntime`].
pub struct QueueRuntimeBuilder {
    store: Option<Arc<dyn JobStore>>,
    registry: WorkflowRegistry,
    config: Option<Config>,
    executor: Option<WorkflowExecutor>,
    cron: Vec<CronEntry>,
    rescuer: LeaseRescuerConfig,
    pruner: JobPrunerConfig,
}

impl std::fmt::Debug for QueueRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("cron", &self.cron)
            .field("rescuer", &self.rescuer)
            .field("pruner", &self.pruner)
            .finish()
    }
}

impl Default for QueueRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: WorkflowRegistry::new(),
            config: None,
            executor: None,
            cron: Vec::new(),
            rescuer: LeaseRescuerConfig::default(),
            pruner: JobPrunerConfig::default(),
        }
    }
}

impl QueueRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job store (required).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the workflows workers can run.
    pub fn registry(mut self, registry: WorkflowRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set queue, worker and retry settings (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom executor, e.g. one with an authorizer.
    ///
    /// Default: an executor built from the config's step concurrency.
    pub fn executor(mut self, executor: WorkflowExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Add a cron entry.
    pub fn cron(mut self, entry: CronEntry) -> Self {
        self.cron.push(entry);
        self
    }

    /// Configure the lease rescuer.
    pub fn rescuer(mut self, config: LeaseRescuerConfig) -> Self {
        self.rescuer = config;
        self
    }

    /// Configure the job pruner.
    pub fn pruner(mut self, config: JobPrunerConfig) -> Self {
        self.pruner = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<QueueRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        if config.queues.is_empty() {
            anyhow::bail!("at least one queue is required");
        }
        let executor = self
            .executor
            .unwrap_or_else(|| WorkflowExecutor::new(config.executor_config()));

        Ok(QueueRuntimeConfig {
            store,
            registry: self.registry,
            config,
            executor,
            cron: self.cron,
            rescuer: self.rescuer,
            pruner: self.pruner,
        })
    }
}

/// Configuration for a [`QueueRuntime`].
pub struct QueueRuntimeConfig {
    store: Arc<dyn JobStore>,
    registry: WorkflowRegistry,
    config: Config,
    executor: WorkflowExecutor,
    cron: Vec<CronEntry>,
    rescuer: LeaseRescuerConfig,
    pruner: JobPrunerConfig,
}

impl std::fmt::Debug for QueueRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntimeConfig")
            .field("store", &"...")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("cron", &self.cron)
            .finish()
    }
}

impl QueueRuntimeConfig {
    /// Start the runtime, spawning the background tasks.
    pub async fn start(self) -> Result<QueueRuntime> {
        let queue = JobQueue::new(self.store.clone(), self.config.queue_settings());
        let shutdown = CancellationToken::new();
        let poll_interval = self.config.poll_interval;

        let discard_hook = self.registry.discard_hook().cloned();
        let worker = Worker::new(queue.clone(), self.registry, self.executor)
            .with_poll_interval(poll_interval);
        let pool = WorkerPool::new(
            worker,
            self.config.queues.clone(),
            self.config.worker_concurrency,
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let token = shutdown.clone();
        tasks.push(("worker pool", tokio::spawn(async move { pool.run(token).await })));

        if !self.cron.is_empty() {
            let scheduler =
                CronScheduler::new(queue.clone(), self.cron).with_poll_interval(poll_interval);
            tasks.push(("cron scheduler", tokio::spawn(scheduler.run(shutdown.clone()))));
        }

        let mut rescuer = LeaseRescuer::new(self.store.clone(), self.rescuer);
        if let Some(hook) = discard_hook {
            rescuer = rescuer.with_discard_hook(hook);
        }
        let token = shutdown.clone();
        tasks.push((
            "lease rescuer",
            tokio::spawn(async move { rescuer.run(token).await }),
        ));

        let pruner = JobPruner::new(self.store, self.pruner);
        let token = shutdown.clone();
        tasks.push(("job pruner", tokio::spawn(async move { pruner.run(token).await })));

        info!(
            queues = ?self.config.queues,
            worker_concurrency = self.config.worker_concurrency,
            "QueueRuntime started"
        );

        Ok(QueueRuntime {
            queue,
            shutdown,
            tasks,
        })
    }
}

/// A running queue runtime.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination: workers stop
/// leasing and jobs already running finish first.
pub struct QueueRuntime {
    queue: JobQueue,
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("queue", &self.queue)
            .field("tasks", &self.tasks.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish()
    }
}

impl QueueRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> QueueRuntimeBuilder {
        QueueRuntimeBuilder::new()
    }

    /// The queue, for enqueuing and inspecting jobs.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Check if any background task is still running.
    ///
    /// Disabled maintenance tasks finish right after start.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Gracefully shut down the runtime and wait for all tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("QueueRuntime shutting down...");
        self.shutdown.cancel();

        let mut failed = None;
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!(task = name, "QueueRuntime task panicked: {}", e);
                failed.get_or_insert(anyhow::anyhow!("{} task panicked: {}", name, e));
            }
        }

        match failed {
            Some(e) => Err(e),
            None => {
                info!("QueueRuntime shutdown complete");
                Ok(())
            }
        }
    }
}
