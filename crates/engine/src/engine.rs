//! Process-wide engine context
//!
//! An `Engine` owns everything handlers share: the shard registry, the
//! schema store, the script hooks, the bulk preparer pool, and the config.
//! Handlers are created per request from an `Arc<Engine>`.
//!
//! # Design
//!
//! - The preparer pool is created on first bulk use, so engines that never
//!   bulk index never spawn its threads
//! - Retry counters are plain atomics read through [`Engine::metrics`]

use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use vellum_concurrency::SchemaStore;
use vellum_core::{Endpoints, Method, OpenFlags, VellumResult};
use vellum_storage::{DocumentStore, ShardRegistry};

use crate::config::{VellumConfig, CONFIG_FILE_NAME};
use crate::handler::DatabaseHandler;
use crate::scheduler::WorkerPool;
use crate::script::ScriptRegistry;

/// Counters of the write and read paths
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) conflict_retries: AtomicU64,
    pub(crate) read_retries: AtomicU64,
    pub(crate) schema_publishes: AtomicU64,
    pub(crate) documents_written: AtomicU64,
}

/// Engine metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineMetrics {
    /// Single-document writes retried after a soft version conflict
    pub conflict_retries: u64,
    /// Document reads retried after a concurrent modification
    pub read_retries: u64,
    /// Schema changes published
    pub schema_publishes: u64,
    /// Stale schema publishes that forced a re-transform
    pub schema_conflicts: u64,
    /// Documents written through handlers and bulk jobs
    pub documents_written: u64,
}

/// Shared state of all handlers
pub struct Engine {
    config: VellumConfig,
    shards: ShardRegistry,
    schemas: SchemaStore,
    scripts: ScriptRegistry,
    preparers: OnceCell<WorkerPool>,
    pub(crate) counters: Counters,
}

impl Engine {
    /// Create an engine with `config`
    ///
    /// # Errors
    ///
    /// Returns a client error if the config does not validate.
    pub fn new(config: VellumConfig) -> VellumResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Engine {
            config,
            shards: ShardRegistry::new(),
            schemas: SchemaStore::new(),
            scripts: ScriptRegistry::new(),
            preparers: OnceCell::new(),
            counters: Counters::default(),
        }))
    }

    /// Create an engine configured by `vellum.toml` in `dir`
    ///
    /// A default config file is written first if there is none.
    pub fn open(dir: &Path) -> VellumResult<Arc<Self>> {
        let path = dir.join(CONFIG_FILE_NAME);
        VellumConfig::write_default_if_missing(&path)?;
        let config = VellumConfig::from_file(&path)?;
        info!(target: "vellum::engine", path = %path.display(), "Loaded config");
        Self::new(config)
    }

    /// Engine with the default config
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Engine {
            config: VellumConfig::default(),
            shards: ShardRegistry::new(),
            schemas: SchemaStore::new(),
            scripts: ScriptRegistry::new(),
            preparers: OnceCell::new(),
            counters: Counters::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &VellumConfig {
        &self.config
    }

    /// Shards known to this engine
    pub fn shards(&self) -> &ShardRegistry {
        &self.shards
    }

    /// Shared schema cache
    pub fn schemas(&self) -> &SchemaStore {
        &self.schemas
    }

    /// Side-effect hooks
    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    /// Shared bulk preparer pool
    pub fn preparers(&self) -> &WorkerPool {
        self.preparers.get_or_init(|| {
            WorkerPool::new(
                "vellum-prep",
                self.config.preparer_threads(),
                self.config.preparer_queue_depth,
            )
        })
    }

    /// Open a handler over `endpoints`
    ///
    /// # Errors
    ///
    /// `ShardNotFound` if a shard is missing and `flags` do not create it.
    pub fn handler(
        self: &Arc<Self>,
        endpoints: &Endpoints,
        flags: OpenFlags,
        method: Method,
    ) -> VellumResult<DatabaseHandler> {
        let store = self.shards.open(endpoints, flags)?;
        Ok(DatabaseHandler::new(Arc::clone(self), Arc::new(store), method))
    }

    /// Handler over an arbitrary store
    pub fn handler_for(
        self: &Arc<Self>,
        store: Arc<dyn DocumentStore>,
        method: Method,
    ) -> DatabaseHandler {
        DatabaseHandler::new(Arc::clone(self), store, method)
    }

    /// Snapshot of the retry and write counters
    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            conflict_retries: self.counters.conflict_retries.load(Ordering::Relaxed),
            read_retries: self.counters.read_retries.load(Ordering::Relaxed),
            schema_publishes: self.counters.schema_publishes.load(Ordering::Relaxed),
            schema_conflicts: self.schemas.stale_publishes(),
            documents_written: self.counters.documents_written.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("shards", &self.shards.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}
