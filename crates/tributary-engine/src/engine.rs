//! The engine container.
//!
//! One `Engine` owns its configuration, WAL store, registry, and services;
//! nothing is process-global, so tests (and embedders) run several
//! independent engines side by side with different flags and backends.

use std::sync::Arc;

use mongodb::Client;
use tracing::info;
use tributary_core::{BranchDescriptor, CoreError, CoreResult, EngineConfig};
use tributary_registry::{MemoryRegistryBackend, MongoRegistryBackend, Registry, RegistryBackend};
use tributary_wal::{MemoryWalBackend, MongoWalBackend, WalBackend, WalStore};

use crate::interceptor::Interceptor;
use crate::materializer::Materializer;
use crate::monitor::Monitor;
use crate::restore::RestoreService;
use crate::timetravel::TimeTravel;

/// A fully wired branching engine over injected backends.
pub struct Engine {
    config: EngineConfig,
    wal: Arc<WalStore>,
    registry: Arc<Registry>,
    interceptor: Interceptor,
    materializer: Arc<Materializer>,
    time_travel: Arc<TimeTravel>,
    restore: RestoreService,
    monitor: Monitor,
}

impl Engine {
    /// Wires an engine over the given backends.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when WAL recovery fails.
    pub async fn open(
        config: EngineConfig,
        wal_backend: Arc<dyn WalBackend>,
        registry_backend: Arc<dyn RegistryBackend>,
    ) -> CoreResult<Arc<Self>> {
        let enabled = config.enable_wal;
        let wal = WalStore::open(wal_backend, config.wal.clone(), enabled).await?;
        let registry = Arc::new(Registry::new(registry_backend, wal.clone(), enabled));
        let materializer = Arc::new(Materializer::new(
            wal.clone(),
            registry.clone(),
            &config.cache,
        ));
        let time_travel = Arc::new(TimeTravel::new(
            wal.clone(),
            registry.clone(),
            materializer.clone(),
        ));
        let restore = RestoreService::new(
            wal.clone(),
            registry.clone(),
            materializer.clone(),
            time_travel.clone(),
        );
        let interceptor = Interceptor::new(wal.clone(), registry.clone());
        let monitor = Monitor::new(wal.clone(), registry.clone());

        info!(enabled, "engine opened");
        Ok(Arc::new(Self {
            config,
            wal,
            registry,
            interceptor,
            materializer,
            time_travel,
            restore,
            monitor,
        }))
    }

    /// An engine over in-memory backends; the usual test entry point.
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open).
    pub async fn in_memory(config: EngineConfig) -> CoreResult<Arc<Self>> {
        Self::open(
            config,
            Arc::new(MemoryWalBackend::new()),
            Arc::new(MemoryRegistryBackend::new()),
        )
        .await
    }

    /// Connects to a MongoDB deployment and opens the engine on the named
    /// dedicated logical database.
    ///
    /// # Errors
    ///
    /// `Storage` on connection, index-creation, or recovery failure.
    pub async fn connect(
        config: EngineConfig,
        uri: &str,
        db_name: &str,
    ) -> CoreResult<Arc<Self>> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|err| CoreError::storage(err.to_string()))?;
        let database = client.database(db_name);
        let wal_backend = Arc::new(MongoWalBackend::new(&database).await?);
        let registry_backend = Arc::new(MongoRegistryBackend::new(&database).await?);
        Self::open(config, wal_backend, registry_backend).await
    }

    /// Resolves `(project name, branch name)` to a branch descriptor.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Disabled`, or `Storage`.
    pub async fn resolve_branch(
        &self,
        project_name: &str,
        branch_name: &str,
    ) -> CoreResult<BranchDescriptor> {
        let project = self.registry.get_project_by_name(project_name).await?;
        self.registry.get_branch(project.project_id, branch_name).await
    }

    /// Flushes and stops the WAL store.
    ///
    /// # Errors
    ///
    /// Returns the final flush's error, if any.
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.wal.close().await
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn wal(&self) -> &Arc<WalStore> {
        &self.wal
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    #[must_use]
    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    #[must_use]
    pub fn time_travel(&self) -> &Arc<TimeTravel> {
        &self.time_travel
    }

    #[must_use]
    pub fn restore(&self) -> &RestoreService {
        &self.restore
    }

    #[must_use]
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }
}
