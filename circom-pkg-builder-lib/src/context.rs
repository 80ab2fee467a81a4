use crate::backend::{PtauCatalog, SnarkBackend, SnarkjsCli};
use crate::compiler::{BuildWorkspace, CircomCompiler, CircuitCompiler};
use crate::config::BuilderConfig;
use crate::error::{Error, Result};
use crate::keys::KeyResolver;
use crate::packager::Packager;
use crate::state::PackageIndex;
use crate::status::{StatusLocks, StatusReporter};
use crate::storage::{self, ObjectStore};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

/// Process-wide handles shared by every build: storage, tools, the package
/// index, and the worker slots that bound concurrent tool runs.
#[derive(Clone, Debug)]
pub struct BuildContext {
    config: Arc<BuilderConfig>,
    store: Arc<dyn ObjectStore>,
    compiler: Arc<dyn CircuitCompiler>,
    backend: Arc<dyn SnarkBackend>,
    keys: KeyResolver,
    index: PackageIndex,
    packager: Packager,
    status_locks: StatusLocks,
    slots: Arc<Semaphore>,
}

impl BuildContext {
    /// Wires the production collaborators named by `config`.
    pub fn from_config(config: BuilderConfig) -> Result<Self> {
        config.validate()?;
        let store = storage::from_config(&config.store)?;
        let compiler = Arc::new(CircomCompiler::new(
            config.compilers_dir.clone(),
            config.include_dirs.clone(),
            config.compile_timeout(),
        ));
        let backend = Arc::new(SnarkjsCli::new(
            config.snarkjs_bin.clone(),
            config.setup_timeout(),
        ));
        let index = PackageIndex::open(&config.data_dir)?;
        info!(
            data_dir = %config.data_dir.display(),
            slots = config.max_concurrent_builds,
            "Build context ready"
        );
        Self::with_parts(config, store, compiler, backend, index)
    }

    /// Assembles a context from explicit collaborators.
    pub fn with_parts(
        config: BuilderConfig,
        store: Arc<dyn ObjectStore>,
        compiler: Arc<dyn CircuitCompiler>,
        backend: Arc<dyn SnarkBackend>,
        index: PackageIndex,
    ) -> Result<Self> {
        config.validate()?;
        let keys = KeyResolver::new(&config.key_fetch)?;
        let packager = Packager::new(
            store.clone(),
            index.clone(),
            &config.package_prefix,
            &config.snarkjs_version,
        );
        let slots = Arc::new(Semaphore::new(config.max_concurrent_builds));
        Ok(Self {
            config: Arc::new(config),
            store,
            compiler,
            backend,
            keys,
            index,
            packager,
            status_locks: StatusLocks::new(),
            slots,
        })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn compiler(&self) -> &dyn CircuitCompiler {
        self.compiler.as_ref()
    }

    pub fn backend(&self) -> &dyn SnarkBackend {
        self.backend.as_ref()
    }

    pub fn keys(&self) -> &KeyResolver {
        &self.keys
    }

    pub fn index(&self) -> &PackageIndex {
        &self.index
    }

    pub fn packager(&self) -> &Packager {
        &self.packager
    }

    /// Reporter for one request's log. Reporters for the same id share a lock.
    pub fn status_reporter(&self, request_id: &str) -> StatusReporter {
        StatusReporter::new(self.store.clone(), &self.status_locks, request_id)
    }

    /// Universal setup files currently on disk.
    pub fn ptau_catalog(&self) -> Result<PtauCatalog> {
        PtauCatalog::scan(&self.config.ptau_dir)
    }

    pub fn workspace(&self, request_id: &str) -> Result<BuildWorkspace> {
        BuildWorkspace::create(self.config.work_dir.as_deref(), request_id)
    }

    /// Waits for a worker slot. Held for the span of a build's tool runs.
    pub async fn worker_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.slots
            .acquire()
            .await
            .map_err(|_| Error::ConfigError("worker slots are closed".to_string()))
    }
}
