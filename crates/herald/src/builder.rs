use herald_extras::config::{env_var, load_dotenv, Config, ConfigError, Environment};
use herald_extras::logging::{init_tracing, LogFormat, LoggingConfig};
use herald_jobs::{
    Clock, Engine, EngineConfig, FileStore, InMemoryStore, JobError, JobStore, SystemClock,
    Transport,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Prefix of every environment variable Herald reads.
pub const ENV_PREFIX: &str = "HERALD";

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] JobError),
}

/// Where jobs are kept when no store is supplied explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreChoice {
    /// Jobs live only as long as the process.
    #[default]
    Memory,
    /// Jobs are snapshotted to a JSON file after every change.
    File(PathBuf),
}

/// Application builder wiring configuration, logging, a store and a
/// transport into a running [`Engine`].
///
/// # Example
///
/// ```rust,ignore
/// use herald::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> Result<(), HeraldError> {
///     Herald::from_env()?
///         .run(MyTransport::new(), async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await
/// }
/// ```
pub struct Herald {
    config: EngineConfig,
    logging: Option<LoggingConfig>,
    store: Option<Arc<dyn JobStore>>,
    store_choice: StoreChoice,
    clock: Arc<dyn Clock>,
    environment: Environment,
}

impl Default for Herald {
    fn default() -> Self {
        Self::new()
    }
}

impl Herald {
    /// Defaults everywhere: in-memory store, wall clock, compact logs.
    pub fn new() -> Self {
        let environment = Environment::current();
        let logging = LoggingConfig::default().default_filter(environment.default_log_filter());
        Self {
            config: EngineConfig::default(),
            logging: Some(logging),
            store: None,
            store_choice: StoreChoice::Memory,
            clock: Arc::new(SystemClock),
            environment,
        }
    }

    /// Read `.env`, then `HERALD_*` variables.
    ///
    /// Besides the [`EngineConfig`] fields this honours `HERALD_STORE_PATH`
    /// (use a [`FileStore`]) and `HERALD_LOG_FORMAT` (`compact`, `pretty` or
    /// `json`; production defaults to `json`).
    pub fn from_env() -> Result<Self, HeraldError> {
        load_dotenv();

        let config = Config::<EngineConfig>::from_env_prefixed(ENV_PREFIX)?.into_inner();
        let mut herald = Self::new().config(config);

        if let Some(path) = env_var::<PathBuf>(&format!("{}_STORE_PATH", ENV_PREFIX))? {
            herald.store_choice = StoreChoice::File(path);
        }

        let format = match env_var::<LogFormat>(&format!("{}_LOG_FORMAT", ENV_PREFIX))? {
            Some(format) => format,
            None if herald.environment.is_production() => LogFormat::Json,
            None => LogFormat::Compact,
        };
        herald.logging = herald.logging.map(|logging| logging.format(format));

        Ok(herald)
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn store_choice(&self) -> &StoreChoice {
        &self.store_choice
    }

    /// Use this store instead of the configured one.
    pub fn store<S: JobStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist jobs to a JSON snapshot at `path`.
    pub fn file_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_choice = StoreChoice::File(path.into());
        self
    }

    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Leave subscriber installation to the caller.
    pub fn without_logging(mut self) -> Self {
        self.logging = None;
        self
    }

    fn open_store(&mut self) -> Result<Arc<dyn JobStore>, HeraldError> {
        if let Some(store) = self.store.take() {
            return Ok(store);
        }
        Ok(match &self.store_choice {
            StoreChoice::Memory => Arc::new(InMemoryStore::new()),
            StoreChoice::File(path) => Arc::new(FileStore::open(path.clone())?),
        })
    }

    /// Install logging and wire the engine without starting it.
    pub fn build<T: Transport + 'static>(mut self, transport: T) -> Result<Engine, HeraldError> {
        if let Some(logging) = &self.logging {
            init_tracing(logging);
        }

        let store = self.open_store()?;
        let engine = Engine::with_clock(
            store,
            Arc::new(transport),
            Arc::clone(&self.clock),
            self.config.clone(),
        )?;

        tracing::info!(
            environment = %self.environment,
            store = ?self.store_choice,
            worker = %engine.scheduler().worker_id(),
            "herald engine ready"
        );
        Ok(engine)
    }

    /// Run the scheduler until `shutdown` resolves, then drain in-flight
    /// dispatches.
    pub async fn run<T, F>(self, transport: T, shutdown: F) -> Result<(), HeraldError>
    where
        T: Transport + 'static,
        F: Future<Output = ()>,
    {
        let engine = self.build(transport)?;
        let handle = engine.spawn();

        shutdown.await;
        tracing::info!("shutdown requested");
        handle.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Herald {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Herald")
            .field("config", &self.config)
            .field("logging", &self.logging)
            .field("store_choice", &self.store_choice)
            .field("custom_store", &self.store.is_some())
            .field("environment", &self.environment)
            .finish()
    }
}
