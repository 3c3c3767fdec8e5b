pub mod comparison;
pub mod config;
pub mod db;
pub mod errors;
pub mod geocode;
pub mod ingestion;
pub mod records;
pub mod server;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseBootstrap, Store};
use crate::errors::AppResult;
use crate::geocode::{GeocodeProvider, GeocodeResolver};
use crate::ingestion::IngestionPipeline;
use crate::records::DatasetPartition;

pub use crate::errors::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub resolver: Arc<GeocodeResolver>,
    pub pipeline: Arc<IngestionPipeline>,
}

impl AppState {
    /// Opens storage, wires the Nominatim-backed resolver and seeds a fresh
    /// database from the configured dataset file.
    pub async fn initialize(config: AppConfig) -> AppResult<Self> {
        let DatabaseBootstrap { context, created } = prepare_storage(&config)?;
        let store = Store::new(context);
        let resolver = GeocodeResolver::from_config(store.clone(), &config)?;
        Self::assemble(config, store, resolver, created).await
    }

    /// Same as [`AppState::initialize`] with a caller-supplied provider.
    pub async fn with_provider(
        config: AppConfig,
        provider: Arc<dyn GeocodeProvider>,
    ) -> AppResult<Self> {
        let DatabaseBootstrap { context, created } = prepare_storage(&config)?;
        let store = Store::new(context);
        let resolver = GeocodeResolver::new(
            store.clone(),
            provider,
            config.resolver_policy(),
            config.fallback_table.clone(),
        );
        Self::assemble(config, store, resolver, created).await
    }

    async fn assemble(
        config: AppConfig,
        store: Store,
        resolver: GeocodeResolver,
        created: bool,
    ) -> AppResult<Self> {
        let resolver = Arc::new(resolver);
        let pipeline = Arc::new(IngestionPipeline::new(store.clone(), resolver.clone()));
        let state = Self {
            config: Arc::new(config),
            store,
            resolver,
            pipeline,
        };
        if created {
            state.seed().await;
        }
        Ok(state)
    }

    /// Failures are logged; the service still starts with whatever was stored.
    async fn seed(&self) {
        let path = &self.config.seed_dataset_path;
        if !path.exists() {
            info!(path = %path.display(), "no seed dataset found; starting empty");
            return;
        }
        let dataset = match DatasetPartition::parse(&self.config.seed_dataset_partition) {
            Ok(dataset) => dataset,
            Err(err) => {
                warn!(%err, "skipping seed ingestion");
                return;
            }
        };
        match self.pipeline.ingest_file(path, dataset).await {
            Ok(report) => info!(
                path = %path.display(),
                stored = report.stored_rows,
                skipped = report.skipped_rows(),
                "seed dataset loaded"
            ),
            Err(err) => warn!(path = %path.display(), %err, "seed ingestion failed"),
        }
    }
}

fn prepare_storage(config: &AppConfig) -> AppResult<DatabaseBootstrap> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.uploads_dir)?;
    bootstrap(&config.data_dir, &config.database_file_name)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,surveillance_map_lib=debug,geocode=debug,ingestion=debug")
        });
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::from_env();
    let state = AppState::initialize(config).await?;
    server::serve(state).await
}
