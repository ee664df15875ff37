//! Medallion ingestion for municipal open data: normalize, resolve municipality
//! names, load bronze/silver in chunks, refresh gold facts, trace each run.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use isla_adapters::load_registry_file;
use isla_core::MunicipalityEntry;
use isla_storage::{HttpFetcher, MemoryStore, PageArchive, PgStore, PoolConfig, Store};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod aggregate;
pub mod config;
pub mod export;
pub mod loader;
pub mod names;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod schema;
pub mod transform;

pub use aggregate::{group_facts, AggregateOutcome, AggregatePath, Aggregator};
pub use config::{SyncConfig, Territory, DATASETS_FILE, TERRITORY_FILE};
pub use export::{export_facts, ParquetManifest, ParquetManifestFile};
pub use loader::{composite_key, dedup_rows, BatchLoader, LoadStats, UpsertTarget};
pub use names::{generate_name_variations, normalize_for_matching, MatchMethod, NameIndex, NameMatch, MIN_FALLBACK_SCORE};
pub use normalize::{normalize_record, Rejection};
pub use pipeline::{run_datasets, FetchSummary, Phase, Pipeline, PipelineResult, RunSummary, StepResult};
pub use report::report_runs_markdown;
pub use schema::{DatasetCatalog, DatasetDescriptor, FactSpec, FieldKind, FieldSpec};
pub use transform::{AllowedCodes, TransformStats, Transformer};

pub const CRATE_NAME: &str = "isla-sync";

/// Everything read from the workspace root before a run: dataset catalog,
/// territory, registry, and the index built from it.
pub struct Workspace {
    pub catalog: DatasetCatalog,
    pub territory: Territory,
    pub registry: Vec<MunicipalityEntry>,
    pub index: Arc<NameIndex>,
    pub allowed: Arc<AllowedCodes>,
}

impl Workspace {
    pub async fn load(config: &SyncConfig) -> Result<Self> {
        let catalog = DatasetCatalog::load(&config.datasets_path())?;
        let (territory, registry) = load_territory(config).await?;
        let index = NameIndex::build(&registry);
        let allowed = AllowedCodes::for_territory(&territory.allowed_codes, &registry);
        info!(
            territory = %territory.name,
            municipalities = registry.len(),
            variants = index.len(),
            allowed = allowed.len(),
            datasets = catalog.datasets.len(),
            "workspace loaded"
        );
        Ok(Self {
            catalog,
            territory,
            registry,
            index: Arc::new(index),
            allowed: Arc::new(allowed),
        })
    }
}

async fn load_territory(config: &SyncConfig) -> Result<(Territory, Vec<MunicipalityEntry>)> {
    let territory = Territory::load(&config.territory_path())?;
    let registry_path = territory.registry_path(&config.workspace_root);
    let registry = load_registry_file(&registry_path)
        .await
        .with_context(|| format!("loading registry {}", registry_path.display()))?;
    Ok((territory, registry))
}

/// Name index over the configured territory's registry.
pub async fn load_name_index(config: &SyncConfig) -> Result<NameIndex> {
    let (_, registry) = load_territory(config).await?;
    Ok(NameIndex::build(&registry))
}

/// In-memory store for dry runs, PostgreSQL otherwise.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    if config.dry_run {
        info!("dry run: using the in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database_url, PoolConfig::default())
        .await
        .context("connecting to the database")?;
    Ok(Arc::new(store))
}

/// Store for commands that read what earlier runs wrote. A dry-run store
/// starts empty on every invocation, so it is refused here.
pub async fn open_durable_store(config: &SyncConfig, purpose: &str) -> Result<Arc<dyn Store>> {
    if config.dry_run {
        bail!("{purpose} reads data written by earlier runs and needs a database; unset ISLA_DRY_RUN");
    }
    open_store(config).await
}

pub fn build_pipeline(config: &SyncConfig, workspace: &Workspace, store: Arc<dyn Store>) -> Result<Pipeline> {
    let http = HttpFetcher::new(config.http_config()).context("building HTTP client")?;
    Ok(Pipeline::new(
        store,
        Arc::clone(&workspace.index),
        Arc::clone(&workspace.allowed),
        Arc::new(http),
    )
    .with_archive(config.artifacts_dir.clone().map(PageArchive::new))
    .with_defaults(config.batch_size, config.page_size))
}

/// Pipeline plus catalog, shared between CLI invocations and scheduler ticks.
#[derive(Clone)]
pub struct SyncService {
    pipeline: Arc<Pipeline>,
    catalog: Arc<DatasetCatalog>,
    running: Arc<Mutex<()>>,
}

impl SyncService {
    pub fn new(pipeline: Pipeline, catalog: DatasetCatalog) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            catalog: Arc::new(catalog),
            running: Arc::new(Mutex::new(())),
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let workspace = Workspace::load(config).await?;
        let store = open_store(config).await?;
        let pipeline = build_pipeline(config, &workspace, store)?;
        Ok(Self::new(pipeline, workspace.catalog))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn catalog(&self) -> &DatasetCatalog {
        &self.catalog
    }

    pub async fn run_dataset(&self, dataset_id: &str) -> Result<PipelineResult> {
        let descriptor = self
            .catalog
            .get(dataset_id)
            .ok_or_else(|| pipeline::unknown_dataset(dataset_id))?;
        let _guard = self.running.lock().await;
        Ok(self.pipeline.run(descriptor).await)
    }

    /// Every enabled dataset, one after another.
    pub async fn run_all(&self) -> Vec<PipelineResult> {
        let _guard = self.running.lock().await;
        run_datasets(&self.pipeline, self.catalog.enabled()).await
    }

    /// Like [`Self::run_all`], but skips instead of queueing when a run is in progress.
    pub async fn run_all_if_idle(&self) -> Option<Vec<PipelineResult>> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("previous sync still running; skipping this tick");
            return None;
        };
        Some(run_datasets(&self.pipeline, self.catalog.enabled()).await)
    }

    pub async fn maybe_build_scheduler(&self, config: &SyncConfig) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let service = self.clone();
        let cron = config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                if let Some(results) = service.run_all_if_idle().await {
                    let failed = results.iter().filter(|r| !r.success).count();
                    info!(datasets = results.len(), failed, "scheduled sync finished");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_dataset_from_env(dataset_id: &str) -> Result<PipelineResult> {
    let config = SyncConfig::from_env();
    SyncService::from_config(&config).await?.run_dataset(dataset_id).await
}

pub async fn run_all_from_env() -> Result<Vec<PipelineResult>> {
    let config = SyncConfig::from_env();
    Ok(SyncService::from_config(&config).await?.run_all().await)
}
