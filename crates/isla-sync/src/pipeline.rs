//! Per-dataset orchestration: fetch → load_bronze → transform → load_silver →
//! refresh_facts, traced as one Run with one Step per phase.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use isla_adapters::{adapter_for_spec, drain_source, AdapterContext, SourceAdapter};
use isla_core::{BronzeRecord, RawRecord, Row, Run, RunStatus, SilverRecord, Step, StepStatus};
use isla_storage::{HttpFetcher, PageArchive, Store};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{AggregateOutcome, Aggregator};
use crate::loader::{BatchLoader, LoadStats, UpsertTarget};
use crate::names::NameIndex;
use crate::schema::DatasetDescriptor;
use crate::transform::{AllowedCodes, TransformStats, Transformer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetch,
    LoadBronze,
    Transform,
    LoadSilver,
    RefreshFacts,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Fetch,
        Phase::LoadBronze,
        Phase::Transform,
        Phase::LoadSilver,
        Phase::RefreshFacts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::LoadBronze => "load_bronze",
            Phase::Transform => "transform",
            Phase::LoadSilver => "load_silver",
            Phase::RefreshFacts => "refresh_facts",
        }
    }

    /// A failed mandatory phase fails the run; an optional one does not.
    pub fn is_mandatory(self) -> bool {
        !matches!(self, Phase::RefreshFacts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub rows: usize,
    pub pages: usize,
}

/// Counters per phase; phases that never ran keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub fetch: FetchSummary,
    pub bronze: LoadStats,
    pub transform: TransformStats,
    pub silver: LoadStats,
    pub facts: Option<AggregateOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub dataset_id: String,
    pub run_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: RunSummary,
    pub steps: Vec<StepResult>,
}

struct PhaseFailure {
    phase: Phase,
    message: String,
}

/// Shared inputs of every run: the store, the name index, and the fetch stack.
pub struct Pipeline {
    store: Arc<dyn Store>,
    index: Arc<NameIndex>,
    allowed: Arc<AllowedCodes>,
    http: Arc<HttpFetcher>,
    archive: Option<PageArchive>,
    default_batch_size: usize,
    default_page_size: usize,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<NameIndex>,
        allowed: Arc<AllowedCodes>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            store,
            index,
            allowed,
            http,
            archive: None,
            default_batch_size: 500,
            default_page_size: 1000,
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_defaults(mut self, batch_size: usize, page_size: usize) -> Self {
        self.default_batch_size = batch_size;
        self.default_page_size = page_size;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn index(&self) -> &NameIndex {
        &self.index
    }

    /// Run one dataset against the adapter its source declaration selects.
    pub async fn run(&self, descriptor: &DatasetDescriptor) -> PipelineResult {
        let adapter = adapter_for_spec(&descriptor.source, Arc::clone(&self.http));
        self.run_with_adapter(descriptor, adapter.as_ref()).await
    }

    /// Run one dataset. Never fails: every error is folded into the result.
    pub async fn run_with_adapter(&self, descriptor: &DatasetDescriptor, adapter: &dyn SourceAdapter) -> PipelineResult {
        let run = Run::start(
            descriptor.id.clone(),
            json!({
                "dataset": descriptor.id,
                "source_kind": descriptor.source.kind(),
                "resource_id": descriptor.source.resource_id(),
                "silver_table": descriptor.silver_table,
            }),
        );
        let mut result = PipelineResult {
            dataset_id: descriptor.id.clone(),
            run_id: run.id,
            success: false,
            error: None,
            summary: RunSummary::default(),
            steps: Vec::new(),
        };

        if let Err(error) = self.store.create_run(&run).await {
            error!(dataset = %descriptor.id, run_id = %run.id, %error, "could not record run start");
            result.error = Some(format!("creating run: {error}"));
            return result;
        }
        info!(dataset = %descriptor.id, run_id = %run.id, "pipeline run started");

        let outcome = self
            .execute(&run, descriptor, adapter, &mut result)
            .instrument(info_span!("pipeline_run", run_id = %run.id, dataset = %descriptor.id))
            .await;

        let (status, metadata) = match &outcome {
            Ok(()) => (
                RunStatus::Completed,
                json!({ "dataset": descriptor.id, "summary": result.summary }),
            ),
            Err(failure) => (
                RunStatus::Failed,
                json!({
                    "dataset": descriptor.id,
                    "summary": result.summary,
                    "failed_step": failure.phase.name(),
                    "error": failure.message,
                }),
            ),
        };
        if let Err(error) = self.store.finish_run(run.id, status, Utc::now(), &metadata).await {
            warn!(run_id = %run.id, %error, "could not record run end");
        }

        result.success = outcome.is_ok();
        if let Err(failure) = outcome {
            result.error = Some(format!("{} failed: {}", failure.phase.name(), failure.message));
        }
        info!(
            dataset = %descriptor.id,
            run_id = %run.id,
            success = result.success,
            status = %status,
            "pipeline run finished"
        );
        result
    }

    async fn execute(
        &self,
        run: &Run,
        descriptor: &DatasetDescriptor,
        adapter: &dyn SourceAdapter,
        result: &mut PipelineResult,
    ) -> Result<(), PhaseFailure> {
        let resource_id = descriptor.source.resource_id().to_string();
        let batch_size = descriptor.batch_size_or(self.default_batch_size);
        let page_size = descriptor.page_size_or(self.default_page_size);
        let loader = BatchLoader::new(self.store.persistence());

        let rows = self
            .step(run.id, Phase::Fetch, &mut result.steps, async {
                let ctx = AdapterContext::new(run.id, &descriptor.id).with_archive(self.archive.clone());
                let drained = drain_source(adapter, &ctx, &resource_id, page_size).await?;
                Ok::<_, anyhow::Error>(drained)
            })
            .await?;
        result.summary.fetch = FetchSummary {
            rows: rows.rows.len(),
            pages: rows.pages,
        };
        let rows: Vec<RawRecord> = rows.rows;

        result.summary.bronze = self
            .step(run.id, Phase::LoadBronze, &mut result.steps, async {
                let bronze: Vec<Row> = rows
                    .iter()
                    .map(|raw| BronzeRecord::new(&descriptor.id, &resource_id, run.id, raw.clone()).to_row())
                    .collect();
                loader.insert(&descriptor.bronze_table, &bronze, batch_size).await
            })
            .await?;

        let (records, transform_stats) = self
            .step(run.id, Phase::Transform, &mut result.steps, async {
                let transformer = Transformer::new(descriptor, &self.index, &self.allowed);
                let (records, stats) = transformer.transform(&resource_id, &rows);
                info!(
                    accepted = stats.accepted,
                    rejected = stats.rejected_total(),
                    unresolved = stats.unresolved,
                    "transform finished"
                );
                Ok::<(Vec<SilverRecord>, TransformStats), anyhow::Error>((records, stats))
            })
            .await?;
        result.summary.transform = transform_stats;

        result.summary.silver = self
            .step(run.id, Phase::LoadSilver, &mut result.steps, async {
                let silver: Vec<Row> = records.iter().map(SilverRecord::to_row).collect();
                let target = UpsertTarget::new(&descriptor.silver_table, descriptor.key.clone(), batch_size)
                    .with_reference(descriptor.references.clone())
                    .with_procedure(descriptor.upsert_procedure.clone());
                loader.upsert(&silver, &target).await
            })
            .await?;

        if let Some(facts) = &descriptor.facts {
            let refreshed = self
                .step(run.id, Phase::RefreshFacts, &mut result.steps, async {
                    Aggregator::new(self.store.persistence(), batch_size)
                        .refresh(&descriptor.id, &descriptor.silver_table, facts)
                        .await
                })
                .await;
            match refreshed {
                Ok(outcome) => result.summary.facts = Some(outcome),
                Err(failure) => warn!(
                    dataset = %descriptor.id,
                    error = %failure.message,
                    "optional phase failed; run continues"
                ),
            }
        }
        Ok(())
    }

    /// Bracket one phase with its Step record.
    async fn step<T, F>(&self, run_id: Uuid, phase: Phase, steps: &mut Vec<StepResult>, work: F) -> Result<T, PhaseFailure>
    where
        F: Future<Output = Result<T>>,
    {
        let step = Step::start(run_id, phase.name());
        if let Err(error) = self.store.create_step(&step).await {
            warn!(step = phase.name(), %error, "could not record step start");
        }

        let outcome = work
            .instrument(info_span!("pipeline_step", step = phase.name(), mandatory = phase.is_mandatory()))
            .await;
        let ended_at = Utc::now();
        let duration_ms = (ended_at - step.started_at).num_milliseconds();

        let (status, message) = match &outcome {
            Ok(_) => (StepStatus::Completed, None),
            Err(error) => (StepStatus::Failed, Some(format!("{error:#}"))),
        };
        if let Err(error) = self
            .store
            .finish_step(step.id, status, ended_at, message.as_deref())
            .await
        {
            warn!(step = phase.name(), %error, "could not record step end");
        }
        match &message {
            Some(message) if phase.is_mandatory() => error!(step = phase.name(), error = %message, "step failed"),
            Some(message) => warn!(step = phase.name(), error = %message, "step failed"),
            None => info!(step = phase.name(), duration_ms, "step completed"),
        }
        steps.push(StepResult {
            name: phase.name().to_string(),
            status,
            duration_ms,
            error: message.clone(),
        });

        outcome.map_err(|_| PhaseFailure {
            phase,
            message: message.unwrap_or_default(),
        })
    }
}

/// Run every descriptor in turn; one dataset's failure does not stop the next.
pub async fn run_datasets<'a>(
    pipeline: &Pipeline,
    descriptors: impl IntoIterator<Item = &'a DatasetDescriptor>,
) -> Vec<PipelineResult> {
    let mut results = Vec::new();
    for descriptor in descriptors {
        results.push(pipeline.run(descriptor).await);
    }
    results
}

/// Error for a dataset id missing from the catalog.
pub fn unknown_dataset(id: &str) -> anyhow::Error {
    anyhow!("dataset {id} is not declared in the catalog")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DatasetCatalog;
    use async_trait::async_trait;
    use chrono::DateTime;
    use isla_adapters::{AdapterError, PageRequest, SourceKind};
    use isla_core::MunicipalityEntry;
    use isla_storage::{
        Filter, HttpClientConfig, MemoryStore, Persistence, RunLedger, StoreError, WriteReport,
    };
    use serde_json::Value as JsonValue;

    const CATALOG: &str = r#"
datasets:
  - id: alojamientos
    display_name: Alojamientos
    source: { kind: fixture, path: unused.json, resource_id: aloj-2024 }
    silver_table: silver_alojamientos
    municipality: { source: [municipio] }
    fields:
      - { name: nombre, kind: text, required: true }
      - { name: modalidad, kind: text, required: true, allowed: [hotelera, extrahotelera] }
      - { name: plazas, kind: integer }
    key: [source_resource_id, municipality_normalized, nombre]
    facts:
      table: fact_alojamientos
      procedure: refresh_fact_alojamientos
      dimensions: [modalidad]
      measures: [plazas]
"#;

    fn descriptor() -> DatasetDescriptor {
        DatasetCatalog::from_yaml_str(CATALOG).unwrap().datasets.remove(0)
    }

    struct RowsSource(Vec<RawRecord>);

    #[async_trait]
    impl SourceAdapter for RowsSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Fixture
        }

        async fn fetch_page(&self, _ctx: &AdapterContext, request: &PageRequest) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(self.0.iter().skip(request.offset).take(request.limit).cloned().collect())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl SourceAdapter for BrokenSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Ckan
        }

        async fn fetch_page(&self, _ctx: &AdapterContext, _request: &PageRequest) -> Result<Vec<RawRecord>, AdapterError> {
            Err(AdapterError::SourceFailure("resource not found".into()))
        }
    }

    /// Memory store whose fact table cannot be written or counted.
    struct BrokenFacts(MemoryStore);

    #[async_trait]
    impl Persistence for BrokenFacts {
        async fn insert(&self, table: &str, rows: &[Row]) -> Result<WriteReport, StoreError> {
            self.0.insert(table, rows).await
        }
        async fn upsert(&self, table: &str, rows: &[Row], key: &[String]) -> Result<WriteReport, StoreError> {
            if table.starts_with("fact_") {
                return Err(StoreError::Message("relation does not exist".into()));
            }
            self.0.upsert(table, rows, key).await
        }
        async fn select_column(&self, table: &str, column: &str, filter: &Filter) -> Result<Vec<JsonValue>, StoreError> {
            self.0.select_column(table, column, filter).await
        }
        async fn delete_keys(&self, table: &str, key_columns: &[String], keys: &[Row]) -> Result<u64, StoreError> {
            self.0.delete_keys(table, key_columns, keys).await
        }
        async fn select_rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
            self.0.select_rows(table, filter).await
        }
        async fn call_procedure(&self, name: &str, args: &JsonValue) -> Result<JsonValue, StoreError> {
            self.0.call_procedure(name, args).await
        }
        async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
            self.0.count_rows(table).await
        }
    }

    #[async_trait]
    impl RunLedger for BrokenFacts {
        async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
            self.0.create_run(run).await
        }
        async fn finish_run(&self, id: Uuid, status: RunStatus, at: DateTime<Utc>, meta: &JsonValue) -> Result<(), StoreError> {
            self.0.finish_run(id, status, at, meta).await
        }
        async fn create_step(&self, step: &Step) -> Result<(), StoreError> {
            self.0.create_step(step).await
        }
        async fn finish_step(&self, id: Uuid, status: StepStatus, at: DateTime<Utc>, err: Option<&str>) -> Result<(), StoreError> {
            self.0.finish_step(id, status, at, err).await
        }
        async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
            self.0.list_runs(limit).await
        }
        async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
            self.0.get_run(id).await
        }
        async fn list_steps(&self, id: Uuid) -> Result<Vec<Step>, StoreError> {
            self.0.list_steps(id).await
        }
    }

    fn pipeline(store: Arc<dyn Store>) -> Pipeline {
        let registry = vec![
            MunicipalityEntry::new("38032", "Los Realejos"),
            MunicipalityEntry::new("38026", "La Orotava"),
        ];
        let allowed = AllowedCodes::for_territory(&[], &registry);
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        Pipeline::new(store, Arc::new(NameIndex::build(&registry)), Arc::new(allowed), Arc::new(http))
            .with_defaults(2, 2)
    }

    fn raw(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn realejos_rows() -> Vec<RawRecord> {
        vec![
            raw(json!({"municipio": "Realejos, Los", "modalidad": "hotelera", "nombre": "Hotel X", "plazas": "96"})),
            raw(json!({"municipio": "LOS REALEJOS", "modalidad": "hotelera", "nombre": "Hotel X", "plazas": "96"})),
        ]
    }

    fn step_names(result: &PipelineResult) -> Vec<&str> {
        result.steps.iter().map(|s| s.name.as_str()).collect()
    }

    #[tokio::test]
    async fn realejos_spellings_collapse_into_one_silver_row() {
        let store = Arc::new(MemoryStore::new());
        let result = pipeline(store.clone())
            .run_with_adapter(&descriptor(), &RowsSource(realejos_rows()))
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.summary.fetch.rows, 2);
        assert_eq!(result.summary.bronze.inserted, 2);
        assert_eq!(result.summary.transform.resolved_exact, 2);
        assert_eq!(result.summary.silver.inserted, 1);
        assert_eq!(result.summary.silver.skipped_dedup, 1);

        let silver = store.rows("silver_alojamientos").await;
        assert_eq!(silver.len(), 1);
        assert_eq!(silver[0]["municipality_code"], json!("38032"));
        assert_eq!(silver[0]["municipality_name"], json!("Realejos, Los"));
        assert_eq!(store.rows("bronze_records").await.len(), 2);
    }

    #[tokio::test]
    async fn successful_runs_record_every_phase_in_order() {
        let store = Arc::new(MemoryStore::new());
        let result = pipeline(store.clone())
            .run_with_adapter(&descriptor(), &RowsSource(realejos_rows()))
            .await;

        assert_eq!(step_names(&result), Phase::ALL.map(Phase::name).to_vec());
        let run = store.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
        assert_eq!(run.metadata["summary"]["silver"]["inserted"], json!(1));

        let steps = store.list_steps(result.run_id).await.unwrap();
        assert_eq!(steps.len(), 5);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        let facts = result.summary.facts.unwrap();
        assert_eq!(facts.refreshed_rows, 1);
    }

    #[tokio::test]
    async fn mandatory_failure_aborts_and_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        let result = pipeline(store.clone()).run_with_adapter(&descriptor(), &BrokenSource).await;

        assert!(!result.success);
        assert_eq!(step_names(&result), vec!["fetch"]);
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("resource not found"));

        let run = store.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.metadata["failed_step"], json!("fetch"));
        assert!(run.metadata["error"].as_str().unwrap().contains("resource not found"));
        assert!(store.rows("bronze_records").await.is_empty());
    }

    #[tokio::test]
    async fn failing_fact_refresh_still_completes_the_run() {
        let store = Arc::new(BrokenFacts(MemoryStore::new()));
        let result = pipeline(store.clone())
            .run_with_adapter(&descriptor(), &RowsSource(realejos_rows()))
            .await;

        assert!(result.success);
        assert!(result.summary.facts.is_none());
        let last = result.steps.last().unwrap();
        assert_eq!(last.name, "refresh_facts");
        assert_eq!(last.status, StepStatus::Failed);
        assert!(last.error.as_deref().unwrap().contains("fact rows failed"));

        let run = store.get_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let steps = store.list_steps(result.run_id).await.unwrap();
        assert_eq!(steps.last().unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn datasets_without_facts_skip_the_refresh_phase() {
        let mut descriptor = descriptor();
        descriptor.facts = None;
        let store = Arc::new(MemoryStore::new());
        let result = pipeline(store).run_with_adapter(&descriptor, &RowsSource(realejos_rows())).await;
        assert!(result.success);
        assert_eq!(step_names(&result), vec!["fetch", "load_bronze", "transform", "load_silver"]);
    }

    #[tokio::test]
    async fn rerunning_a_dataset_only_updates_silver() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        let source = RowsSource(realejos_rows());
        pipeline.run_with_adapter(&descriptor(), &source).await;
        let second = pipeline.run_with_adapter(&descriptor(), &source).await;

        assert_eq!(second.summary.silver.inserted, 0);
        assert_eq!(second.summary.silver.updated, 1);
        assert_eq!(store.rows("silver_alojamientos").await.len(), 1);
        assert_eq!(store.rows("bronze_records").await.len(), 4);
        assert_eq!(store.list_runs(10).await.unwrap().len(), 2);
    }
}
