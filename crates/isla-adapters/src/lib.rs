//! Source collaborator contracts and paged adapter implementations.
//!
//! Every source exposes the same operation: fetch one page of raw rows for a
//! resource, given an offset and a page size. [`drain_source`] keeps asking
//! until a page comes back shorter than requested.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isla_core::RawRecord;
use isla_storage::{FetchError, HttpFetcher, PageArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod ckan;
mod csv_source;
mod fixture;
mod knowledge;
mod registry;

pub use ckan::CkanDatastoreAdapter;
pub use csv_source::{decode_text, parse_delimited, CsvNomenclatureAdapter};
pub use fixture::FixtureAdapter;
pub use knowledge::KnowledgeBaseAdapter;
pub use registry::{load_registry_file, FileRegistry, MunicipalityRegistry, StaticRegistry};

pub const CRATE_NAME: &str = "isla-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ckan,
    Csv,
    KnowledgeBase,
    Fixture,
}

/// Declarative locator of a dataset's upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Data-catalog API (CKAN `datastore_search`).
    Ckan { base_url: String, resource_id: String },
    /// Statistical-agency CSV nomenclature, remote (`http(s)://`) or local.
    Csv {
        location: String,
        resource_id: String,
        #[serde(default)]
        delimiter: Option<char>,
    },
    /// Knowledge-base SPARQL endpoint; `query` may use `{limit}` and `{offset}`.
    KnowledgeBase {
        endpoint: String,
        query: String,
        resource_id: String,
    },
    /// Local JSON file holding an array of rows (or `{"records": [...]}`).
    Fixture { path: PathBuf, resource_id: String },
}

impl SourceSpec {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSpec::Ckan { .. } => SourceKind::Ckan,
            SourceSpec::Csv { .. } => SourceKind::Csv,
            SourceSpec::KnowledgeBase { .. } => SourceKind::KnowledgeBase,
            SourceSpec::Fixture { .. } => SourceKind::Fixture,
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            SourceSpec::Ckan { resource_id, .. }
            | SourceSpec::Csv { resource_id, .. }
            | SourceSpec::KnowledgeBase { resource_id, .. }
            | SourceSpec::Fixture { resource_id, .. } => resource_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },
    #[error("source reported failure: {0}")]
    SourceFailure(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-run context handed to every page fetch.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub started_at: DateTime<Utc>,
    pub archive: Option<PageArchive>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, dataset_id: impl Into<String>) -> Self {
        Self {
            run_id,
            dataset_id: dataset_id.into(),
            started_at: Utc::now(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    /// Keep a copy of a fetched payload when an archive is configured.
    pub async fn archive_payload(&self, extension: &str, bytes: &[u8]) -> Result<(), AdapterError> {
        if let Some(archive) = &self.archive {
            let page = archive
                .archive_page(self.started_at, &self.dataset_id, extension, bytes)
                .await?;
            debug!(
                path = %page.location.display(),
                reused = page.reused,
                "archived raw page"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub resource_id: String,
    pub offset: usize,
    pub limit: usize,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        request: &PageRequest,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct DrainedSource {
    pub rows: Vec<RawRecord>,
    pub pages: usize,
}

/// Pull every page of `resource_id` into memory.
pub async fn drain_source(
    adapter: &dyn SourceAdapter,
    ctx: &AdapterContext,
    resource_id: &str,
    page_size: usize,
) -> Result<DrainedSource, AdapterError> {
    if page_size == 0 {
        return Err(AdapterError::Message("page size must be positive".into()));
    }
    let mut drained = DrainedSource::default();
    loop {
        let request = PageRequest {
            resource_id: resource_id.to_string(),
            offset: drained.rows.len(),
            limit: page_size,
        };
        let page = adapter.fetch_page(ctx, &request).await?;
        let received = page.len();
        drained.pages += 1;
        drained.rows.extend(page);
        debug!(
            dataset = %ctx.dataset_id,
            page = drained.pages,
            received,
            total = drained.rows.len(),
            "page fetched"
        );
        if received < page_size {
            break;
        }
    }
    Ok(drained)
}

/// Slice one page out of an in-memory row set.
pub(crate) fn page_of(rows: &[RawRecord], request: &PageRequest) -> Vec<RawRecord> {
    rows.iter()
        .skip(request.offset)
        .take(request.limit)
        .cloned()
        .collect()
}

/// Build the adapter for a source declaration. HTTP sources share `http`.
pub fn adapter_for_spec(spec: &SourceSpec, http: Arc<HttpFetcher>) -> Box<dyn SourceAdapter> {
    match spec {
        SourceSpec::Ckan { base_url, .. } => Box::new(CkanDatastoreAdapter::new(base_url.clone(), http)),
        SourceSpec::Csv {
            location, delimiter, ..
        } => Box::new(CsvNomenclatureAdapter::new(location.clone(), *delimiter, http)),
        SourceSpec::KnowledgeBase { endpoint, query, .. } => Box::new(KnowledgeBaseAdapter::new(
            endpoint.clone(),
            query.clone(),
            http,
        )),
        SourceSpec::Fixture { path, .. } => Box::new(FixtureAdapter::new(path.clone())),
    }
}
