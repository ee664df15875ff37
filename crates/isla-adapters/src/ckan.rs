use std::sync::Arc;

use async_trait::async_trait;
use isla_core::RawRecord;
use isla_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{AdapterContext, AdapterError, PageRequest, SourceAdapter, SourceKind};

/// Columns CKAN adds to every datastore row.
const CKAN_INTERNAL_COLUMNS: [&str; 2] = ["_id", "_full_text"];

#[derive(Debug, Deserialize)]
struct DatastoreResponse {
    success: bool,
    #[serde(default)]
    result: Option<DatastoreResult>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct DatastoreResult {
    #[serde(default)]
    records: Vec<RawRecord>,
}

/// Data-catalog adapter over CKAN's `datastore_search` action.
#[derive(Debug, Clone)]
pub struct CkanDatastoreAdapter {
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl CkanDatastoreAdapter {
    pub fn new(base_url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    pub fn search_url(&self) -> String {
        format!(
            "{}/api/3/action/datastore_search",
            self.base_url.trim_end_matches('/')
        )
    }
}

pub(crate) fn parse_datastore_page(body: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let response: DatastoreResponse =
        serde_json::from_slice(body).map_err(|e| AdapterError::Malformed {
            what: "datastore_search response",
            message: e.to_string(),
        })?;
    if !response.success {
        let message = response
            .error
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| "datastore_search returned success=false".to_string());
        return Err(AdapterError::SourceFailure(message));
    }
    let mut records = response.result.map(|r| r.records).unwrap_or_default();
    for record in &mut records {
        for column in CKAN_INTERNAL_COLUMNS {
            record.remove(column);
        }
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for CkanDatastoreAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ckan
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        request: &PageRequest,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let response = self
            .http
            .fetch_with_query(
                ctx.run_id,
                &ctx.dataset_id,
                &self.search_url(),
                &[
                    ("resource_id", request.resource_id.clone()),
                    ("limit", request.limit.to_string()),
                    ("offset", request.offset.to_string()),
                ],
            )
            .await?;
        ctx.archive_payload("json", &response.body).await?;
        parse_datastore_page(&response.body)
    }
}
