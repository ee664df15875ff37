use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use isla_core::RawRecord;
use isla_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::{Number, Value as JsonValue};

use crate::{AdapterContext, AdapterError, PageRequest, SourceAdapter, SourceKind};

const XSD: &str = "http://www.w3.org/2001/XMLSchema#";
const XSD_INTEGERS: [&str; 6] = ["integer", "int", "long", "short", "nonNegativeInteger", "positiveInteger"];
const XSD_DECIMALS: [&str; 3] = ["decimal", "double", "float"];

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<HashMap<String, SparqlTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparqlTerm {
    value: String,
    #[serde(default)]
    datatype: Option<String>,
}

impl SparqlTerm {
    fn into_json(self) -> JsonValue {
        let Some(local) = self.datatype.as_deref().and_then(|d| d.strip_prefix(XSD)) else {
            return JsonValue::String(self.value);
        };
        if XSD_INTEGERS.contains(&local) {
            if let Ok(n) = self.value.parse::<i64>() {
                return JsonValue::Number(n.into());
            }
        } else if XSD_DECIMALS.contains(&local) {
            if let Some(n) = self.value.parse::<f64>().ok().and_then(Number::from_f64) {
                return JsonValue::Number(n);
            }
        } else if local == "boolean" {
            match self.value.as_str() {
                "true" | "1" => return JsonValue::Bool(true),
                "false" | "0" => return JsonValue::Bool(false),
                _ => {}
            }
        }
        JsonValue::String(self.value)
    }
}

/// Flatten SPARQL JSON bindings into raw rows, one column per variable.
pub(crate) fn parse_sparql_bindings(body: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let response: SparqlResponse =
        serde_json::from_slice(body).map_err(|e| AdapterError::Malformed {
            what: "sparql results",
            message: e.to_string(),
        })?;
    Ok(response
        .results
        .bindings
        .into_iter()
        .map(|binding| {
            binding
                .into_iter()
                .map(|(var, term)| (var, term.into_json()))
                .collect::<RawRecord>()
        })
        .collect())
}

/// Knowledge-base adapter over a SPARQL endpoint returning JSON results.
///
/// The query template is paged by substituting `{limit}` and `{offset}`.
#[derive(Debug, Clone)]
pub struct KnowledgeBaseAdapter {
    endpoint: String,
    query: String,
    http: Arc<HttpFetcher>,
}

impl KnowledgeBaseAdapter {
    pub fn new(endpoint: impl Into<String>, query: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: query.into(),
            http,
        }
    }

    pub fn render_query(&self, request: &PageRequest) -> String {
        self.query
            .replace("{limit}", &request.limit.to_string())
            .replace("{offset}", &request.offset.to_string())
    }
}

#[async_trait]
impl SourceAdapter for KnowledgeBaseAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::KnowledgeBase
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
                &self.endpoint,
                &[
                    ("query", self.render_query(request)),
                    ("format", "json".to_string()),
                ],
            )
            .await?;
        ctx.archive_payload("json", &response.body).await?;
        parse_sparql_bindings(&response.body)
    }
}
