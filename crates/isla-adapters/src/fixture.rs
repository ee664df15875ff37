use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use isla_core::RawRecord;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{page_of, AdapterContext, AdapterError, PageRequest, SourceAdapter, SourceKind};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Rows(Vec<RawRecord>),
    Wrapped { records: Vec<RawRecord> },
}

pub(crate) fn parse_fixture(bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let file: FixtureFile = serde_json::from_slice(bytes).map_err(|e| AdapterError::Malformed {
        what: "fixture file",
        message: e.to_string(),
    })?;
    Ok(match file {
        FixtureFile::Rows(rows) | FixtureFile::Wrapped { records: rows } => rows,
    })
}

/// Local JSON source, used for offline runs and tests.
#[derive(Debug)]
pub struct FixtureAdapter {
    path: PathBuf,
    loaded: Mutex<Option<Arc<Vec<RawRecord>>>>,
}

impl FixtureAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn rows(&self) -> Result<Arc<Vec<RawRecord>>, AdapterError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(rows) = loaded.as_ref() {
            return Ok(Arc::clone(rows));
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| AdapterError::Io {
                path: self.path.clone(),
                source,
            })?;
        let rows = Arc::new(parse_fixture(&bytes)?);
        *loaded = Some(Arc::clone(&rows));
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Fixture
    }

    async fn fetch_page(
        &self,
        _ctx: &AdapterContext,
        request: &PageRequest,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let rows = self.rows().await?;
        Ok(page_of(&rows, request))
    }
}
