use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use encoding_rs::WINDOWS_1252;
use isla_core::RawRecord;
use isla_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{page_of, AdapterContext, AdapterError, PageRequest, SourceAdapter, SourceKind};

/// Decode a CSV payload: UTF-8 (BOM stripped) when valid, Windows-1252 otherwise.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    let tabs = header.matches('\t').count();
    if tabs > semicolons && tabs > commas {
        b'\t'
    } else if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Parse delimited text into raw rows keyed by header. Empty cells become null.
pub fn parse_delimited(text: &str, delimiter: Option<char>) -> Result<Vec<RawRecord>, AdapterError> {
    let delimiter = match delimiter {
        Some(c) if c.is_ascii() => c as u8,
        Some(c) => {
            return Err(AdapterError::Message(format!(
                "delimiter {c:?} is not a single-byte character"
            )))
        }
        None => sniff_delimiter(text),
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| AdapterError::Malformed {
            what: "csv header",
            message: e.to_string(),
        })?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| AdapterError::Malformed {
            what: "csv record",
            message: format!("line {}: {e}", line + 2),
        })?;
        let mut row = RawRecord::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            let value = if cell.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(cell.to_string())
            };
            row.insert(header.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Statistical-agency nomenclature published as one CSV file.
///
/// The file is read once per adapter and then paged from memory.
pub struct CsvNomenclatureAdapter {
    location: String,
    delimiter: Option<char>,
    http: Arc<HttpFetcher>,
    loaded: Mutex<Option<Arc<Vec<RawRecord>>>>,
}

impl CsvNomenclatureAdapter {
    pub fn new(location: impl Into<String>, delimiter: Option<char>, http: Arc<HttpFetcher>) -> Self {
        Self {
            location: location.into(),
            delimiter,
            http,
            loaded: Mutex::new(None),
        }
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    async fn rows(&self, ctx: &AdapterContext) -> Result<Arc<Vec<RawRecord>>, AdapterError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(rows) = loaded.as_ref() {
            return Ok(Arc::clone(rows));
        }
        let bytes = if self.is_remote() {
            let response = self
                .http
                .fetch_bytes(ctx.run_id, &ctx.dataset_id, &self.location)
                .await?;
            ctx.archive_payload("csv", &response.body).await?;
            response.body
        } else {
            let path = PathBuf::from(&self.location);
            tokio::fs::read(&path)
                .await
                .map_err(|source| AdapterError::Io { path, source })?
        };
        let rows = Arc::new(parse_delimited(&decode_text(&bytes), self.delimiter)?);
        *loaded = Some(Arc::clone(&rows));
        Ok(rows)
    }
}

#[async_trait]
impl SourceAdapter for CsvNomenclatureAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Csv
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        request: &PageRequest,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let rows = self.rows(ctx).await?;
        Ok(page_of(&rows, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isla_storage::HttpClientConfig;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn latin1_payloads_are_decoded() {
        // "Güímar" in Windows-1252
        let bytes = b"municipio\nG\xFC\xEDmar\n";
        assert_eq!(decode_text(bytes), "municipio\nGüímar\n");
    }

    #[test]
    fn utf8_bom_is_stripped() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFa;b"), "a;b");
    }

    #[test]
    fn semicolon_files_are_sniffed() {
        let rows = parse_delimited("municipio;anio;poblacion\nArona; 2023 ;82982\n", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["municipio"], json!("Arona"));
        assert_eq!(rows[0]["anio"], json!("2023"));
    }

    #[test]
    fn empty_cells_are_null_and_short_rows_are_tolerated() {
        let rows = parse_delimited("a,b,c\n1,,3\n4\n", Some(',')).unwrap();
        assert_eq!(rows[0]["b"], JsonValue::Null);
        assert_eq!(rows[1].len(), 1);
    }

    #[tokio::test]
    async fn local_files_page_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poblacion.csv");
        std::fs::write(&path, "municipio;anio\nAdeje;2023\nArafo;2023\nArico;2023\n").unwrap();
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = CsvNomenclatureAdapter::new(path.display().to_string(), None, http);
        let ctx = AdapterContext::new(Uuid::new_v4(), "poblacion");

        let drained = crate::drain_source(&adapter, &ctx, "poblacion-2023", 2).await.unwrap();
        assert_eq!(drained.rows.len(), 3);
        assert_eq!(drained.pages, 2);
        assert_eq!(drained.rows[2]["municipio"], json!("Arico"));
    }
}
