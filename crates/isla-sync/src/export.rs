//! Parquet snapshots of gold fact tables, with a hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use isla_core::{FactRecord, Row, COL_MUNICIPALITY_CODE, COL_RECORD_COUNT};
use isla_storage::{Filter, Persistence};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::loader::composite_key;
use crate::normalize::normalize_numeric;
use crate::schema::DatasetDescriptor;

pub const FACTS_FILE: &str = "facts.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub dataset: String,
    pub fact_table: String,
    pub exported_at: DateTime<Utc>,
    pub rows: usize,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `descriptor`'s fact table to `<out_dir>/<dataset>/facts.parquet` and
/// return the manifest path.
pub async fn export_facts(store: &dyn Persistence, descriptor: &DatasetDescriptor, out_dir: &Path) -> Result<PathBuf> {
    let facts = descriptor
        .facts
        .as_ref()
        .with_context(|| format!("dataset {} declares no fact table", descriptor.id))?;
    let mut rows = store
        .select_rows(&facts.table, &Filter::All)
        .await
        .with_context(|| format!("reading {}", facts.table))?;
    let key = facts.key_columns();
    rows.sort_by_cached_key(|row| composite_key(row, &key));

    let snapshot_dir = out_dir.join(&descriptor.id);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let facts_path = snapshot_dir.join(FACTS_FILE);
    let batch = fact_batch(&rows, &facts.dimensions, &facts.measures)?;
    write_parquet(&facts_path, batch)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        dataset: descriptor.id.clone(),
        fact_table: facts.table.clone(),
        exported_at: Utc::now(),
        rows: rows.len(),
        files: vec![manifest_entry(&facts.table, out_dir, &facts_path)?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(dataset = %descriptor.id, rows = rows.len(), path = %facts_path.display(), "facts exported");
    Ok(manifest_path)
}

fn text_cell(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn fact_batch(rows: &[Row], dimensions: &[String], measures: &[String]) -> Result<RecordBatch> {
    let mut fields = vec![ArrowField::new(COL_MUNICIPALITY_CODE, DataType::Utf8, false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        rows.iter()
            .map(|r| text_cell(r.get(COL_MUNICIPALITY_CODE)).unwrap_or_default())
            .collect::<Vec<_>>(),
    ))];

    for dimension in dimensions {
        fields.push(ArrowField::new(dimension, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(
            rows.iter().map(|r| text_cell(r.get(dimension))).collect::<Vec<_>>(),
        )));
    }

    fields.push(ArrowField::new(COL_RECORD_COUNT, DataType::Int64, false));
    columns.push(Arc::new(Int64Array::from(
        rows.iter()
            .map(|r| r.get(COL_RECORD_COUNT).and_then(JsonValue::as_i64).unwrap_or(0))
            .collect::<Vec<_>>(),
    )));

    for measure in measures {
        let column = FactRecord::sum_column(measure);
        fields.push(ArrowField::new(&column, DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.get(&column).and_then(normalize_numeric))
                .collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).context("building fact record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
