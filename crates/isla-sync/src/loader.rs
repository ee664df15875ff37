//! Chunked, deduplicating, fault-isolated writes into the persistence layer.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use isla_core::Row;
use isla_storage::{Filter, Persistence, StoreError, WriteReport};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::schema::ReferenceSpec;

const INVALID_REF_SAMPLE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub inserted: usize,
    pub updated: usize,
    pub errors: usize,
    pub skipped_dedup: usize,
    pub skipped_invalid_ref: usize,
}

impl LoadStats {
    pub fn absorb(&mut self, other: &LoadStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.errors += other.errors;
        self.skipped_dedup += other.skipped_dedup;
        self.skipped_invalid_ref += other.skipped_invalid_ref;
    }
}

/// Where and how a batch is upserted.
#[derive(Debug, Clone)]
pub struct UpsertTarget {
    pub table: String,
    pub key: Vec<String>,
    pub batch_size: usize,
    pub reference: Option<ReferenceSpec>,
    /// Write through this procedure instead of the generic upsert.
    pub procedure: Option<String>,
}

impl UpsertTarget {
    pub fn new(table: impl Into<String>, key: Vec<String>, batch_size: usize) -> Self {
        Self {
            table: table.into(),
            key,
            batch_size,
            reference: None,
            procedure: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<ReferenceSpec>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_procedure(mut self, procedure: Option<String>) -> Self {
        self.procedure = procedure;
        self
    }
}

/// Identity of a row under `key`, usable as a set member.
pub fn composite_key(row: &Row, key: &[String]) -> String {
    JsonValue::Array(
        key.iter()
            .map(|column| row.get(column).cloned().unwrap_or(JsonValue::Null))
            .collect(),
    )
    .to_string()
}

/// Keep the first row per composite key. Returns the kept rows and the number dropped.
pub fn dedup_rows(rows: &[Row], key: &[String]) -> (Vec<Row>, usize) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(rows.len());
    let mut dropped = 0;
    for row in rows {
        let identity = composite_key(row, key);
        if seen.insert(identity.clone()) {
            kept.push(row.clone());
        } else {
            debug!(key = %identity, "dropping duplicate row");
            dropped += 1;
        }
    }
    (kept, dropped)
}

fn reference_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn sample(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_else(|_| "<unserializable>".to_string())
}

pub(crate) fn report_from_procedure(result: &JsonValue, submitted: usize) -> WriteReport {
    match result {
        JsonValue::Object(map) => WriteReport {
            inserted: map.get("inserted").and_then(JsonValue::as_u64).unwrap_or(0) as usize,
            updated: map.get("updated").and_then(JsonValue::as_u64).unwrap_or(0) as usize,
            error: map.get("error").and_then(|e| match e {
                JsonValue::Null => None,
                JsonValue::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }),
        },
        JsonValue::Number(n) => WriteReport {
            inserted: n.as_u64().unwrap_or(0) as usize,
            ..Default::default()
        },
        _ => WriteReport {
            inserted: submitted,
            ..Default::default()
        },
    }
}

pub struct BatchLoader<'a> {
    store: &'a dyn Persistence,
}

impl<'a> BatchLoader<'a> {
    pub fn new(store: &'a dyn Persistence) -> Self {
        Self { store }
    }

    /// Upsert `rows` chunk by chunk.
    ///
    /// A failing chunk only adds its size to `errors`; the only error
    /// returned is a failed fetch of the referential gate's parent keys.
    pub async fn upsert(&self, rows: &[Row], target: &UpsertTarget) -> Result<LoadStats> {
        if target.batch_size == 0 {
            bail!("batch size for {} must be positive", target.table);
        }
        let valid_parents = match &target.reference {
            Some(reference) => Some(self.parent_keys(reference).await?),
            None => None,
        };

        let mut stats = LoadStats::default();
        for (chunk_no, chunk) in rows.chunks(target.batch_size).enumerate() {
            let (mut kept, dropped) = dedup_rows(chunk, &target.key);
            stats.skipped_dedup += dropped;

            if let (Some(reference), Some(valid)) = (&target.reference, &valid_parents) {
                let before = kept.len();
                let mut missing = Vec::new();
                kept.retain(|row| {
                    let value = row.get(&reference.field).and_then(reference_text);
                    let ok = value.as_ref().is_some_and(|v| valid.contains(v));
                    if !ok && missing.len() < INVALID_REF_SAMPLE {
                        missing.push(value.unwrap_or_else(|| "null".to_string()));
                    }
                    ok
                });
                let invalid = before - kept.len();
                if invalid > 0 {
                    warn!(
                        table = %target.table,
                        parent = %reference.table,
                        field = %reference.field,
                        invalid,
                        sample = ?missing,
                        "dropping rows with unknown parent keys"
                    );
                    stats.skipped_invalid_ref += invalid;
                }
            }

            if kept.is_empty() {
                continue;
            }
            match self.write_chunk(&kept, target).await {
                Ok(report) if !report.is_failure() => {
                    stats.inserted += report.inserted;
                    stats.updated += report.updated;
                }
                Ok(report) => {
                    let error = report.error.unwrap_or_default();
                    warn!(table = %target.table, chunk = chunk_no, rows = kept.len(), %error, sample = %sample(&kept[0]), "chunk reported failure");
                    stats.errors += kept.len();
                }
                Err(error) => {
                    warn!(table = %target.table, chunk = chunk_no, rows = kept.len(), %error, sample = %sample(&kept[0]), "chunk failed");
                    stats.errors += kept.len();
                }
            }
        }
        info!(
            table = %target.table,
            inserted = stats.inserted,
            updated = stats.updated,
            errors = stats.errors,
            skipped_dedup = stats.skipped_dedup,
            skipped_invalid_ref = stats.skipped_invalid_ref,
            "upsert finished"
        );
        Ok(stats)
    }

    /// Append-only insert with the same per-chunk isolation and no dedup.
    pub async fn insert(&self, table: &str, rows: &[Row], batch_size: usize) -> Result<LoadStats> {
        if batch_size == 0 {
            bail!("batch size for {table} must be positive");
        }
        let mut stats = LoadStats::default();
        for (chunk_no, chunk) in rows.chunks(batch_size).enumerate() {
            match self.store.insert(table, chunk).await {
                Ok(report) if !report.is_failure() => stats.inserted += report.inserted,
                Ok(report) => {
                    let error = report.error.unwrap_or_default();
                    warn!(table, chunk = chunk_no, rows = chunk.len(), %error, sample = %sample(&chunk[0]), "insert chunk reported failure");
                    stats.errors += chunk.len();
                }
                Err(error) => {
                    warn!(table, chunk = chunk_no, rows = chunk.len(), %error, sample = %sample(&chunk[0]), "insert chunk failed");
                    stats.errors += chunk.len();
                }
            }
        }
        info!(table, inserted = stats.inserted, errors = stats.errors, "insert finished");
        Ok(stats)
    }

    async fn write_chunk(&self, rows: &[Row], target: &UpsertTarget) -> Result<WriteReport, StoreError> {
        match &target.procedure {
            Some(procedure) => {
                let args = json!({
                    "table": target.table,
                    "key": target.key,
                    "rows": rows,
                });
                let result = self.store.call_procedure(procedure, &args).await?;
                Ok(report_from_procedure(&result, rows.len()))
            }
            None => self.store.upsert(&target.table, rows, &target.key).await,
        }
    }

    async fn parent_keys(&self, reference: &ReferenceSpec) -> Result<HashSet<String>> {
        let values = self
            .store
            .select_column(&reference.table, &reference.column, &Filter::All)
            .await
            .with_context(|| format!("fetching parent keys {}.{}", reference.table, reference.column))?;
        Ok(values.iter().filter_map(reference_text).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use isla_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn key(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    fn hotels(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| row(json!({"municipality_code": "38001", "nombre": format!("Hotel {i}"), "plazas": i})))
            .collect()
    }

    /// Fails (or reports failure for) the upsert call with the given ordinal.
    struct FailingUpserts {
        inner: MemoryStore,
        fail_call: usize,
        report_instead_of_error: bool,
        calls: AtomicUsize,
    }

    impl FailingUpserts {
        fn new(fail_call: usize, report_instead_of_error: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_call,
                report_instead_of_error,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Persistence for FailingUpserts {
        async fn insert(&self, table: &str, rows: &[Row]) -> Result<WriteReport, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_call {
                return Err(StoreError::Message("disk full".into()));
            }
            self.inner.insert(table, rows).await
        }

        async fn upsert(&self, table: &str, rows: &[Row], conflict: &[String]) -> Result<WriteReport, StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_call {
                if self.report_instead_of_error {
                    return Ok(WriteReport::failed("constraint violated"));
                }
                return Err(StoreError::Message("connection reset".into()));
            }
            self.inner.upsert(table, rows, conflict).await
        }

        async fn select_column(&self, table: &str, column: &str, filter: &Filter) -> Result<Vec<JsonValue>, StoreError> {
            self.inner.select_column(table, column, filter).await
        }

        async fn delete_keys(&self, table: &str, key_columns: &[String], keys: &[Row]) -> Result<u64, StoreError> {
            self.inner.delete_keys(table, key_columns, keys).await
        }

        async fn select_rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
            self.inner.select_rows(table, filter).await
        }

        async fn call_procedure(&self, name: &str, args: &JsonValue) -> Result<JsonValue, StoreError> {
            self.inner.call_procedure(name, args).await
        }

        async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
            self.inner.count_rows(table).await
        }
    }

    #[tokio::test]
    async fn loading_twice_updates_instead_of_duplicating() {
        let store = MemoryStore::new();
        let loader = BatchLoader::new(&store);
        let target = UpsertTarget::new("silver_alojamientos", key(&["nombre"]), 2);
        let rows = hotels(5);

        let first = loader.upsert(&rows, &target).await.unwrap();
        let snapshot = store.rows("silver_alojamientos").await;
        let second = loader.upsert(&rows, &target).await.unwrap();

        assert_eq!((first.inserted, first.updated), (5, 0));
        assert_eq!((second.inserted, second.updated), (0, 5));
        assert_eq!(store.rows("silver_alojamientos").await, snapshot);
    }

    #[tokio::test]
    async fn duplicates_within_a_chunk_keep_the_first_row() {
        let store = MemoryStore::new();
        let mut rows = hotels(2);
        for plazas in [100, 200, 300] {
            rows.push(row(json!({"municipality_code": "38001", "nombre": "Hotel Dup", "plazas": plazas})));
        }
        let stats = BatchLoader::new(&store)
            .upsert(&rows, &UpsertTarget::new("t", key(&["municipality_code", "nombre"]), 10))
            .await
            .unwrap();

        assert_eq!(stats.skipped_dedup, 2);
        let stored = store.rows("t").await;
        let dups: Vec<_> = stored.iter().filter(|r| r["nombre"] == json!("Hotel Dup")).collect();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0]["plazas"], json!(100));
        assert_eq!(stored.len(), 3);
    }

    #[test]
    fn dedup_keeps_n_minus_k_plus_one_rows() {
        let rows = vec![
            row(json!({"k": 1, "v": "a"})),
            row(json!({"k": 2, "v": "b"})),
            row(json!({"k": 1, "v": "c"})),
            row(json!({"k": 1, "v": "d"})),
        ];
        let (kept, dropped) = dedup_rows(&rows, &key(&["k"]));
        assert_eq!(kept.len(), 4 - 3 + 1);
        assert_eq!(dropped, 2);
        assert_eq!(kept[0]["v"], json!("a"));
    }

    #[test]
    fn missing_and_null_key_columns_share_an_identity() {
        let a = row(json!({"k": null}));
        let b = row(json!({}));
        assert_eq!(composite_key(&a, &key(&["k"])), composite_key(&b, &key(&["k"])));
        assert_ne!(
            composite_key(&row(json!({"k": "1"})), &key(&["k"])),
            composite_key(&row(json!({"k": 1})), &key(&["k"]))
        );
    }

    #[tokio::test]
    async fn a_failing_chunk_does_not_stop_the_others() {
        let store = FailingUpserts::new(2, false);
        let stats = BatchLoader::new(&store)
            .upsert(&hotels(7), &UpsertTarget::new("t", key(&["nombre"]), 3))
            .await
            .unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.inserted, 4);
        assert_eq!(store.inner.rows("t").await.len(), 4);
    }

    #[tokio::test]
    async fn reported_failures_count_like_thrown_ones() {
        let store = FailingUpserts::new(1, true);
        let stats = BatchLoader::new(&store)
            .upsert(&hotels(4), &UpsertTarget::new("t", key(&["nombre"]), 2))
            .await
            .unwrap();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.inserted, 2);
    }

    #[tokio::test]
    async fn rows_with_unknown_parents_are_dropped_and_counted() {
        let store = MemoryStore::new();
        store
            .seed("silver_alojamientos", vec![row(json!({"nombre": "Hotel 0"})), row(json!({"nombre": "Hotel 2"}))])
            .await;
        let mut rows: Vec<Row> = (0..4)
            .map(|i| row(json!({"hotel": format!("Hotel {i}"), "habitacion": i})))
            .collect();
        rows.push(row(json!({"hotel": null, "habitacion": 9})));
        let target = UpsertTarget::new("silver_habitaciones", key(&["hotel", "habitacion"]), 2).with_reference(Some(
            ReferenceSpec {
                field: "hotel".into(),
                table: "silver_alojamientos".into(),
                column: "nombre".into(),
            },
        ));

        let stats = BatchLoader::new(&store).upsert(&rows, &target).await.unwrap();
        assert_eq!(stats.skipped_invalid_ref, 3);
        assert_eq!(stats.skipped_dedup, 0);
        assert_eq!(stats.inserted, 2);
    }

    #[tokio::test]
    async fn procedure_writes_use_the_named_procedure() {
        let store = MemoryStore::new().with_procedure(
            "upsert_alojamientos",
            std::sync::Arc::new(|tables: &mut isla_storage::MemoryTables, args: &JsonValue| {
                let rows = args["rows"].as_array().cloned().unwrap_or_default();
                let n = rows.len();
                let table = tables.entry("via_proc".into()).or_default();
                table.extend(rows.into_iter().filter_map(|r| r.as_object().cloned()));
                Ok::<_, StoreError>(json!({"inserted": n, "updated": 0}))
            }),
        );
        let target = UpsertTarget::new("t", key(&["nombre"]), 10).with_procedure(Some("upsert_alojamientos".into()));
        let stats = BatchLoader::new(&store).upsert(&hotels(3), &target).await.unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(store.rows("via_proc").await.len(), 3);
        assert!(store.rows("t").await.is_empty());
    }

    #[tokio::test]
    async fn bronze_inserts_isolate_failing_chunks() {
        let store = FailingUpserts::new(1, false);
        let stats = BatchLoader::new(&store).insert("bronze_records", &hotels(5), 2).await.unwrap();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.inserted, 3);
    }

    #[tokio::test]
    async fn zero_batch_size_is_an_error() {
        let store = MemoryStore::new();
        let target = UpsertTarget::new("t", key(&["nombre"]), 0);
        assert!(BatchLoader::new(&store).upsert(&hotels(1), &target).await.is_err());
    }
}
