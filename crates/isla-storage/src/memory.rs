use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isla_core::{Row, Run, RunStatus, Step, StepStatus};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Filter, Persistence, RunLedger, StoreError, WriteReport};

/// Table contents of a [`MemoryStore`], keyed by table name.
pub type MemoryTables = HashMap<String, Vec<Row>>;

/// Stand-in for a stored procedure: runs against the tables under the store lock.
pub type ProcedureHandler =
    Arc<dyn Fn(&mut MemoryTables, &JsonValue) -> Result<JsonValue, StoreError> + Send + Sync>;

#[derive(Default)]
struct LedgerState {
    runs: Vec<Run>,
    steps: Vec<Step>,
}

/// In-process store used for dry runs and tests.
///
/// Upserts follow `UNIQUE NULLS NOT DISTINCT` semantics: a missing conflict
/// column reads as null, and null matches null.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    procedures: HashMap<String, ProcedureHandler>,
    ledger: Mutex<LedgerState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_procedure(mut self, name: impl Into<String>, handler: ProcedureHandler) -> Self {
        self.procedures.insert(name.into(), handler);
        self
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }
}

fn same_key(existing: &Row, candidate: &Row, conflict_columns: &[String]) -> bool {
    let cell = |row: &Row, column: &str| row.get(column).filter(|v| !v.is_null()).cloned();
    conflict_columns
        .iter()
        .all(|column| cell(existing, column) == cell(candidate, column))
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<WriteReport, StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(WriteReport {
            inserted: rows.len(),
            ..Default::default()
        })
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[String],
    ) -> Result<WriteReport, StoreError> {
        if conflict_columns.is_empty() {
            return Err(StoreError::Message(format!(
                "upsert into {table} needs at least one conflict column"
            )));
        }
        let mut tables = self.tables.lock().await;
        let stored = tables.entry(table.to_string()).or_default();
        let mut report = WriteReport::default();
        for row in rows {
            match stored
                .iter_mut()
                .find(|existing| same_key(existing, row, conflict_columns))
            {
                Some(existing) => {
                    for (column, value) in row {
                        existing.insert(column.clone(), value.clone());
                    }
                    report.updated += 1;
                }
                None => {
                    stored.push(row.clone());
                    report.inserted += 1;
                }
            }
        }
        Ok(report)
    }

    async fn delete_keys(
        &self,
        table: &str,
        key_columns: &[String],
        keys: &[Row],
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = stored.len();
        stored.retain(|row| !keys.iter().any(|key| same_key(row, key, key_columns)));
        Ok((before - stored.len()) as u64)
    }

    async fn select_column(
        &self,
        table: &str,
        column: &str,
        filter: &Filter,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.matches(row))
                    .map(|row| row.get(column).cloned().unwrap_or(JsonValue::Null))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn select_rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn call_procedure(&self, name: &str, args: &JsonValue) -> Result<JsonValue, StoreError> {
        let handler = self
            .procedures
            .get(name)
            .ok_or_else(|| StoreError::UnknownProcedure(name.to_string()))?;
        let mut tables = self.tables.lock().await;
        handler(&mut *tables, args)
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|rows| rows.len() as u64).unwrap_or(0))
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        self.ledger.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        metadata: &JsonValue,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        let run = ledger
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::NotFound { kind: "run", id: run_id })?;
        if run.status != RunStatus::Running {
            return Err(StoreError::AlreadyClosed { kind: "run", id: run_id });
        }
        run.status = status;
        run.ended_at = Some(ended_at);
        run.metadata = metadata.clone();
        Ok(())
    }

    async fn create_step(&self, step: &Step) -> Result<(), StoreError> {
        self.ledger.lock().await.steps.push(step.clone());
        Ok(())
    }

    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut ledger = self.ledger.lock().await;
        let step = ledger
            .steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(StoreError::NotFound { kind: "step", id: step_id })?;
        if step.status != StepStatus::Running {
            return Err(StoreError::AlreadyClosed { kind: "step", id: step_id });
        }
        step.status = status;
        step.ended_at = Some(ended_at);
        step.error_message = error_message.map(ToString::to_string);
        Ok(())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.runs.iter().rev().take(limit).cloned().collect())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().expect("object row")
    }

    fn key(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn repeated_upsert_updates_instead_of_duplicating() {
        let store = MemoryStore::new();
        let rows = vec![
            row(json!({"id": "a", "plazas": 10})),
            row(json!({"id": "b", "plazas": 20})),
        ];
        let first = store.upsert("t", &rows, &key(&["id"])).await.unwrap();
        let second = store.upsert("t", &rows, &key(&["id"])).await.unwrap();

        assert_eq!((first.inserted, first.updated), (2, 0));
        assert_eq!((second.inserted, second.updated), (0, 2));
        assert_eq!(store.rows("t").await.len(), 2);
    }

    #[tokio::test]
    async fn null_conflict_values_match_each_other() {
        let store = MemoryStore::new();
        let conflict = key(&["municipality_code", "tipo"]);
        let first = vec![
            row(json!({"municipality_code": "38022", "tipo": null, "record_count": 1})),
            row(json!({"municipality_code": "38011", "tipo": "basilica", "record_count": 1})),
        ];
        store.upsert("fact_patrimonio", &first, &conflict).await.unwrap();

        let again = vec![
            row(json!({"municipality_code": "38022", "record_count": 2})),
            row(json!({"municipality_code": "38011", "tipo": "basilica", "record_count": 1})),
        ];
        let report = store.upsert("fact_patrimonio", &again, &conflict).await.unwrap();

        assert_eq!((report.inserted, report.updated), (0, 2));
        let stored = store.rows("fact_patrimonio").await;
        assert_eq!(stored.len(), 2);
        let laguna = stored.iter().find(|r| r["municipality_code"] == json!("38022")).unwrap();
        assert_eq!(laguna["record_count"], json!(2));
    }

    #[tokio::test]
    async fn deleting_keys_removes_only_matching_rows() {
        let store = MemoryStore::new();
        store
            .seed(
                "fact_patrimonio",
                vec![
                    row(json!({"municipality_code": "38022", "tipo": null})),
                    row(json!({"municipality_code": "38022", "tipo": "casa"})),
                    row(json!({"municipality_code": "38026", "tipo": "casa"})),
                ],
            )
            .await;
        let removed = store
            .delete_keys(
                "fact_patrimonio",
                &key(&["municipality_code", "tipo"]),
                &[row(json!({"municipality_code": "38022", "tipo": null}))],
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.rows("fact_patrimonio").await.len(), 2);
        assert_eq!(store.delete_keys("missing", &key(&["id"]), &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_procedures_are_errors() {
        let store = MemoryStore::new();
        let err = store.call_procedure("refresh_x", &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownProcedure(name) if name == "refresh_x"));
    }

    #[tokio::test]
    async fn registered_procedures_see_the_tables() {
        let store = MemoryStore::new().with_procedure(
            "copy_all",
            Arc::new(|tables: &mut MemoryTables, _args: &JsonValue| {
                let rows = tables.get("src").cloned().unwrap_or_default();
                let n = rows.len();
                tables.insert("dst".into(), rows);
                Ok::<_, StoreError>(json!(n))
            }),
        );
        store.seed("src", vec![row(json!({"a": 1}))]).await;
        let result = store.call_procedure("copy_all", &json!({})).await.unwrap();
        assert_eq!(result, json!(1));
        assert_eq!(store.count_rows("dst").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn runs_close_exactly_once() {
        let store = MemoryStore::new();
        let run = Run::start("alojamientos", json!({}));
        store.create_run(&run).await.unwrap();
        store
            .finish_run(run.id, RunStatus::Completed, Utc::now(), &json!({"ok": true}))
            .await
            .unwrap();
        let again = store
            .finish_run(run.id, RunStatus::Failed, Utc::now(), &json!({}))
            .await;
        assert!(matches!(again, Err(StoreError::AlreadyClosed { kind: "run", .. })));
        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn steps_list_in_creation_order() {
        let store = MemoryStore::new();
        let run = Run::start("p", json!({}));
        store.create_run(&run).await.unwrap();
        for name in ["fetch", "load_bronze", "transform"] {
            store.create_step(&Step::start(run.id, name)).await.unwrap();
        }
        let names: Vec<_> = store
            .list_steps(run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        assert_eq!(names, vec!["fetch", "load_bronze", "transform"]);
    }
}
