//! Gold fact refresh: stored procedure first, in-process grouping otherwise.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Context, Result};
use isla_core::{FactRecord, Row, COL_MUNICIPALITY_CODE};
use isla_storage::{Filter, Persistence};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::loader::{composite_key, report_from_procedure, BatchLoader, LoadStats, UpsertTarget};
use crate::normalize::normalize_numeric;
use crate::schema::FactSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatePath {
    Procedure,
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateOutcome {
    pub path: AggregatePath,
    pub refreshed_rows: u64,
    /// Fact rows whose group no longer exists in silver, deleted after an
    /// in-process refresh.
    pub stale_removed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadStats>,
}

/// Group silver rows by municipality code plus `dimensions`, counting rows
/// and summing `measures`. Rows without a code are skipped.
pub fn group_facts(rows: &[Row], dimensions: &[String], measures: &[String]) -> Vec<FactRecord> {
    let mut groups: BTreeMap<(String, String), FactRecord> = BTreeMap::new();
    for row in rows {
        let Some(code) = row.get(COL_MUNICIPALITY_CODE).and_then(JsonValue::as_str) else {
            continue;
        };
        let dims: BTreeMap<String, JsonValue> = dimensions
            .iter()
            .map(|d| (d.clone(), row.get(d).cloned().unwrap_or(JsonValue::Null)))
            .collect();
        let group_key = (code.to_string(), JsonValue::from(dims.values().cloned().collect::<Vec<_>>()).to_string());
        let fact = groups.entry(group_key).or_insert_with(|| FactRecord {
            municipality_code: code.to_string(),
            dimensions: dims,
            record_count: 0,
            sums: measures.iter().map(|m| (m.clone(), 0.0)).collect(),
        });
        fact.record_count += 1;
        for measure in measures {
            if let Some(value) = row.get(measure).and_then(normalize_numeric) {
                *fact.sums.entry(measure.clone()).or_insert(0.0) += value;
            }
        }
    }
    groups.into_values().collect()
}

pub struct Aggregator<'a> {
    store: &'a dyn Persistence,
    batch_size: usize,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a dyn Persistence, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub async fn refresh(&self, dataset_id: &str, silver_table: &str, facts: &FactSpec) -> Result<AggregateOutcome> {
        if let Some(procedure) = &facts.procedure {
            let args = json!({
                "dataset": dataset_id,
                "silver_table": silver_table,
                "fact_table": facts.table,
            });
            match self.store.call_procedure(procedure, &args).await {
                Ok(result) => match report_from_procedure(&result, 0).error {
                    None => {
                        let refreshed_rows = self
                            .store
                            .count_rows(&facts.table)
                            .await
                            .with_context(|| format!("counting {}", facts.table))?;
                        info!(dataset = dataset_id, procedure = %procedure, refreshed_rows, "facts refreshed by procedure");
                        return Ok(AggregateOutcome {
                            path: AggregatePath::Procedure,
                            refreshed_rows,
                            stale_removed: 0,
                            load: None,
                        });
                    }
                    Some(error) => {
                        warn!(dataset = dataset_id, procedure = %procedure, %error, "fact procedure reported a failure; grouping in process");
                    }
                },
                Err(error) => {
                    warn!(dataset = dataset_id, procedure = %procedure, %error, "fact procedure failed; grouping in process");
                }
            }
        }
        self.refresh_in_process(dataset_id, silver_table, facts).await
    }

    async fn refresh_in_process(&self, dataset_id: &str, silver_table: &str, facts: &FactSpec) -> Result<AggregateOutcome> {
        let rows = self
            .store
            .select_rows(silver_table, &Filter::NotNull(COL_MUNICIPALITY_CODE.to_string()))
            .await
            .with_context(|| format!("reading {silver_table}"))?;
        let fact_rows: Vec<Row> = group_facts(&rows, &facts.dimensions, &facts.measures)
            .iter()
            .map(FactRecord::to_row)
            .collect();

        let target = UpsertTarget::new(&facts.table, facts.key_columns(), self.batch_size);
        let load = BatchLoader::new(self.store).upsert(&fact_rows, &target).await?;
        if load.errors > 0 {
            bail!("{} of {} fact rows failed to load into {}", load.errors, fact_rows.len(), facts.table);
        }
        let stale_removed = self.remove_stale_groups(&facts.table, &target.key, &fact_rows).await?;
        info!(
            dataset = dataset_id,
            silver_rows = rows.len(),
            fact_rows = fact_rows.len(),
            stale_removed,
            "facts refreshed in process"
        );
        Ok(AggregateOutcome {
            path: AggregatePath::InProcess,
            refreshed_rows: fact_rows.len() as u64,
            stale_removed,
            load: Some(load),
        })
    }

    /// Delete stored fact rows whose group is not in `fresh`.
    async fn remove_stale_groups(&self, table: &str, key: &[String], fresh: &[Row]) -> Result<u64> {
        let current: HashSet<String> = fresh.iter().map(|row| composite_key(row, key)).collect();
        let stored = self
            .store
            .select_rows(table, &Filter::All)
            .await
            .with_context(|| format!("reading {table}"))?;
        let stale: Vec<Row> = stored
            .iter()
            .filter(|row| !current.contains(&composite_key(row, key)))
            .map(|row| {
                key.iter()
                    .map(|column| (column.clone(), row.get(column).cloned().unwrap_or(JsonValue::Null)))
                    .collect()
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        self.store
            .delete_keys(table, key, &stale)
            .await
            .with_context(|| format!("removing stale groups from {table}"))
    }
}
