//! PostgreSQL implementation of the persistence collaborator and run ledger.
//!
//! Rows travel as one `jsonb` array per statement and are expanded server side
//! with `jsonb_populate_recordset`, so a single code path serves every table.
//! Procedures are called as `name(jsonb)`; whatever they return is read back
//! through its text form.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use isla_core::{Row, Run, RunStatus, Step, StepStatus};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row as SqlxRow};
use tracing::debug;
use uuid::Uuid;

use crate::{quote_ident, Filter, Persistence, RunLedger, StoreError, WriteReport};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub runs_table: String,
    pub steps_table: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout_secs: 30,
            runs_table: "pipeline_runs".to_string(),
            steps_table: "pipeline_steps".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    runs_table: String,
    steps_table: String,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(database_url)
            .await?;
        Self::from_pool(pool, config)
    }

    pub fn from_pool(pool: PgPool, config: PoolConfig) -> Result<Self, StoreError> {
        Ok(Self {
            pool,
            runs_table: quote_ident(&config.runs_table)?,
            steps_table: quote_ident(&config.steps_table)?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn column_list(rows: &[Row]) -> Result<Vec<String>, StoreError> {
    let names: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    names.into_iter().map(|name| quote_ident(name)).collect()
}

fn rows_payload(rows: &[Row]) -> JsonValue {
    JsonValue::Array(rows.iter().cloned().map(JsonValue::Object).collect())
}

/// `WHERE` clause for a filter; an `Equals` filter binds its value as `$1`.
fn where_clause(filter: &Filter) -> Result<(String, Option<JsonValue>), StoreError> {
    Ok(match filter {
        Filter::All => (String::new(), None),
        Filter::NotNull(column) => (format!(" WHERE {} IS NOT NULL", quote_ident(column)?), None),
        Filter::Equals(column, value) => (
            format!(" WHERE to_jsonb({}) = $1", quote_ident(column)?),
            Some(value.clone()),
        ),
    })
}

fn upsert_sql(table: &str, columns: &[String], conflict: &[String]) -> String {
    let column_sql = columns.join(", ");
    let updates = columns
        .iter()
        .filter(|c| !conflict.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {table} ({column_sql}) \
         SELECT {column_sql} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({}) {action} \
         RETURNING (xmax = 0) AS inserted",
        conflict.join(", ")
    )
}

fn delete_keys_sql(table: &str, key_columns: &[String]) -> String {
    let matches = key_columns
        .iter()
        .map(|c| format!("t.{c} IS NOT DISTINCT FROM k.{c}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!("DELETE FROM {table} AS t USING jsonb_populate_recordset(NULL::{table}, $1) AS k WHERE {matches}")
}

fn status_from_text<T: std::str::FromStr<Err = String>>(text: &str) -> Result<T, StoreError> {
    text.parse().map_err(StoreError::Message)
}

fn run_from_row(row: &PgRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        pipeline_name: row.try_get("pipeline_name")?,
        status: status_from_text(&status)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn step_from_row(row: &PgRow) -> Result<Step, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Step {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        step_name: row.try_get("step_name")?,
        status: status_from_text(&status)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl Persistence for PgStore {
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<WriteReport, StoreError> {
        if rows.is_empty() {
            return Ok(WriteReport::default());
        }
        let table = quote_ident(table)?;
        let columns = column_list(rows)?.join(", ");
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)"
        );
        let result = sqlx::query(&sql)
            .bind(rows_payload(rows))
            .execute(&self.pool)
            .await?;
        Ok(WriteReport {
            inserted: result.rows_affected() as usize,
            ..Default::default()
        })
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Row],
        conflict_columns: &[String],
    ) -> Result<WriteReport, StoreError> {
        if rows.is_empty() {
            return Ok(WriteReport::default());
        }
        if conflict_columns.is_empty() {
            return Err(StoreError::Message(format!(
                "upsert into {table} needs at least one conflict column"
            )));
        }
        let table = quote_ident(table)?;
        let columns = column_list(rows)?;
        let conflict = conflict_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?;
        let sql = upsert_sql(&table, &columns, &conflict);
        debug!(%table, rows = rows.len(), "upsert");

        let returned = sqlx::query(&sql)
            .bind(rows_payload(rows))
            .fetch_all(&self.pool)
            .await?;
        let mut inserted = 0usize;
        for row in &returned {
            if row.try_get::<bool, _>("inserted")? {
                inserted += 1;
            }
        }
        // DO NOTHING does not return conflicting rows; count them as updated.
        let updated = rows.len().saturating_sub(inserted);
        Ok(WriteReport {
            inserted,
            updated,
            error: None,
        })
    }

    async fn delete_keys(
        &self,
        table: &str,
        key_columns: &[String],
        keys: &[Row],
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        if key_columns.is_empty() {
            return Err(StoreError::Message(format!(
                "delete from {table} needs at least one key column"
            )));
        }
        let table = quote_ident(table)?;
        let key_columns = key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?;
        let result = sqlx::query(&delete_keys_sql(&table, &key_columns))
            .bind(rows_payload(keys))
            .execute(&self.pool)
            .await?;
        debug!(%table, removed = result.rows_affected(), "delete by key");
        Ok(result.rows_affected())
    }

    async fn select_column(
        &self,
        table: &str,
        column: &str,
        filter: &Filter,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let (where_sql, bound) = where_clause(filter)?;
        let sql = format!(
            "SELECT to_jsonb({}) AS value FROM {}{where_sql}",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = bound {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(row
                    .try_get::<Option<JsonValue>, _>("value")?
                    .unwrap_or(JsonValue::Null))
            })
            .collect()
    }

    async fn select_rows(&self, table: &str, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        let (where_sql, bound) = where_clause(filter)?;
        let sql = format!(
            "SELECT to_jsonb(t) AS value FROM {} AS t{where_sql}",
            quote_ident(table)?
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = bound {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| match row.try_get::<JsonValue, _>("value")? {
                JsonValue::Object(map) => Ok(map),
                other => Err(StoreError::Message(format!(
                    "expected a row object, got {other}"
                ))),
            })
            .collect()
    }

    async fn call_procedure(&self, name: &str, args: &JsonValue) -> Result<JsonValue, StoreError> {
        let sql = format!("SELECT ({}($1::jsonb))::text AS value", quote_ident(name)?);
        let row = sqlx::query(&sql)
            .bind(args.clone())
            .fetch_one(&self.pool)
            .await?;
        let text: Option<String> = row.try_get("value")?;
        Ok(match text {
            None => JsonValue::Null,
            Some(t) if t.is_empty() => JsonValue::Null,
            Some(t) => serde_json::from_str(&t).unwrap_or(JsonValue::String(t)),
        })
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT count(*) AS n FROM {}", quote_ident(table)?);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl RunLedger for PgStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, pipeline_name, status, started_at, ended_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.runs_table
        );
        sqlx::query(&sql)
            .bind(run.id)
            .bind(&run.pipeline_name)
            .bind(run.status.as_str())
            .bind(run.started_at)
            .bind(run.ended_at)
            .bind(&run.metadata)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        metadata: &JsonValue,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $2, ended_at = $3, metadata = $4 \
             WHERE id = $1 AND status = 'running'",
            self.runs_table
        );
        let result = sqlx::query(&sql)
            .bind(run_id)
            .bind(status.as_str())
            .bind(ended_at)
            .bind(metadata)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::AlreadyClosed { kind: "run", id: run_id })
        }
    }

    async fn create_step(&self, step: &Step) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (id, run_id, step_name, status, started_at, ended_at, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.steps_table
        );
        sqlx::query(&sql)
            .bind(step.id)
            .bind(step.run_id)
            .bind(&step.step_name)
            .bind(step.status.as_str())
            .bind(step.started_at)
            .bind(step.ended_at)
            .bind(step.error_message.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_step(
        &self,
        step_id: Uuid,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET status = $2, ended_at = $3, error_message = $4 \
             WHERE id = $1 AND status = 'running'",
            self.steps_table
        );
        let result = sqlx::query(&sql)
            .bind(step_id)
            .bind(status.as_str())
            .bind(ended_at)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(StoreError::AlreadyClosed { kind: "step", id: step_id })
        }
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let sql = format!(
            "SELECT id, pipeline_name, status, started_at, ended_at, metadata \
             FROM {} ORDER BY started_at DESC LIMIT $1",
            self.runs_table
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let sql = format!(
            "SELECT id, pipeline_name, status, started_at, ended_at, metadata FROM {} WHERE id = $1",
            self.runs_table
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<Step>, StoreError> {
        let sql = format!(
            "SELECT id, run_id, step_name, status, started_at, ended_at, error_message \
             FROM {} WHERE run_id = $1 ORDER BY started_at ASC",
            self.steps_table
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_sql_updates_only_non_key_columns() {
        let sql = upsert_sql(
            "\"silver_x\"",
            &["\"a\"".into(), "\"b\"".into(), "\"c\"".into()],
            &["\"a\"".into()],
        );
        assert!(sql.contains("ON CONFLICT (\"a\") DO UPDATE SET \"b\" = EXCLUDED.\"b\", \"c\" = EXCLUDED.\"c\""));
        assert!(sql.contains("jsonb_populate_recordset(NULL::\"silver_x\", $1)"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn all_key_upserts_do_nothing_on_conflict() {
        let sql = upsert_sql("\"t\"", &["\"a\"".into()], &["\"a\"".into()]);
        assert!(sql.contains("ON CONFLICT (\"a\") DO NOTHING"));
    }

    #[test]
    fn key_deletes_treat_nulls_as_equal() {
        let sql = delete_keys_sql("\"fact_x\"", &["\"municipality_code\"".into(), "\"tipo\"".into()]);
        assert!(sql.starts_with("DELETE FROM \"fact_x\" AS t USING jsonb_populate_recordset(NULL::\"fact_x\", $1) AS k"));
        assert!(sql.ends_with(
            "t.\"municipality_code\" IS NOT DISTINCT FROM k.\"municipality_code\" AND t.\"tipo\" IS NOT DISTINCT FROM k.\"tipo\""
        ));
    }

    #[test]
    fn column_list_is_the_sorted_union_of_row_keys() {
        let rows = vec![
            json!({"b": 1, "a": 2}).as_object().cloned().unwrap(),
            json!({"c": 3}).as_object().cloned().unwrap(),
        ];
        assert_eq!(column_list(&rows).unwrap(), vec!["\"a\"", "\"b\"", "\"c\""]);
    }

    #[test]
    fn where_clause_binds_equality_values() {
        let (sql, bound) = where_clause(&Filter::Equals("anio".into(), json!(2024))).unwrap();
        assert_eq!(sql, " WHERE to_jsonb(\"anio\") = $1");
        assert_eq!(bound, Some(json!(2024)));
        let (sql, bound) = where_clause(&Filter::NotNull("municipality_code".into())).unwrap();
        assert_eq!(sql, " WHERE \"municipality_code\" IS NOT NULL");
        assert!(bound.is_none());
    }
}
