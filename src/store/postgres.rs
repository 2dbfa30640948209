//! PostgreSQL backend.
//!
//! Documents are written with `jsonb_populate_record` against the table's own
//! row type and read back with `to_jsonb`, so one code path serves every
//! record kind. Column names in generated SQL only ever come from the static
//! field tables in [`naming`](super::naming).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::warn;

use super::naming::{canonicalize_partial, field_for, Convention};
use super::{BackendKind, Document, DocumentBackend, RecordKind, StoreError, StoreResult};

pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// Builds a bounded pool without opening a connection yet.
    pub fn connect_lazy(url: &str, max_connections: u32, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .context("parse DATABASE_URL")?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn upsert_sql(kind: RecordKind) -> String {
    let table = kind.table();
    let assignments = kind
        .fields()
        .iter()
        .filter(|f| f.snake != "id")
        .map(|f| format!("{0} = EXCLUDED.{0}", f.snake))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} AS t SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
         ON CONFLICT (id) DO UPDATE SET {assignments} RETURNING to_jsonb(t)"
    )
}

fn get_sql(kind: RecordKind) -> String {
    format!("SELECT to_jsonb(t) FROM {} t WHERE t.id = $1", kind.table())
}

fn find_sql(kind: RecordKind, columns: &[&str]) -> String {
    let predicate = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("t.{c} = ${}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT to_jsonb(t) FROM {} t WHERE {predicate} ORDER BY t.created_at DESC",
        kind.table()
    )
}

fn patch_sql(kind: RecordKind, columns: &[&str]) -> String {
    let table = kind.table();
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = p.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} AS t SET {assignments} \
         FROM jsonb_populate_record(NULL::{table}, $2) AS p \
         WHERE t.id = $1 RETURNING to_jsonb(t)"
    )
}

/// Maps document keys to known, patchable columns.
fn patch_columns(kind: RecordKind, changes: &Document) -> Vec<&'static str> {
    changes
        .keys()
        .filter_map(|k| match field_for(kind, k) {
            Some(f) if f.snake != "id" => Some(f.snake),
            Some(_) => None,
            None => {
                warn!(kind = ?kind, field = %k, "ignoring unknown column in patch");
                None
            }
        })
        .collect()
}

/// Unique-key violations become [`StoreError::Conflict`], matching the file
/// backend; everything else means the database is unavailable.
fn classify(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.constraint().unwrap_or("unique key").to_string())
        }
        _ => StoreError::BackendUnavailable(err),
    }
}

fn into_document(Json(value): Json<Value>) -> StoreResult<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::decode(format!("row is not an object: {other}"))),
    }
}

#[async_trait]
impl DocumentBackend for PgBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn upsert(&self, kind: RecordKind, doc: Document) -> StoreResult<Document> {
        let sql = upsert_sql(kind);
        let row = sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(Json(Value::Object(doc)))
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        into_document(row)
    }

    async fn get(&self, kind: RecordKind, id: &str) -> StoreResult<Option<Document>> {
        let sql = get_sql(kind);
        sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(into_document)
            .transpose()
    }

    async fn find_by(&self, kind: RecordKind, filter: &[(&'static str, String)]) -> StoreResult<Vec<Document>> {
        let columns: Vec<&str> = filter.iter().map(|(c, _)| *c).collect();
        let sql = find_sql(kind, &columns);
        let mut query = sqlx::query_scalar::<_, Json<Value>>(&sql);
        for (_, value) in filter {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(into_document)
            .collect()
    }

    async fn patch(&self, kind: RecordKind, id: &str, changes: Document) -> StoreResult<Option<Document>> {
        let changes = canonicalize_partial(&changes, kind, Convention::Snake);
        let columns = patch_columns(kind, &changes);
        if columns.is_empty() {
            return self.get(kind, id).await;
        }
        let sql = patch_sql(kind, &columns);
        sqlx::query_scalar::<_, Json<Value>>(&sql)
            .bind(id)
            .bind(Json(Value::Object(changes)))
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?
            .map(into_document)
            .transpose()
    }
}
