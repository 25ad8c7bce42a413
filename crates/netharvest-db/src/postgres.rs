//! PostgreSQL document store.
//!
//! Each collection is a table `<schema>.<collection>` with the document id as
//! primary key and the full document as JSONB:
//!
//! ```sql
//! CREATE TABLE <schema>.<collection> (
//!     id          TEXT PRIMARY KEY,
//!     body        JSONB NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```
//!
//! Field indexes are expression indexes on `body->>'<field>'`.

use async_trait::async_trait;
use netharvest_common::NormalizedDocument;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{DbError, Result};
use crate::store::{DocumentStore, FieldFilter, WriteFailure, WriteSummary};

/// Postgres-backed [`DocumentStore`].
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    schema: String,
    target: String,
}

impl PgDocumentStore {
    /// Connect and make sure the schema exists.
    pub async fn connect(
        url: &str,
        schema: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        let store = Self::from_pool(pool, schema, redact_url(url))?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", store.schema))
            .execute(&store.pool)
            .await?;

        debug!(target = %store.target, schema = %store.schema, "Postgres document store connected");
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, schema: &str, target: String) -> Result<Self> {
        check_identifier(schema)?;
        Ok(Self { pool, schema: schema.to_string(), target })
    }

    /// Expose the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, collection: &str) -> Result<String> {
        check_identifier(collection)?;
        Ok(format!("\"{}\".\"{}\"", self.schema, collection))
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let table = self.table(collection)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id          TEXT PRIMARY KEY,
                body        JSONB NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        let table = self.table(collection)?;
        check_identifier(field)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{collection}_{field}_idx\" ON {table} ((body->>'{field}'))"
        ))
        .execute(&self.pool)
        .await?;
        debug!(collection, field, "index ensured");
        Ok(())
    }

    #[instrument(skip(self, docs), fields(n = docs.len()))]
    async fn insert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary> {
        let table = self.table(collection)?;
        let sql = format!("INSERT INTO {table} (id, body) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING");
        let mut summary = WriteSummary::default();

        for doc in docs {
            let res = sqlx::query(&sql)
                .bind(doc.id())
                .bind(doc.to_json())
                .execute(&self.pool)
                .await;

            match res {
                Ok(done) if done.rows_affected() == 1 => summary.inserted += 1,
                Ok(_) => summary.failures.push(WriteFailure {
                    id: doc.id().to_string(),
                    reason: "duplicate key".to_string(),
                }),
                Err(e) => {
                    let e = DbError::from(e);
                    if !e.is_document_level() {
                        return Err(e);
                    }
                    summary.failures.push(WriteFailure {
                        id: doc.id().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    #[instrument(skip(self, docs), fields(n = docs.len()))]
    async fn upsert_many(&self, collection: &str, docs: &[NormalizedDocument]) -> Result<WriteSummary> {
        let table = self.table(collection)?;
        // xmax = 0 only for freshly inserted rows; the WHERE clause skips
        // rewriting rows whose body is unchanged, which then return nothing.
        let sql = format!(
            r#"
            INSERT INTO {table} AS t (id, body) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
                SET body = EXCLUDED.body, updated_at = now()
                WHERE t.body IS DISTINCT FROM EXCLUDED.body
            RETURNING (xmax = 0) AS inserted
            "#
        );
        let mut summary = WriteSummary::default();

        for doc in docs {
            let res = sqlx::query(&sql)
                .bind(doc.id())
                .bind(doc.to_json())
                .fetch_optional(&self.pool)
                .await;

            match res {
                Ok(Some(row)) => {
                    if row.try_get::<bool, _>("inserted")? {
                        summary.upserted += 1;
                    } else {
                        summary.matched += 1;
                        summary.modified += 1;
                    }
                }
                Ok(None) => summary.matched += 1,
                Err(e) => {
                    let e = DbError::from(e);
                    if !e.is_document_level() {
                        return Err(e);
                    }
                    summary.failures.push(WriteFailure {
                        id: doc.id().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    async fn count(&self, collection: &str, filter: Option<&FieldFilter>) -> Result<u64> {
        let table = self.table(collection)?;
        let n: i64 = match filter {
            Some(f) => {
                check_identifier(&f.field)?;
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE body->>$1 = $2"))
                    .bind(&f.field)
                    .bind(f.value_text())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(n.max(0) as u64)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let table = self.table(collection)?;
        let body: Option<Value> = sqlx::query_scalar(&format!("SELECT body FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(body)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Collection, schema and field names are spliced into SQL, so only plain
/// lowercase identifiers are accepted.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok && name.len() <= 63 {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// Drop the password from a connection string before it reaches the logs.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut u) => {
            if u.password().is_some() {
                let _ = u.set_password(Some("***"));
            }
            u.to_string()
        }
        Err(_) => "<unparseable connection string>".to_string(),
    }
}
