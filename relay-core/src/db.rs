use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::config::StoreConfig;
use crate::store::{validate_container_name, DocumentStore, StoreError};

/// `endpoint` is the connection URL; a non-empty `key` replaces its password.
pub async fn create_pool(config: &StoreConfig) -> Result<PgPool, sqlx::Error> {
    let mut options = PgConnectOptions::from_str(&config.endpoint)?;
    if !config.key.is_empty() {
        options = options.password(&config.key);
    }
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Each container is a table keyed by the document `id`, with the full
/// document kept as JSONB.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_containers(&self, containers: &[&str]) -> Result<(), StoreError> {
        for container in containers {
            validate_container_name(container)?;
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {container} (
                    id TEXT PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    body JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#
            );
            sqlx::query(&sql).execute(&self.pool).await?;
            tracing::debug!(container = %container, "Ensured container table");
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert(&self, container: &str, document: &Value) -> Result<(), StoreError> {
        validate_container_name(container)?;

        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::MissingPartitionKey("id".to_string()))?;
        let document_id = document
            .get("document_id")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let sql = format!("INSERT INTO {container} (id, document_id, body) VALUES ($1, $2, $3)");
        sqlx::query(&sql)
            .bind(id)
            .bind(document_id)
            .bind(sqlx::types::Json(document))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn query_all(&self, container: &str) -> Result<Vec<Value>, StoreError> {
        validate_container_name(container)?;

        let sql = format!("SELECT body FROM {container} ORDER BY created_at, id");
        let rows: Vec<(Value,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(body,)| body).collect())
    }

    async fn health(&self) -> Result<String, StoreError> {
        Ok(health_check(&self.pool).await?)
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
