//! Document store abstraction.
//!
//! Provides a `DocumentStore` trait with implementations for:
//! - **Cosmos**: Azure Cosmos DB SQL REST API, master-key auth
//! - **Postgres**: one JSONB table per container
//! - **Memory**: in-process store for tests and dry runs
//!
//! The store handle is built once at process start and shared for the
//! lifetime of the process.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::cosmos::{CosmosConfig, CosmosDocumentStore};
use crate::db::{self, PgDocumentStore};
use crate::memory::MemoryDocumentStore;

// ============================================================================
// DocumentStore trait
// ============================================================================

/// Generic "insert document by container name" access to a document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert one document into the named container. Never updates or
    /// replaces an existing document.
    async fn insert(&self, container: &str, document: &Value) -> Result<(), StoreError>;

    /// Every document of the named container, across all partitions.
    /// Export tooling only; the relay pipeline never reads.
    async fn query_all(&self, container: &str) -> Result<Vec<Value>, StoreError>;

    /// Cheap connectivity probe, returns a backend-specific status string.
    async fn health(&self) -> Result<String, StoreError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid account key: {0}")]
    InvalidKey(String),

    #[error("Invalid container name: {0}")]
    InvalidContainer(String),

    #[error("Document has no usable partition key field '{0}'")]
    MissingPartitionKey(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// HTTP-style status code when the backend reported one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StoreError::Api { code, .. } => Some(*code),
            StoreError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Create the configured backend. Postgres containers are created if missing.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match config.backend {
        StoreBackend::Cosmos => {
            let store = CosmosDocumentStore::new(CosmosConfig::from(config))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let pool = db::create_pool(config).await?;
            let store = PgDocumentStore::new(pool);
            store.ensure_containers(&config.containers.names()).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory document store; documents are not persisted");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}

/// Container names become SQL identifiers and URL path segments.
pub fn validate_container_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidContainer(name.to_string()))
    }
}
