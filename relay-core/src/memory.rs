use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::store::{DocumentStore, StoreError};

/// A document as it landed in the in-memory store, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub container: String,
    pub document: Value,
}

/// In-memory implementation of DocumentStore, with per-container failure
/// injection for exercising partial writes.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<Vec<StoredDocument>>>,
    failing: Arc<RwLock<HashSet<String>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(Vec::new())),
            failing: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Make every subsequent insert into `container` fail.
    pub async fn fail_container(&self, container: &str) {
        self.failing.write().await.insert(container.to_string());
    }

    pub async fn documents(&self) -> Vec<StoredDocument> {
        self.documents.read().await.clone()
    }

    pub async fn in_container(&self, container: &str) -> Vec<Value> {
        self.documents
            .read()
            .await
            .iter()
            .filter(|d| d.container == container)
            .map(|d| d.document.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, container: &str, document: &Value) -> Result<(), StoreError> {
        if self.failing.read().await.contains(container) {
            return Err(StoreError::Unavailable(format!(
                "container {} rejected the write",
                container
            )));
        }
        self.documents.write().await.push(StoredDocument {
            container: container.to_string(),
            document: document.clone(),
        });
        Ok(())
    }

    async fn query_all(&self, container: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.in_container(container).await)
    }

    async fn health(&self) -> Result<String, StoreError> {
        Ok(format!("{} documents held", self.count().await))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
