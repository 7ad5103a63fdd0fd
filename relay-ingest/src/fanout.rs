//! Fan-out writer: one decoded record becomes three correlated documents.
//!
//! Every document gets a fresh `document_id`, the record's shared
//! `message_id`, `id = message_id` and `api_version`. The api_output
//! document also keeps its previous `id` as `original_id` (`null` when the
//! upstream response had none).
//!
//! Writes go out sequentially in `DocumentKind::WRITE_ORDER`. There is no
//! rollback: a failed write leaves the earlier documents in place.

use std::sync::Arc;

use relay_core::{ContainersConfig, DocumentStore};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::IngestError;
use crate::record::{DecodedRecord, DocumentKind};

pub const API_VERSION: &str = "v1";

pub const DOCUMENT_ID_FIELD: &str = "document_id";
pub const MESSAGE_ID_FIELD: &str = "message_id";
pub const ID_FIELD: &str = "id";
pub const API_VERSION_FIELD: &str = "api_version";
pub const ORIGINAL_ID_FIELD: &str = "original_id";

/// A stamped document ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedDocument {
    pub kind: DocumentKind,
    pub document_id: String,
    pub body: Value,
}

/// Identifiers of a fully persisted record, in write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub message_id: String,
    pub document_ids: Vec<String>,
}

/// Copy `source` and stamp identity and lineage fields onto the copy.
pub fn stamp_document(
    source: &Map<String, Value>,
    kind: DocumentKind,
    message_id: &str,
    document_id: &str,
) -> Value {
    let mut document = source.clone();

    if kind == DocumentKind::ApiOutput {
        let original_id = document.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        document.insert(ORIGINAL_ID_FIELD.to_string(), original_id);
    }

    document.insert(DOCUMENT_ID_FIELD.to_string(), Value::from(document_id));
    document.insert(MESSAGE_ID_FIELD.to_string(), Value::from(message_id));
    document.insert(ID_FIELD.to_string(), Value::from(message_id));
    document.insert(API_VERSION_FIELD.to_string(), Value::from(API_VERSION));

    Value::Object(document)
}

/// Stamp all three documents of a record under a single new `message_id`.
pub fn stamp_record(record: &DecodedRecord) -> (String, Vec<StampedDocument>) {
    let message_id = Uuid::new_v4().to_string();
    let documents = DocumentKind::WRITE_ORDER
        .iter()
        .map(|&kind| {
            let document_id = Uuid::new_v4().to_string();
            let body = stamp_document(record.field(kind), kind, &message_id, &document_id);
            StampedDocument {
                kind,
                document_id,
                body,
            }
        })
        .collect();
    (message_id, documents)
}

/// Persists records through a long-lived store handle shared by every
/// invocation in the process.
#[derive(Clone)]
pub struct FanOutWriter {
    store: Arc<dyn DocumentStore>,
    containers: ContainersConfig,
}

impl FanOutWriter {
    pub fn new(store: Arc<dyn DocumentStore>, containers: ContainersConfig) -> Self {
        Self { store, containers }
    }

    pub fn container_for(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::ApiOutput => &self.containers.api_output,
            DocumentKind::Input => &self.containers.input,
            DocumentKind::Output => &self.containers.output,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Stamp and insert the three documents. Not idempotent: each call
    /// produces a new `message_id` and new `document_id`s.
    pub async fn write(&self, record: &DecodedRecord) -> Result<WriteReceipt, IngestError> {
        let (message_id, documents) = stamp_record(record);
        let mut document_ids = Vec::with_capacity(documents.len());

        for (written, stamped) in documents.into_iter().enumerate() {
            let container = self.container_for(stamped.kind);

            if let Err(e) = self.store.insert(container, &stamped.body).await {
                tracing::error!(
                    message_id = %message_id,
                    container = container,
                    written = written,
                    backend = self.store.name(),
                    store_status = ?e.status_code(),
                    error = %e,
                    "Fan-out write failed, earlier documents remain persisted"
                );
                return Err(IngestError::Persistence {
                    container: container.to_string(),
                    written,
                    message_id,
                    source: e,
                });
            }

            tracing::debug!(
                message_id = %message_id,
                document_id = %stamped.document_id,
                container = container,
                "Document persisted"
            );
            document_ids.push(stamped.document_id);
        }

        tracing::info!(
            message_id = %message_id,
            backend = self.store.name(),
            "Record persisted as {} documents",
            document_ids.len()
        );

        Ok(WriteReceipt {
            message_id,
            document_ids,
        })
    }
}
