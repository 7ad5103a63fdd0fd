pub mod config;
pub mod cosmos;
pub mod db;
pub mod error;
pub mod memory;
pub mod store;

pub use crate::config::{ContainersConfig, RelayConfig, StoreBackend, StoreConfig};
pub use cosmos::{CosmosConfig, CosmosDocumentStore};
pub use db::PgDocumentStore;
pub use error::RelayError;
pub use memory::{MemoryDocumentStore, StoredDocument};
pub use store::{create_store, DocumentStore, StoreError};
