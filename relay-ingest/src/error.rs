use relay_core::StoreError;
use thiserror::Error;

/// Why one message could not be relayed. Every variant ends the invocation;
/// redelivery is left to the queue host.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Decompression error: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("Compression error: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error(
        "Persistence error on container {container} after {written} of 3 documents \
         (message_id {message_id}): {source}"
    )]
    Persistence {
        container: String,
        written: usize,
        message_id: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    /// Short stable label for log fields and host responses.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Decompression(_) => "decompression",
            IngestError::Compression(_) => "compression",
            IngestError::Encoding(_) => "encoding",
            IngestError::MalformedRecord(_) => "malformed_record",
            IngestError::Persistence { .. } => "persistence",
        }
    }

    /// Status the store reported for a failed write, when it reported one
    /// (throttling, conflict, auth).
    pub fn store_status(&self) -> Option<u16> {
        match self {
            IngestError::Persistence { source, .. } => source.status_code(),
            _ => None,
        }
    }
}
