//! Relay pipeline: gzip queue message → decoded record → three documents.

pub mod codec;
pub mod error;
pub mod fanout;
pub mod pipeline;
pub mod record;

pub use codec::{compress, decompress};
pub use error::IngestError;
pub use fanout::{stamp_document, stamp_record, FanOutWriter, StampedDocument, WriteReceipt};
pub use pipeline::process_message;
pub use record::{parse, DecodedRecord, DocumentKind};
