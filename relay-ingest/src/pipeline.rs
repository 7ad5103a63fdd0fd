use crate::codec;
use crate::error::IngestError;
use crate::fanout::{FanOutWriter, WriteReceipt};
use crate::record;

/// Relay one queue message: decompress, parse, then fan out to the store.
/// Nothing is written unless decoding and parsing both succeed.
pub async fn process_message(
    payload: &[u8],
    writer: &FanOutWriter,
) -> Result<WriteReceipt, IngestError> {
    let decoded = codec::decompress(payload).and_then(|text| {
        tracing::debug!(
            compressed_bytes = payload.len(),
            text_bytes = text.len(),
            "Message decompressed"
        );
        record::parse(&text)
    });

    let record = match decoded {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(
                kind = e.kind(),
                compressed_bytes = payload.len(),
                error = %e,
                "Rejected message before any write"
            );
            return Err(e);
        }
    };

    writer.write(&record).await
}
