//! gzip framing of queue messages.

use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::IngestError;

/// Inflate a gzip payload (one or more members) and decode it as UTF-8.
pub fn decompress(bytes: &[u8]) -> Result<String, IngestError> {
    if bytes.is_empty() {
        return Err(IngestError::Decompression(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty payload",
        )));
    }

    let mut inflated = Vec::new();
    MultiGzDecoder::new(bytes)
        .read_to_end(&mut inflated)
        .map_err(IngestError::Decompression)?;

    Ok(String::from_utf8(inflated)?)
}

pub fn compress(text: &str) -> Result<Vec<u8>, IngestError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(IngestError::Compression)?;
    encoder.finish().map_err(IngestError::Compression)
}
