//! Decoded form of one queue message.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::IngestError;

pub const INPUT_FIELD: &str = "input_json";
pub const OUTPUT_FIELD: &str = "output_json";
pub const API_OUTPUT_FIELD: &str = "api_output";

/// The three sub-documents carried by every message. Contents are
/// schema-less and passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRecord {
    /// Request payload sent to the upstream API.
    pub input_json: Map<String, Value>,
    /// Normalized response derived from the upstream answer.
    pub output_json: Map<String, Value>,
    /// Raw upstream API response.
    pub api_output: Map<String, Value>,
}

/// Which sub-document a persisted document was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    ApiOutput,
    Input,
    Output,
}

impl DocumentKind {
    /// Fixed order in which a record's documents are persisted.
    pub const WRITE_ORDER: [DocumentKind; 3] = [
        DocumentKind::ApiOutput,
        DocumentKind::Input,
        DocumentKind::Output,
    ];

    pub fn source_field(self) -> &'static str {
        match self {
            DocumentKind::ApiOutput => API_OUTPUT_FIELD,
            DocumentKind::Input => INPUT_FIELD,
            DocumentKind::Output => OUTPUT_FIELD,
        }
    }
}

impl DecodedRecord {
    pub fn field(&self, kind: DocumentKind) -> &Map<String, Value> {
        match kind {
            DocumentKind::ApiOutput => &self.api_output,
            DocumentKind::Input => &self.input_json,
            DocumentKind::Output => &self.output_json,
        }
    }
}

/// Parse decompressed message text. All three fields must be present and
/// be JSON objects; anything else rejects the whole record. Unknown
/// top-level keys are ignored.
pub fn parse(text: &str) -> Result<DecodedRecord, IngestError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::MalformedRecord(format!("invalid JSON: {}", e)))?;

    let mut root = match value {
        Value::Object(map) => map,
        other => {
            return Err(IngestError::MalformedRecord(format!(
                "expected a JSON object, found {}",
                json_type(&other)
            )))
        }
    };

    Ok(DecodedRecord {
        input_json: take_object(&mut root, INPUT_FIELD)?,
        output_json: take_object(&mut root, OUTPUT_FIELD)?,
        api_output: take_object(&mut root, API_OUTPUT_FIELD)?,
    })
}

fn take_object(root: &mut Map<String, Value>, field: &str) -> Result<Map<String, Value>, IngestError> {
    match root.remove(field) {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(IngestError::MalformedRecord(format!(
            "field '{}' must be an object, found {}",
            field,
            json_type(&other)
        ))),
        None => Err(IngestError::MalformedRecord(format!(
            "missing required field '{}'",
            field
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
