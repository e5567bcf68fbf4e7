//! Message body decoding.
//!
//! Extractors occasionally emit a UTF-8 byte-order mark or wrap the document in
//! a JSON string (`"\"{...}\""`). Both are unwrapped once before the body is
//! read as a [`RawDocument`].

use pricefeed_core::RawDocument;
use serde_json::Value as JsonValue;
use thiserror::Error;

const BOM: char = '\u{feff}';

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document must be an object")]
    NotAnObject,
}

fn strip_bom(s: &str) -> &str {
    s.trim_start_matches(BOM)
}

pub fn decode_body(body: &str) -> Result<RawDocument, DecodeError> {
    let value: JsonValue = serde_json::from_str(strip_bom(body))?;
    let value = match value {
        JsonValue::String(inner) => serde_json::from_str(strip_bom(&inner))?,
        other => other,
    };
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<RawDocument, DecodeError> {
    decode_body(std::str::from_utf8(bytes)?)
}
