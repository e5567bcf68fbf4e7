//! Core domain model for the price ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pricefeed-core";

/// One delivery from the queue transport. Owned by the coordinator for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub message_id: String,
    pub body: String,
    /// Transport handle needed to acknowledge the delivery, if the transport has one.
    pub receipt_handle: Option<String>,
}

impl RawMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
            receipt_handle: None,
        }
    }

    pub fn with_receipt_handle(mut self, handle: impl Into<String>) -> Self {
        self.receipt_handle = Some(handle.into());
        self
    }
}

/// Document kinds published by the extraction stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum DocType {
    #[default]
    #[serde(rename = "pricesFull")]
    PricesFull,
    #[serde(rename = "promoFull")]
    PromoFull,
}

impl DocType {
    pub const ALL: [DocType; 2] = [DocType::PricesFull, DocType::PromoFull];

    pub fn as_str(self) -> &'static str {
        match self {
            DocType::PricesFull => "pricesFull",
            DocType::PromoFull => "promoFull",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDocType(pub String);

impl fmt::Display for UnknownDocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown document type {:?}", self.0)
    }
}

impl std::error::Error for UnknownDocType {}

impl FromStr for DocType {
    type Err = UnknownDocType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownDocType(s.to_string()))
    }
}

/// Inbound message shape before normalization. Every field is optional and
/// scalar fields accept strings, numbers or booleans.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawDocument {
    #[serde(default, deserialize_with = "loose_text")]
    pub provider: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub branch: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "loose_text")]
    pub doc_type: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<RawItem>>,
    #[serde(default, deserialize_with = "loose_text")]
    pub src_key: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawItem {
    #[serde(default, deserialize_with = "loose_text")]
    pub product: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub unit: Option<String>,
    /// Kept as raw JSON: extractors emit both numbers and numeric strings.
    #[serde(default)]
    pub price: Option<JsonValue>,
}

fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Normalized document: trimmed, defaulted, timestamp rendered in UTC.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalDocument {
    pub provider: String,
    pub branch: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub timestamp: String,
    pub items: Vec<LineItem>,
    pub src_key: String,
    pub etag: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineItem {
    pub product: String,
    pub unit: String,
    pub price: f64,
}

/// Composite natural key of a persisted price row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NaturalKey {
    pub provider: String,
    pub branch: String,
    pub doc_type: DocType,
    pub ts: DateTime<Utc>,
    pub product: String,
}

/// The persisted unit. `updated_at` is assigned by the store and is not part of the row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRow {
    pub provider: String,
    pub branch: String,
    pub doc_type: DocType,
    pub ts: DateTime<Utc>,
    pub product: String,
    pub unit: String,
    pub price: f64,
    pub src_key: Option<String>,
    pub etag: Option<String>,
}

impl PriceRow {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            provider: self.provider.clone(),
            branch: self.branch.clone(),
            doc_type: self.doc_type,
            ts: self.ts,
            product: self.product.clone(),
        }
    }
}

/// Payload written to the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub error: String,
    pub original: String,
}

impl DeadLetter {
    pub fn new(error: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            original: original.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "error": self.error, "original": self.original }).to_string()
    }
}
