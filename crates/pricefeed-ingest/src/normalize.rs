//! Coerces loosely-typed raw documents into [`CanonicalDocument`]s.
//!
//! Normalization never rejects data: missing or malformed fields get safe
//! defaults and the validator decides. The one exception is a timestamp that
//! cannot be read as a date-time at all.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use pricefeed_core::{CanonicalDocument, DocType, LineItem, RawDocument, RawItem};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid timestamp {value:?}: expected an ISO-8601 date-time")]
    Timestamp { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeDefaults {
    pub branch: String,
    pub unit: String,
}

impl Default for NormalizeDefaults {
    fn default() -> Self {
        Self {
            branch: "default".to_string(),
            unit: "unit".to_string(),
        }
    }
}

const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Rewrites `Z` as `+00:00` and hour-only offsets (`+02`) as `+02:00`.
fn expand_offset(value: &str) -> String {
    if let Some(stripped) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        return format!("{stripped}+00:00");
    }
    // Date-only values end in `-DD`, which is not an offset.
    if !value.contains(':') {
        return value.to_string();
    }
    let chars: Vec<char> = value.chars().rev().take(3).collect();
    match chars.as_slice() {
        [m, h, sign] if m.is_ascii_digit() && h.is_ascii_digit() && matches!(sign, '+' | '-') => {
            format!("{value}:00")
        }
        _ => value.to_string(),
    }
}

/// Reads ISO-8601 date-times with or without offset. Values without an offset are UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let expanded = expand_offset(value);
    if let Ok(dt) = DateTime::parse_from_rfc3339(&expanded) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&expanded, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn render_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// `2024-01-05T12:00:00+02:00` becomes `2024-01-05T10:00:00Z`.
pub fn canonical_timestamp(value: &str) -> Result<String, NormalizeError> {
    parse_timestamp(value)
        .map(render_timestamp)
        .ok_or_else(|| NormalizeError::Timestamp {
            value: value.to_string(),
        })
}

fn norm_text(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_string()
}

fn norm_price(value: Option<&JsonValue>) -> f64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(JsonValue::Bool(true)) => 1.0,
        _ => 0.0,
    }
}

/// Unrecognized types fall back to `pricesFull`; promotions are never guessed.
fn canonical_doc_type(value: &str) -> DocType {
    value.parse().unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    defaults: NormalizeDefaults,
}

impl Normalizer {
    pub fn new(defaults: NormalizeDefaults) -> Self {
        Self { defaults }
    }

    pub fn normalize(&self, raw: &RawDocument) -> Result<CanonicalDocument, NormalizeError> {
        self.normalize_at(raw, Utc::now())
    }

    /// `now` stands in for a missing timestamp.
    pub fn normalize_at(
        &self,
        raw: &RawDocument,
        now: DateTime<Utc>,
    ) -> Result<CanonicalDocument, NormalizeError> {
        let branch = norm_text(raw.branch.as_deref());
        let raw_ts = norm_text(raw.timestamp.as_deref());
        let timestamp = if raw_ts.is_empty() {
            render_timestamp(now)
        } else {
            canonical_timestamp(&raw_ts)?
        };

        Ok(CanonicalDocument {
            provider: norm_text(raw.provider.as_deref()).to_lowercase(),
            branch: if branch.is_empty() {
                self.defaults.branch.clone()
            } else {
                branch
            },
            doc_type: canonical_doc_type(&norm_text(raw.doc_type.as_deref()))
                .as_str()
                .to_string(),
            timestamp,
            items: raw
                .items
                .iter()
                .flatten()
                .map(|item| self.normalize_item(item))
                .collect(),
            src_key: norm_text(raw.src_key.as_deref()),
            etag: norm_text(raw.etag.as_deref()),
        })
    }

    fn normalize_item(&self, item: &RawItem) -> LineItem {
        let unit = norm_text(item.unit.as_deref());
        LineItem {
            product: norm_text(item.product.as_deref()),
            unit: if unit.is_empty() {
                self.defaults.unit.clone()
            } else {
                unit
            },
            price: norm_price(item.price.as_ref()),
        }
    }
}
