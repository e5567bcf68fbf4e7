//! Exhaustive validation of canonical documents.

use chrono::{DateTime, Utc};
use pricefeed_core::{CanonicalDocument, DocType};
use thiserror::Error;

/// Every violated rule, in collection order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

/// A document that passed every rule, with its type and timestamp already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDocument {
    document: CanonicalDocument,
    doc_type: DocType,
    timestamp: DateTime<Utc>,
}

impl ValidatedDocument {
    pub fn document(&self) -> &CanonicalDocument {
        &self.document
    }

    pub fn doc_type(&self) -> DocType {
        self.doc_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn into_document(self) -> CanonicalDocument {
        self.document
    }
}

fn allowed_types() -> String {
    DocType::ALL.map(DocType::as_str).join(", ")
}

fn check_timestamp(value: &str, violations: &mut Vec<String>) -> Option<DateTime<Utc>> {
    if !value.ends_with('Z') {
        violations.push("'timestamp' must be ISO8601 UTC with Z suffix".to_string());
        return None;
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => {
            violations.push("'timestamp' is not a valid date-time".to_string());
            None
        }
    }
}

pub fn validate(doc: &CanonicalDocument) -> Result<ValidatedDocument, ValidationError> {
    let mut violations = Vec::new();

    if doc.provider.trim().is_empty() {
        violations.push("'provider' is too short".to_string());
    }
    if doc.branch.trim().is_empty() {
        violations.push("'branch' is too short".to_string());
    }

    // No coercion here: the normalizer already chose a default for raw input.
    let doc_type = doc.doc_type.parse::<DocType>().ok();
    if doc_type.is_none() {
        violations.push(format!("'type' must be one of [{}]", allowed_types()));
    }

    let timestamp = check_timestamp(&doc.timestamp, &mut violations);

    if doc.items.is_empty() {
        violations.push("'items' must be a non-empty array".to_string());
    }
    for (i, item) in doc.items.iter().enumerate() {
        if item.product.trim().is_empty() {
            violations.push(format!("item[{i}].product is too short"));
        }
        if item.unit.trim().is_empty() {
            violations.push(format!("item[{i}].unit is too short"));
        }
        if !item.price.is_finite() {
            violations.push(format!("item[{i}].price must be a number"));
        } else if item.price < 0.0 {
            violations.push(format!("item[{i}].price must be >= 0"));
        }
    }

    match (doc_type, timestamp) {
        (Some(doc_type), Some(timestamp)) if violations.is_empty() => Ok(ValidatedDocument {
            document: doc.clone(),
            doc_type,
            timestamp,
        }),
        _ => Err(ValidationError { violations }),
    }
}
