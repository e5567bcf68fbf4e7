use pricefeed_core::PriceRow;

use crate::validate::ValidatedDocument;

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// One row per line item; document-level fields are copied onto every row.
pub fn to_rows(doc: &ValidatedDocument) -> Vec<PriceRow> {
    let document = doc.document();
    let src_key = non_empty(&document.src_key);
    let etag = non_empty(&document.etag);

    document
        .items
        .iter()
        .map(|item| PriceRow {
            provider: document.provider.clone(),
            branch: document.branch.clone(),
            doc_type: doc.doc_type(),
            ts: doc.timestamp(),
            product: item.product.clone(),
            unit: item.unit.clone(),
            price: item.price,
            src_key: src_key.clone(),
            etag: etag.clone(),
        })
        .collect()
}
